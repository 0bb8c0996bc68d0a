//! Applies peering policies to the derived state.
//!
//! `update_accepted_peers` recomputes which peers an AS accepts in a VLAN,
//! `update_links` reconciles the physical link set against mutual
//! acceptance. Both run on the caller's transaction; side effects destined
//! for connected clients are collected as [`Event`]s and must only be
//! delivered after the transaction committed.

use std::net::IpAddr;

use ahash::HashSet;
use sqlx::SqliteConnection;

use crate::asn::Asn;
use crate::error::{Result, StoreError};
use crate::models::{self, Asys, Interface, LinkDetail, LinkType, Vlan};

/// A notification for the clients of one AS, produced by link
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A link involving the AS was created or destroyed. `local` is the
    /// receiving AS's side.
    LinkUpdate {
        asn: Asn,
        created: bool,
        link_type: LinkType,
        peer_asn: Asn,
        local_ip: IpAddr,
        local_port: u16,
        remote_ip: IpAddr,
        remote_port: u16,
    },
    /// A link could not be materialised; the triggering RPC has already
    /// succeeded, so the failure is reported asynchronously.
    CreationFailed { asn: Asn, message: String },
}

/// The two per-side updates announcing a created or destroyed link.
pub fn link_events(link: &LinkDetail, created: bool) -> [Event; 2] {
    [
        Event::LinkUpdate {
            asn: link.asn_a,
            created,
            link_type: link.link_type,
            peer_asn: link.asn_b,
            local_ip: link.ip_a,
            local_port: link.port_a,
            remote_ip: link.ip_b,
            remote_port: link.port_b,
        },
        Event::LinkUpdate {
            asn: link.asn_b,
            created,
            link_type: link.link_type,
            peer_asn: link.asn_a,
            local_ip: link.ip_b,
            local_port: link.port_b,
            remote_ip: link.ip_a,
            remote_port: link.port_a,
        },
    ]
}

/// Restores the accepted-peer relation of `(vlan, asys)` to the value
/// implied by the current policies, writing a minimal diff.
pub async fn update_accepted_peers(
    conn: &mut SqliteConnection,
    vlan: &Vlan,
    asys: &Asys,
) -> Result<()> {
    let old = models::accepted_peer_ids(conn, vlan.id, asys.id).await?;
    let new = accepted_peers(conn, vlan, asys).await?;

    for peer_id in old.difference(&new) {
        models::delete_accepted_peer(conn, vlan.id, asys.id, *peer_id).await?;
    }

    for peer_id in new.difference(&old) {
        models::insert_accepted_peer(conn, vlan.id, asys.id, *peer_id).await?;
    }

    Ok(())
}

/// The set of ASes `asys` accepts for peering in `vlan`.
///
/// More specific policies override less specific ones: AS over owner over
/// ISD over the default policy. The same target cannot be accepted and
/// rejected at the same rank, the policy tables are unique per target.
async fn accepted_peers(
    conn: &mut SqliteConnection,
    vlan: &Vlan,
    asys: &Asys,
) -> Result<HashSet<i64>> {
    let as_accept = models::as_policy_peers(conn, vlan.id, asys.id, true).await?;
    let as_reject = models::as_policy_peers(conn, vlan.id, asys.id, false).await?;
    let owner_accept = models::owner_policy_members(conn, vlan.id, asys.id, true).await?;
    let owner_reject = models::owner_policy_members(conn, vlan.id, asys.id, false).await?;
    let isd_accept = models::isd_policy_members(conn, vlan.id, asys.id, true).await?;

    let mut accept = as_accept;

    for id in owner_accept {
        if !as_reject.contains(&id) {
            accept.insert(id);
        }
    }

    for id in isd_accept {
        if !owner_reject.contains(&id) && !as_reject.contains(&id) {
            accept.insert(id);
        }
    }

    if models::default_policy_accept(conn, vlan.id, asys.id).await? {
        let isd_reject = models::isd_policy_members(conn, vlan.id, asys.id, false).await?;
        for id in models::vlan_member_ids(conn, vlan.id).await? {
            if id != asys.id
                && !isd_reject.contains(&id)
                && !owner_reject.contains(&id)
                && !as_reject.contains(&id)
            {
                accept.insert(id);
            }
        }
    }

    Ok(accept)
}

/// Creates and deletes links of `asys` in `vlan` to match mutual acceptance.
///
/// Reads the accepted-peer relation instead of evaluating policies
/// directly; `update_accepted_peers` must have run for every AS whose
/// policies changed. Idempotent: a second run on unchanged state performs no
/// writes and produces no events.
pub async fn update_links(
    conn: &mut SqliteConnection,
    vlan: &Vlan,
    asys: &Asys,
    events: &mut Vec<Event>,
) -> Result<()> {
    let old = models::linked_peer_ids(conn, vlan.id, asys.id).await?;
    let new = models::mutually_accepted_peer_ids(conn, vlan.id, asys.id).await?;

    // Process peers in a stable order so port assignment and event order do
    // not depend on hash iteration.
    let mut remove: Vec<i64> = old.difference(&new).copied().collect();
    remove.sort_unstable();
    let mut add: Vec<i64> = new.difference(&old).copied().collect();
    add.sort_unstable();

    for peer_id in &remove {
        for link in models::links_between(conn, vlan.id, asys.id, *peer_id).await? {
            models::delete_link(conn, link.id).await?;
            events.extend(link_events(&link, false));
            log::info!(
                "destroyed {:?} link {}:{} <-> {}:{}",
                link.link_type,
                link.ip_a,
                link.port_a,
                link.ip_b,
                link.port_b
            );
        }
    }

    for peer_id in &add {
        let peer = models::asys_by_id(conn, *peer_id)
            .await?
            .ok_or(StoreError::NotFound("AS"))?;
        create_links(conn, vlan, asys, &peer, events).await?;
    }

    Ok(())
}

/// Creates links between every interface pair of two mutually accepting
/// ASes. The link type follows from the AS types; for provider links the
/// core AS takes the A side.
async fn create_links(
    conn: &mut SqliteConnection,
    vlan: &Vlan,
    as_a: &Asys,
    as_b: &Asys,
    events: &mut Vec<Event>,
) -> Result<()> {
    let (as_a, as_b, link_type) = if as_a.is_core && as_b.is_core {
        (as_a, as_b, LinkType::Core)
    } else if !as_a.is_core && !as_b.is_core {
        (as_a, as_b, LinkType::Peering)
    } else if as_a.isd_id == as_b.isd_id {
        if as_a.is_core {
            (as_a, as_b, LinkType::Provider)
        } else {
            (as_b, as_a, LinkType::Provider)
        }
    } else {
        // Core and non-core in different ISDs cannot be linked.
        let message = format!(
            "Cannot create a link between ASes {} and {} of incompatible type.",
            as_a.label(),
            as_b.label()
        );
        events.push(Event::CreationFailed {
            asn: as_a.asn,
            message: message.clone(),
        });
        events.push(Event::CreationFailed {
            asn: as_b.asn,
            message,
        });
        return Ok(());
    };

    for interface_a in models::interfaces_of_asys_in_vlan(conn, as_a.id, vlan.id).await? {
        for interface_b in models::interfaces_of_asys_in_vlan(conn, as_b.id, vlan.id).await? {
            let port_a = allocate_port(conn, &interface_a, as_a, events).await?;
            let port_b = allocate_port(conn, &interface_b, as_b, events).await?;

            let (Some(port_a), Some(port_b)) = (port_a, port_b) else {
                continue;
            };

            models::create_link(conn, link_type, interface_a.id, port_a, interface_b.id, port_b)
                .await?;
            log::info!(
                "created {:?} link {}:{} <-> {}:{}",
                link_type,
                interface_a.public_ip,
                port_a,
                interface_b.public_ip,
                port_b
            );

            events.extend(link_events(
                &LinkDetail {
                    id: 0,
                    link_type,
                    interface_a: interface_a.id,
                    asn_a: as_a.asn,
                    ip_a: interface_a.public_ip,
                    port_a,
                    interface_b: interface_b.id,
                    asn_b: as_b.asn,
                    ip_b: interface_b.public_ip,
                    port_b,
                },
                true,
            ));
        }
    }

    Ok(())
}

/// Picks a free port, converting exhaustion into an async error for the
/// interface's AS.
async fn allocate_port(
    conn: &mut SqliteConnection,
    interface: &Interface,
    owner: &Asys,
    events: &mut Vec<Event>,
) -> Result<Option<u16>> {
    match models::unused_port(conn, interface).await {
        Ok(port) => Ok(Some(port)),
        Err(StoreError::NoUnusedPorts(_)) => {
            events.push(Event::CreationFailed {
                asn: owner.asn,
                message: format!(
                    "Allocated port range is exhausted on interface {}.",
                    interface.public_ip
                ),
            });
            Ok(None)
        }
        Err(err) => Err(err),
    }
}
