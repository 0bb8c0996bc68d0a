#![allow(dead_code)]

use anyhow::Result;
use peering_coordinator_store::models::{
    self, Asys, LinkType, Owner, PeerSelector, PeeringClient, PolicyRule, Vlan,
};
use peering_coordinator_store::resolver::{self, Event};
use peering_coordinator_store::{Asn, Store};
use sqlx::SqliteConnection;

/// The test topology used throughout the resolver tests: two VLANs, four
/// owners, three ISDs and six ASes, each with a single client attached to
/// both VLANs.
///
/// | AS       | ISD | owner  | core |
/// |----------|-----|--------|------|
/// | ff00:0:0 | 1   | owner1 | yes  |
/// | ff00:0:1 | 1   | owner1 | no   |
/// | ff00:0:2 | 1   | owner2 | yes  |
/// | ff00:0:3 | 1   | owner3 | no   |
/// | ff00:0:4 | 2   | owner3 | no   |
/// | ff00:0:5 | 2   | owner4 | no   |
pub struct Topology {
    pub store: Store,
    pub vlan: Vec<Vlan>,
    pub owner: Vec<Owner>,
    pub asys: Vec<Asys>,
    pub client: Vec<PeeringClient>,
}

pub async fn topology(first_port: u16, last_port: u16) -> Result<Topology> {
    let store = Store::open_in_memory().await?;
    store.init_schema().await?;

    let mut conn = store.acquire().await?;

    let vlan = vec![
        models::create_vlan(&mut conn, "prod", "Production", "10.0.0.0/16".parse()?).await?,
        models::create_vlan(&mut conn, "test", "Testing", "10.1.0.0/16".parse()?).await?,
    ];

    let mut owner = Vec::new();
    for i in 1..=4 {
        owner.push(
            models::create_owner(&mut conn, &format!("owner{i}"), &format!("Owner {i}"), "")
                .await?,
        );
    }

    for (isd_id, name) in [(1, "Region 1"), (2, "Region 2"), (3, "Region 3")] {
        models::create_isd(&mut conn, isd_id, name).await?;
    }

    let spec: [(u64, u16, usize, bool); 6] = [
        (0x00, 1, 0, true),
        (0x01, 1, 0, false),
        (0x02, 1, 1, true),
        (0x03, 1, 2, false),
        (0x04, 2, 2, false),
        (0x05, 2, 3, false),
    ];

    let mut asys = Vec::new();
    for (low, isd_id, owner_idx, is_core) in spec {
        let asn = Asn::new(0xff00_0000_0000 | low)?;
        asys.push(
            models::create_asys(
                &mut conn,
                asn,
                isd_id,
                owner[owner_idx].id,
                is_core,
                &format!("AS {low}"),
            )
            .await?,
        );
    }

    let mut client = Vec::new();
    for asys in &asys {
        client.push(models::create_peering_client(&mut conn, asys.id, "default").await?);
    }

    for vlan in &vlan {
        for client in &client {
            models::create_interface(&mut conn, client, vlan, None, first_port, last_port).await?;
        }
    }

    Ok(Topology {
        store,
        vlan,
        owner,
        asys,
        client,
    })
}

/// Creates a policy and applies it, like a primary client would through the
/// API. Returns the notifications link reconciliation produced.
pub async fn apply_policy(
    conn: &mut SqliteConnection,
    vlan: &Vlan,
    asys: &Asys,
    accept: bool,
    peer: PeerSelector,
) -> Result<Vec<Event>> {
    let rule = PolicyRule {
        vlan: vlan.name.clone(),
        asn: asys.asn,
        accept,
        peer,
    };
    models::create_policy(&mut *conn, &rule).await?;

    reconcile(conn, vlan, asys).await
}

/// Deletes a policy and applies the change.
pub async fn revoke_policy(
    conn: &mut SqliteConnection,
    vlan: &Vlan,
    asys: &Asys,
    accept: bool,
    peer: PeerSelector,
) -> Result<Vec<Event>> {
    let rule = PolicyRule {
        vlan: vlan.name.clone(),
        asn: asys.asn,
        accept,
        peer,
    };
    assert!(models::delete_policy(&mut *conn, &rule).await?);

    reconcile(conn, vlan, asys).await
}

pub async fn reconcile(
    conn: &mut SqliteConnection,
    vlan: &Vlan,
    asys: &Asys,
) -> Result<Vec<Event>> {
    resolver::update_accepted_peers(&mut *conn, vlan, asys).await?;

    let mut events = Vec::new();
    resolver::update_links(&mut *conn, vlan, asys, &mut events).await?;

    Ok(events)
}

pub async fn accepted_count(conn: &mut SqliteConnection, vlan: &Vlan, asys: &Asys) -> Result<usize> {
    Ok(models::accepted_peer_ids(&mut *conn, vlan.id, asys.id)
        .await?
        .len())
}

/// Whether the interfaces of two ASes are linked in the VLAN, with every
/// link of the expected type.
pub async fn links_exist(
    conn: &mut SqliteConnection,
    vlan: &Vlan,
    as_a: &Asys,
    as_b: &Asys,
    link_type: LinkType,
) -> Result<bool> {
    let links = models::links_between(&mut *conn, vlan.id, as_a.id, as_b.id).await?;

    for link in &links {
        assert_eq!(link.link_type, link_type);
    }

    Ok(!links.is_empty())
}
