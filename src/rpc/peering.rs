//! The peering coordination service.
//!
//! Carries the persistent client streams and the policy CRUD surface.
//! Every write runs in a single store transaction spanning the policy
//! change, the resolver and link reconciliation; notifications are fanned
//! out through the registry only after the transaction committed.

use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;

use store::models::{self, LinkDetail, LinkType, PeerSelector, PolicyRule};
use store::resolver::{self, Event};
use store::{Asn, Store};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use super::status_from_store;
use crate::auth;
use crate::proto::peering::{
    ArbitrationUpdate, AsyncError, Endpoint, LinkUpdate, ListPolicyRequest, Policy, PortRange,
    SetPoliciesRequest, SetPoliciesResponse, StreamMessageRequest, StreamMessageResponse,
    arbitration_update::Status as ArbitrationStatus,
    async_error::Code,
    link_update, list_policy_request,
    peering_server::Peering,
    policy::Peer,
    stream_message_request,
};
use crate::registry::{AsConnections, ClientConn, Command, Registry};

pub struct PeeringService {
    store: Store,
    registry: Arc<Registry>,
}

impl PeeringService {
    pub fn new(store: Store, registry: Arc<Registry>) -> Self {
        Self { store, registry }
    }

    fn assert_policy_write_permission(
        &self,
        asn: Asn,
        client: &str,
        vlan: Option<&str>,
    ) -> Result<(), Status> {
        if !self.registry.is_primary(asn, client, vlan) {
            return Err(Status::permission_denied("Insufficient permissions"));
        }

        Ok(())
    }
}

fn policy_from_proto(message: &Policy) -> Result<PolicyRule, Status> {
    let asn: Asn = message
        .asn
        .parse()
        .map_err(|_| Status::invalid_argument("Invalid ASN"))?;

    let peer = match &message.peer {
        None | Some(Peer::PeerEveryone(())) => PeerSelector::Everyone,
        Some(Peer::PeerAsn(peer_asn)) => PeerSelector::Asys(
            peer_asn
                .parse()
                .map_err(|_| Status::invalid_argument("Invalid ASN"))?,
        ),
        Some(Peer::PeerOwner(name)) => PeerSelector::Owner(name.clone()),
        Some(Peer::PeerIsd(isd)) => PeerSelector::Isd(
            isd.parse()
                .map_err(|_| Status::invalid_argument("Invalid ISD"))?,
        ),
    };

    Ok(PolicyRule {
        vlan: message.vlan.clone(),
        asn,
        accept: message.accept,
        peer,
    })
}

fn policy_to_proto(rule: &PolicyRule) -> Policy {
    Policy {
        vlan: rule.vlan.clone(),
        asn: rule.asn.to_string(),
        accept: rule.accept,
        // Default policies leave the peer unset, like clients send them.
        peer: match &rule.peer {
            PeerSelector::Everyone => None,
            PeerSelector::Asys(asn) => Some(Peer::PeerAsn(asn.to_string())),
            PeerSelector::Owner(name) => Some(Peer::PeerOwner(name.clone())),
            PeerSelector::Isd(isd) => Some(Peer::PeerIsd(isd.to_string())),
        },
    }
}

fn proto_link_type(link_type: LinkType) -> link_update::LinkType {
    match link_type {
        LinkType::Core => link_update::LinkType::Core,
        LinkType::Peering => link_update::LinkType::Peering,
        LinkType::Provider => link_update::LinkType::Provider,
    }
}

fn link_update_message(
    created: bool,
    link_type: LinkType,
    peer_asn: Asn,
    local: (IpAddr, u16),
    remote: (IpAddr, u16),
) -> LinkUpdate {
    LinkUpdate {
        r#type: if created {
            link_update::Type::Create
        } else {
            link_update::Type::Destroy
        } as i32,
        link_type: proto_link_type(link_type) as i32,
        peer_asn: peer_asn.to_string(),
        local: Some(Endpoint {
            ip: local.0.to_string(),
            port: local.1 as u32,
        }),
        remote: Some(Endpoint {
            ip: remote.0.to_string(),
            port: remote.1 as u32,
        }),
    }
}

/// A CREATE update for an existing link, oriented so the given interface is
/// the local side.
fn replay_link_update(link: &LinkDetail, local_interface: i64) -> LinkUpdate {
    if link.interface_a == local_interface {
        link_update_message(
            true,
            link.link_type,
            link.asn_b,
            (link.ip_a, link.port_a),
            (link.ip_b, link.port_b),
        )
    } else {
        link_update_message(
            true,
            link.link_type,
            link.asn_a,
            (link.ip_b, link.port_b),
            (link.ip_a, link.port_a),
        )
    }
}

/// Delivers the events collected during a committed transaction to the
/// affected clients.
fn dispatch_events(registry: &Registry, events: Vec<Event>) {
    for event in events {
        match event {
            Event::LinkUpdate {
                asn,
                created,
                link_type,
                peer_asn,
                local_ip,
                local_port,
                remote_ip,
                remote_port,
            } => registry.send_link_update(
                asn,
                link_update_message(
                    created,
                    link_type,
                    peer_asn,
                    (local_ip, local_port),
                    (remote_ip, remote_port),
                ),
            ),
            Event::CreationFailed { asn, message } => registry.send_async_error(
                asn,
                AsyncError {
                    code: Code::LinkCreationFailed as i32,
                    message,
                },
            ),
        }
    }
}

/// Resolves which VLANs an arbitration request applies to. Without an
/// explicit VLAN the election covers every VLAN the client has an interface
/// on.
async fn arbitration_vlans(
    store: &Store,
    asn: Asn,
    client: &str,
    update: &ArbitrationUpdate,
) -> Result<Vec<String>, Status> {
    let mut conn = store.acquire().await.map_err(status_from_store)?;

    let asys = models::asys_by_asn(&mut conn, asn)
        .await
        .map_err(status_from_store)?
        .ok_or_else(|| Status::not_found("AS does not exist"))?;
    let client = models::client_by_name(&mut conn, asys.id, client)
        .await
        .map_err(status_from_store)?
        .ok_or_else(|| Status::not_found("Client does not exist"))?;

    let names = models::client_vlan_names(&mut conn, client.id)
        .await
        .map_err(status_from_store)?;

    match &update.vlan {
        Some(vlan) => {
            if names.iter().any(|name| name == vlan) {
                Ok(vec![vlan.clone()])
            } else {
                Err(Status::not_found("Client has no interface on the VLAN"))
            }
        }
        None => Ok(names),
    }
}

async fn handle_arbitration(
    store: &Store,
    connections: &AsConnections,
    requester: &ClientConn,
    update: ArbitrationUpdate,
) {
    match arbitration_vlans(store, connections.asn(), requester.name(), &update).await {
        Ok(vlans) => connections.arbitrate(requester.name(), &vlans, update.election_id),
        Err(_) => {
            let mut echo = update;
            echo.status = ArbitrationStatus::Error as i32;
            requester.send_arbitration_update(echo);
        }
    }
}

#[tonic::async_trait]
impl Peering for PeeringService {
    type StreamChannelStream = UnboundedReceiverStream<Result<StreamMessageResponse, Status>>;

    /// Server side of the persistent bidirectional stream.
    ///
    /// Two tasks drive each stream: a reader pulling requests from the
    /// inbound half, and a writer draining the connection's command queue
    /// into the outbound half. The reader hands requests to the writer, so
    /// a single task observes the connection state. When the reader signals
    /// the end of the request stream the writer unregisters the connection,
    /// which re-arbitrates any VLAN this client was primary of.
    async fn stream_channel(
        &self,
        request: Request<Streaming<StreamMessageRequest>>,
    ) -> Result<Response<Self::StreamChannelStream>, Status> {
        let (asn, client_name) = auth::authenticate(&self.store, request.metadata()).await?;

        let mut conn_db = self.store.acquire().await.map_err(status_from_store)?;
        let asys = models::asys_by_asn(&mut conn_db, asn)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::not_found("ASN not found"))?;
        let client = models::client_by_name(&mut conn_db, asys.id, &client_name)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::not_found("Client not found"))?;

        let (connections, conn, mut commands) = self
            .registry
            .create_connection(asn, &client_name)
            .map_err(|err| Status::already_exists(err.to_string()))?;

        // Replay all existing links so a (re)connecting client can
        // materialise its current state.
        for interface in models::interfaces_of_client(&mut conn_db, client.id)
            .await
            .map_err(status_from_store)?
        {
            for link in models::links_of_interface(&mut conn_db, interface.id)
                .await
                .map_err(status_from_store)?
            {
                conn.send_link_update(replay_link_update(&link, interface.id));
            }
        }
        drop(conn_db);

        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let reader_conn = conn.clone();
        let mut in_stream = request.into_inner();
        tokio::spawn(async move {
            while let Ok(Some(request)) = in_stream.message().await {
                reader_conn.process_request(request);
            }

            reader_conn.request_stream_closed();
        });

        let store = self.store.clone();
        let registry = self.registry.clone();
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    Command::Exit => break,
                    Command::ProcessRequest(request) => {
                        if let Some(stream_message_request::Request::Arbitration(update)) =
                            request.request
                        {
                            handle_arbitration(&store, &connections, &conn, update).await;
                        }
                    }
                    Command::SendResponse(response) => {
                        // The receiving side is gone once the RPC finished;
                        // stop draining in that case.
                        if out_tx.send(Ok(response)).is_err() {
                            break;
                        }
                    }
                }
            }

            registry.destroy_connection(asn, conn.name());
        });

        Ok(Response::new(UnboundedReceiverStream::new(out_rx)))
    }

    /// Set the UDP port range used for SCION underlay connections.
    ///
    /// Shrinking the range destroys all links of the interface and lets
    /// reconciliation recreate them inside the new bounds.
    async fn set_port_range(
        &self,
        request: Request<PortRange>,
    ) -> Result<Response<()>, Status> {
        let (asn, client_name) = auth::authenticate(&self.store, request.metadata()).await?;
        let message = request.into_inner();

        let mut tx = self.store.begin().await.map_err(status_from_store)?;

        let vlan = models::vlan_by_name(&mut tx, &message.interface_vlan)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::not_found("VLAN does not exist"))?;
        let ip: IpAddr = message
            .interface_ip
            .parse()
            .map_err(|_| Status::invalid_argument("Invalid IP address"))?;
        let interface = models::interface_by_vlan_ip(&mut tx, vlan.id, ip)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::not_found("Interface not found"))?;

        self.assert_policy_write_permission(asn, &client_name, Some(vlan.name.as_str()))?;

        let first_port = u16::try_from(message.first_port)
            .map_err(|_| Status::invalid_argument("Invalid port range"))?;
        let last_port = u16::try_from(message.last_port)
            .map_err(|_| Status::invalid_argument("Invalid port range"))?;

        // Growing the range keeps every allocated port valid; anything else
        // forces the links off the interface and back through allocation.
        let recreate_links =
            !(first_port <= interface.first_port && last_port >= interface.last_port);

        models::update_interface_ports(&mut tx, interface.id, first_port, last_port)
            .await
            .map_err(status_from_store)?;

        let mut events = Vec::new();
        if recreate_links {
            let owner = models::asys_of_interface(&mut tx, interface.id)
                .await
                .map_err(status_from_store)?;

            for link in models::links_of_interface(&mut tx, interface.id)
                .await
                .map_err(status_from_store)?
            {
                models::delete_link(&mut tx, link.id)
                    .await
                    .map_err(status_from_store)?;
                events.extend(resolver::link_events(&link, false));
            }

            resolver::update_links(&mut tx, &vlan, &owner, &mut events)
                .await
                .map_err(status_from_store)?;
        }

        tx.commit().await.map_err(|e| status_from_store(e.into()))?;
        dispatch_events(&self.registry, events);

        Ok(Response::new(()))
    }

    type ListPoliciesStream = Pin<Box<dyn Stream<Item = Result<Policy, Status>> + Send>>;

    /// List policies of the AS making the request.
    async fn list_policies(
        &self,
        request: Request<ListPolicyRequest>,
    ) -> Result<Response<Self::ListPoliciesStream>, Status> {
        let (asn, _client_name) = auth::authenticate(&self.store, request.metadata()).await?;
        let message = request.into_inner();

        if !message.asn.is_empty() && message.asn != asn.to_string() {
            return Err(Status::permission_denied(
                "Cannot list policies of other ASes",
            ));
        }

        let empty =
            || -> Self::ListPoliciesStream { Box::pin(tokio_stream::iter(Vec::new())) };

        let mut conn = self.store.acquire().await.map_err(status_from_store)?;
        let asys = models::asys_by_asn(&mut conn, asn)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::not_found("AS does not exist"))?;

        let vlan_id = if message.vlan.is_empty() {
            None
        } else {
            match models::vlan_by_name(&mut conn, &message.vlan)
                .await
                .map_err(status_from_store)?
            {
                Some(vlan) => Some(vlan.id),
                None => return Ok(Response::new(empty())),
            }
        };
        let accept = message.accept;

        let mut rules = Vec::new();
        match &message.peer {
            None => {
                rules.extend(
                    models::list_default_policies(&mut conn, asys.id, vlan_id, accept)
                        .await
                        .map_err(status_from_store)?,
                );
                rules.extend(
                    models::list_as_policies(&mut conn, asys.id, vlan_id, accept, None)
                        .await
                        .map_err(status_from_store)?,
                );
                rules.extend(
                    models::list_owner_policies(&mut conn, asys.id, vlan_id, accept, None)
                        .await
                        .map_err(status_from_store)?,
                );
                rules.extend(
                    models::list_isd_policies(&mut conn, asys.id, vlan_id, accept, None)
                        .await
                        .map_err(status_from_store)?,
                );
            }
            Some(list_policy_request::Peer::PeerEveryone(())) => {
                rules.extend(
                    models::list_default_policies(&mut conn, asys.id, vlan_id, accept)
                        .await
                        .map_err(status_from_store)?,
                );
            }
            Some(list_policy_request::Peer::PeerAsn(peer_asn)) => {
                let peer_asn: Asn = peer_asn
                    .parse()
                    .map_err(|_| Status::invalid_argument("Invalid ASN"))?;
                match models::asys_by_asn(&mut conn, peer_asn)
                    .await
                    .map_err(status_from_store)?
                {
                    Some(peer) => rules.extend(
                        models::list_as_policies(&mut conn, asys.id, vlan_id, accept, Some(peer.id))
                            .await
                            .map_err(status_from_store)?,
                    ),
                    None => return Ok(Response::new(empty())),
                }
            }
            Some(list_policy_request::Peer::PeerOwner(name)) => {
                match models::owner_by_name(&mut conn, name)
                    .await
                    .map_err(status_from_store)?
                {
                    Some(owner) => rules.extend(
                        models::list_owner_policies(
                            &mut conn,
                            asys.id,
                            vlan_id,
                            accept,
                            Some(owner.id),
                        )
                        .await
                        .map_err(status_from_store)?,
                    ),
                    None => return Ok(Response::new(empty())),
                }
            }
            Some(list_policy_request::Peer::PeerIsd(isd)) => {
                let isd: u16 = isd
                    .parse()
                    .map_err(|_| Status::invalid_argument("Invalid ISD"))?;
                rules.extend(
                    models::list_isd_policies(&mut conn, asys.id, vlan_id, accept, Some(isd))
                        .await
                        .map_err(status_from_store)?,
                );
            }
        }

        let messages: Vec<Result<Policy, Status>> =
            rules.iter().map(|rule| Ok(policy_to_proto(rule))).collect();

        Ok(Response::new(Box::pin(tokio_stream::iter(messages))))
    }

    /// Create a new policy and reconcile the affected VLAN.
    async fn create_policy(&self, request: Request<Policy>) -> Result<Response<Policy>, Status> {
        let (asn, client_name) = auth::authenticate(&self.store, request.metadata()).await?;
        let message = request.into_inner();
        let rule = policy_from_proto(&message)?;

        if rule.asn != asn {
            return Err(Status::permission_denied(
                "Cannot create policies for other ASes",
            ));
        }

        let mut tx = self.store.begin().await.map_err(status_from_store)?;

        let vlan = models::vlan_by_name(&mut tx, &rule.vlan)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::invalid_argument("VLAN does not exist."))?;
        let asys = models::asys_by_asn(&mut tx, asn)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::invalid_argument("AS does not exist."))?;

        self.assert_policy_write_permission(asn, &client_name, Some(vlan.name.as_str()))?;

        models::create_policy(&mut tx, &rule)
            .await
            .map_err(status_from_store)?;

        resolver::update_accepted_peers(&mut tx, &vlan, &asys)
            .await
            .map_err(status_from_store)?;
        let mut events = Vec::new();
        resolver::update_links(&mut tx, &vlan, &asys, &mut events)
            .await
            .map_err(status_from_store)?;

        tx.commit().await.map_err(|e| status_from_store(e.into()))?;
        dispatch_events(&self.registry, events);

        Ok(Response::new(message))
    }

    /// Delete a policy and reconcile the affected VLAN.
    async fn destroy_policy(&self, request: Request<Policy>) -> Result<Response<()>, Status> {
        let (asn, client_name) = auth::authenticate(&self.store, request.metadata()).await?;
        let message = request.into_inner();
        let rule = policy_from_proto(&message)?;

        if rule.asn != asn {
            return Err(Status::permission_denied(
                "Cannot delete policies of other ASes",
            ));
        }

        let mut tx = self.store.begin().await.map_err(status_from_store)?;

        let vlan = models::vlan_by_name(&mut tx, &rule.vlan)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::invalid_argument("VLAN does not exist."))?;
        let asys = models::asys_by_asn(&mut tx, asn)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::invalid_argument("AS does not exist."))?;

        if !models::policy_exists(&mut tx, &rule)
            .await
            .map_err(status_from_store)?
        {
            return Err(Status::not_found("Policy does not exist"));
        }

        self.assert_policy_write_permission(asn, &client_name, Some(vlan.name.as_str()))?;

        models::delete_policy(&mut tx, &rule)
            .await
            .map_err(status_from_store)?;

        resolver::update_accepted_peers(&mut tx, &vlan, &asys)
            .await
            .map_err(status_from_store)?;
        let mut events = Vec::new();
        resolver::update_links(&mut tx, &vlan, &asys, &mut events)
            .await
            .map_err(status_from_store)?;

        tx.commit().await.map_err(|e| status_from_store(e.into()))?;
        dispatch_events(&self.registry, events);

        Ok(Response::new(()))
    }

    /// Replace existing policies in one or all VLANs.
    ///
    /// Rejected policies are collected with matching error strings. Unless
    /// `continue_on_error` is set, any rejection rolls the whole replacement
    /// back; the rejection list is returned either way.
    async fn set_policies(
        &self,
        request: Request<SetPoliciesRequest>,
    ) -> Result<Response<SetPoliciesResponse>, Status> {
        let (asn, client_name) = auth::authenticate(&self.store, request.metadata()).await?;
        let message = request.into_inner();

        let mut tx = self.store.begin().await.map_err(status_from_store)?;

        let asys = models::asys_by_asn(&mut tx, asn)
            .await
            .map_err(status_from_store)?
            .ok_or_else(|| Status::not_found("AS does not exist"))?;

        let vlan_filter = if message.vlan.is_empty() {
            None
        } else {
            Some(
                models::vlan_by_name(&mut tx, &message.vlan)
                    .await
                    .map_err(status_from_store)?
                    .ok_or_else(|| Status::not_found("VLAN does not exist"))?,
            )
        };

        self.assert_policy_write_permission(
            asn,
            &client_name,
            vlan_filter.as_ref().map(|vlan| vlan.name.as_str()),
        )?;

        models::delete_policies_of_asys(&mut tx, asys.id, vlan_filter.as_ref().map(|vlan| vlan.id))
            .await
            .map_err(status_from_store)?;

        let mut rejected_policies = Vec::new();
        let mut errors = Vec::new();

        for policy in &message.policies {
            let rule = match policy_from_proto(policy) {
                Ok(rule) => rule,
                Err(status) => {
                    rejected_policies.push(policy.clone());
                    errors.push(status.message().to_string());
                    continue;
                }
            };

            if rule.asn != asn {
                rejected_policies.push(policy.clone());
                errors.push("Policy ASN belongs to foreign AS".to_string());
                continue;
            }

            if let Some(vlan) = &vlan_filter {
                if rule.vlan != vlan.name {
                    rejected_policies.push(policy.clone());
                    errors.push("VLAN excluded by filter".to_string());
                    continue;
                }
            }

            match models::create_policy(&mut tx, &rule).await {
                Ok(()) => {}
                Err(err @ (store::StoreError::Validation(_) | store::StoreError::AlreadyExists(_))) => {
                    rejected_policies.push(policy.clone());
                    errors.push(err.to_string());
                }
                Err(err) => return Err(status_from_store(err)),
            }
        }

        if !errors.is_empty() && !message.continue_on_error {
            tx.rollback().await.map_err(|e| status_from_store(e.into()))?;

            return Ok(Response::new(SetPoliciesResponse {
                rejected_policies,
                errors,
            }));
        }

        let mut events = Vec::new();
        for vlan in models::connected_vlans(&mut tx, asys.id)
            .await
            .map_err(status_from_store)?
        {
            resolver::update_accepted_peers(&mut tx, &vlan, &asys)
                .await
                .map_err(status_from_store)?;
            resolver::update_links(&mut tx, &vlan, &asys, &mut events)
                .await
                .map_err(status_from_store)?;
        }

        tx.commit().await.map_err(|e| status_from_store(e.into()))?;
        dispatch_events(&self.registry, events);

        Ok(Response::new(SetPoliciesResponse {
            rejected_policies,
            errors,
        }))
    }
}
