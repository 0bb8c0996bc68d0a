//! Registry of the persistent streams maintained with every peering client.
//!
//! Peering clients receive push notifications (link updates, arbitration
//! results, asynchronous errors) on a persistent bidirectional gRPC stream.
//! Three layers track these streams:
//!
//! - [`ClientConn`] is the sending half of one connection's outbound command
//!   queue, allowing tasks other than the stream handler to enqueue
//!   messages.
//! - [`AsConnections`] aggregates the connections of one AS and elects the
//!   primary client per VLAN.
//! - [`Registry`] maps AS numbers to their connection collections. It is
//!   passed into every RPC service as an explicit dependency.

use std::sync::Arc;

use ahash::HashMap;
use parking_lot::Mutex;
use store::Asn;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::proto::peering::{
    ArbitrationUpdate, AsyncError, LinkUpdate, StreamMessageRequest, StreamMessageResponse,
    arbitration_update::Status as ArbitrationStatus, stream_message_response::Response,
};

/// Command processed by a connection's stream writer task.
pub enum Command {
    /// The request half closed; the writer terminates the stream.
    Exit,
    /// A request received by the reader, handled on the writer task.
    ProcessRequest(StreamMessageRequest),
    /// A response to emit on the stream.
    SendResponse(StreamMessageResponse),
}

/// Sending half of one client connection's outbound queue.
///
/// Sends never block; messages enqueued after the connection closed are
/// silently dropped.
#[derive(Clone)]
pub struct ClientConn {
    name: String,
    queue: UnboundedSender<Command>,
}

impl ClientConn {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Posts a request received by the reader task to the writer task.
    pub fn process_request(&self, request: StreamMessageRequest) {
        let _ = self.queue.send(Command::ProcessRequest(request));
    }

    /// Signals that no more requests will arrive, causing the writer task to
    /// finish the stream.
    pub fn request_stream_closed(&self) {
        let _ = self.queue.send(Command::Exit);
    }

    pub fn send_arbitration_update(&self, update: ArbitrationUpdate) {
        let _ = self.queue.send(Command::SendResponse(StreamMessageResponse {
            response: Some(Response::Arbitration(update)),
        }));
    }

    pub fn send_link_update(&self, update: LinkUpdate) {
        let _ = self.queue.send(Command::SendResponse(StreamMessageResponse {
            response: Some(Response::LinkUpdate(update)),
        }));
    }

    pub fn send_async_error(&self, error: AsyncError) {
        let _ = self.queue.send(Command::SendResponse(StreamMessageResponse {
            response: Some(Response::Error(error)),
        }));
    }
}

#[derive(Default)]
struct AsState {
    /// Client name to live connection.
    connections: HashMap<String, ClientConn>,
    /// VLAN name to the election ids submitted by each client.
    elections: HashMap<String, HashMap<String, i64>>,
    /// VLAN name to the current primary client.
    primary: HashMap<String, String>,
}

/// The individual client connections of one AS and the primary-client
/// election per VLAN. One mutex guards connections, elections and primaries
/// together.
pub struct AsConnections {
    asn: Asn,
    state: Mutex<AsState>,
}

impl AsConnections {
    fn new(asn: Asn) -> Self {
        Self {
            asn,
            state: Mutex::new(AsState::default()),
        }
    }

    pub fn asn(&self) -> Asn {
        self.asn
    }

    /// Records an election id of `client` for the given VLANs and
    /// recomputes the primaries. The VLAN list has been resolved against the
    /// store by the caller; every client participating in an election
    /// receives an update per affected VLAN.
    pub fn arbitrate(&self, client: &str, vlans: &[String], election_id: i64) {
        let mut state = self.state.lock();

        for vlan in vlans {
            state
                .elections
                .entry(vlan.clone())
                .or_default()
                .insert(client.to_string(), election_id);
            Self::arbitrate_vlan(&mut state, vlan);
        }
    }

    /// Elects the primary client of one VLAN and notifies every client in
    /// the election. The highest election id wins; equal ids fall to the
    /// lexicographically greatest client name.
    fn arbitrate_vlan(state: &mut AsState, vlan: &str) {
        let primary = state
            .elections
            .get(vlan)
            .and_then(|election| {
                election
                    .iter()
                    .max_by_key(|(name, id)| (**id, name.as_str()))
            })
            .map(|(name, _)| name.clone());

        match &primary {
            Some(name) => {
                state.primary.insert(vlan.to_string(), name.clone());
            }
            None => {
                state.primary.remove(vlan);
            }
        }

        let Some(election) = state.elections.get(vlan) else {
            return;
        };

        for (client, election_id) in election {
            let status = if Some(client) == primary.as_ref() {
                ArbitrationStatus::Primary
            } else {
                ArbitrationStatus::NotPrimary
            };

            if let Some(conn) = state.connections.get(client) {
                conn.send_arbitration_update(ArbitrationUpdate {
                    vlan: Some(vlan.to_string()),
                    election_id: *election_id,
                    status: status as i32,
                });
            }
        }
    }

    /// Checks whether `client` is the primary client in the given VLAN. With
    /// no VLAN, checks whether it is primary in every VLAN with an election.
    pub fn is_primary(&self, client: &str, vlan: Option<&str>) -> bool {
        let state = self.state.lock();

        match vlan {
            Some(vlan) => state.primary.get(vlan).is_some_and(|name| name == client),
            None => state.primary.values().all(|name| name == client),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }
}

/// Process-wide collection of all connected peering clients, keyed by ASN.
#[derive(Default)]
pub struct Registry {
    ases: Mutex<HashMap<Asn, Arc<AsConnections>>>,
}

/// The client already has an open connection.
#[derive(Debug)]
pub struct AlreadyConnected;

impl std::error::Error for AlreadyConnected {}

impl std::fmt::Display for AlreadyConnected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Connection is already open")
    }
}

impl Registry {
    /// Registers a connection for `(asn, client)`. The caller has verified
    /// that AS and client exist in the store. Returns the AS's connection
    /// collection, the connection handle and the receiving half of its
    /// command queue.
    pub fn create_connection(
        &self,
        asn: Asn,
        client: &str,
    ) -> Result<(Arc<AsConnections>, ClientConn, UnboundedReceiver<Command>), AlreadyConnected>
    {
        let mut ases = self.ases.lock();
        let connections = ases
            .entry(asn)
            .or_insert_with(|| Arc::new(AsConnections::new(asn)))
            .clone();

        let mut state = connections.state.lock();
        if state.connections.contains_key(client) {
            return Err(AlreadyConnected);
        }

        let (queue, commands) = mpsc::unbounded_channel();
        let conn = ClientConn {
            name: client.to_string(),
            queue,
        };
        state.connections.insert(client.to_string(), conn.clone());
        drop(state);

        log::info!("peering client {asn}-{client} connected");

        Ok((connections, conn, commands))
    }

    /// Removes a closed connection and promotes a new primary in every VLAN
    /// the client was primary of.
    pub fn destroy_connection(&self, asn: Asn, client: &str) {
        let mut ases = self.ases.lock();
        let Some(connections) = ases.get(&asn).cloned() else {
            return;
        };

        let mut state = connections.state.lock();
        for election in state.elections.values_mut() {
            election.remove(client);
        }

        let lost: Vec<String> = state
            .primary
            .iter()
            .filter(|(_, name)| name.as_str() == client)
            .map(|(vlan, _)| vlan.clone())
            .collect();
        for vlan in &lost {
            AsConnections::arbitrate_vlan(&mut state, vlan);
        }

        state.connections.remove(client);
        let empty = state.connections.is_empty();
        drop(state);

        if empty {
            ases.remove(&asn);
        }

        log::info!("peering client {asn}-{client} disconnected");
    }

    pub fn get(&self, asn: Asn) -> Option<Arc<AsConnections>> {
        self.ases.lock().get(&asn).cloned()
    }

    /// Whether `(asn, client)` may write policies for `vlan` (or for every
    /// VLAN, with `None`). An AS without connections has no primaries.
    pub fn is_primary(&self, asn: Asn, client: &str, vlan: Option<&str>) -> bool {
        self.get(asn)
            .map(|connections| connections.is_primary(client, vlan))
            .unwrap_or(false)
    }

    /// Enqueues a link update to every live connection of the AS.
    pub fn send_link_update(&self, asn: Asn, update: LinkUpdate) {
        if let Some(connections) = self.get(asn) {
            let state = connections.state.lock();
            for conn in state.connections.values() {
                conn.send_link_update(update.clone());
            }
        }
    }

    /// Enqueues an asynchronous error report to every live connection of the
    /// AS.
    pub fn send_async_error(&self, asn: Asn, error: AsyncError) {
        if let Some(connections) = self.get(asn) {
            let state = connections.state.lock();
            for conn in state.connections.values() {
                conn.send_async_error(error.clone());
            }
        }
    }

    /// Called when an interface was removed administratively. Drops the
    /// client's election entry for the VLAN and promotes a new primary if
    /// necessary.
    pub fn remove_interface(&self, asn: Asn, client: &str, vlan: &str) {
        let Some(connections) = self.get(asn) else {
            return;
        };

        let mut state = connections.state.lock();
        if let Some(election) = state.elections.get_mut(vlan) {
            election.remove(client);
        }
        if state.primary.get(vlan).is_some_and(|name| name == client) {
            AsConnections::arbitrate_vlan(&mut state, vlan);
        }
    }

    /// Called when a client was deleted administratively. Closes its stream
    /// if it is still connected; the writer task then unregisters it.
    pub fn remove_client(&self, asn: Asn, client: &str) {
        if let Some(connections) = self.get(asn) {
            let state = connections.state.lock();
            if let Some(conn) = state.connections.get(client) {
                conn.request_stream_closed();
            }
        }
    }
}
