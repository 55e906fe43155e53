//! # RPC Layer
//!
//! QUIC request/response transport for the profile protocols.
//!
//! ## Architecture
//!
//! - [`RpcNode`]: public handle (cheap to clone) for making calls; implements
//!   [`ProfilePeerRpc`] and [`ProfileQueryRpc`]
//! - `RpcNodeActor`: owns the connection cache
//! - [`handle_connection`]: server side, one task per incoming connection and
//!   one per stream, dispatching into a [`ProfileNode`]
//!
//! ## Framing
//!
//! One request per bidirectional stream: `u32` big-endian length, bincode
//! body, then the same for the response.
//!
//! ## Security
//!
//! - All connections use mutual TLS with Ed25519 certificates
//! - The caller identity passed to protocol logic is the one proven by the
//!   client certificate; a request whose claimed sender differs is refused
//! - Request and response sizes are bounded

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use lru::LruCache;
use quinn::{ClientConfig, Connection, Endpoint, Incoming};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::aggregation::EndorsementSummary;
use crate::crypto::{extract_verified_identity, identity_to_sni};
use crate::error::ProfileError;
use crate::identity::{Contact, Identity};
use crate::ledger::Endorsement;
use crate::messages::{
    self, EndorsementDelivery, OwnerCommand, PeerRequest, QueryRequest, RpcRequest, RpcResponse,
};
use crate::profile::Profile;
use crate::profile_node::ProfileNode;
use crate::protocols::{ProfilePeerRpc, ProfileQueryRpc};

// ============================================================================
// Limits
// ============================================================================

const MAX_RESPONSE_SIZE: usize = messages::MAX_RESPONSE_SIZE;

/// Maximum size of an incoming request.
const MAX_REQUEST_SIZE: usize = 64 * 1024;

/// Maximum number of cached QUIC connections.
const MAX_CACHED_CONNECTIONS: usize = 1_000;

/// Idle connections older than this are re-checked before reuse.
const CONNECTION_STALE_TIMEOUT: Duration = Duration::from_secs(60);

const RPC_COMMAND_CHANNEL_SIZE: usize = 256;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(30);

const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Owner commands may themselves call out to a counterpart, so the server
/// allows them longer than a single outbound call.
const REQUEST_PROCESS_TIMEOUT: Duration = Duration::from_secs(75);

// ============================================================================
// Actor Commands
// ============================================================================

enum RpcCommand {
    GetOrConnect {
        contact: Contact,
        reply: oneshot::Sender<Result<Connection>>,
    },
    InvalidateConnection {
        peer_id: Identity,
    },
    MarkSuccess {
        peer_id: Identity,
    },
    Quit,
}

// ============================================================================
// Actor (owns the connection cache)
// ============================================================================

struct RpcNodeActor {
    endpoint: Endpoint,
    client_config: ClientConfig,
    connect_timeout: Duration,
    connections: LruCache<Identity, CachedConnection>,
}

impl RpcNodeActor {
    fn new(endpoint: Endpoint, client_config: ClientConfig, connect_timeout: Duration) -> Self {
        let capacity = NonZeroUsize::new(MAX_CACHED_CONNECTIONS).unwrap_or(NonZeroUsize::MIN);
        Self {
            endpoint,
            client_config,
            connect_timeout,
            connections: LruCache::new(capacity),
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<RpcCommand>) {
        let mut cleanup_interval = tokio::time::interval(CLEANUP_INTERVAL);
        cleanup_interval.tick().await;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(RpcCommand::GetOrConnect { contact, reply }) => {
                            let result = self.get_or_connect(contact).await;
                            let _ = reply.send(result);
                        }
                        Some(RpcCommand::InvalidateConnection { peer_id }) => {
                            if self.connections.pop(&peer_id).is_some() {
                                debug!(
                                    peer = %peer_id.short(),
                                    "invalidated cached connection after failure"
                                );
                            }
                        }
                        Some(RpcCommand::MarkSuccess { peer_id }) => {
                            if let Some(cached) = self.connections.get_mut(&peer_id) {
                                cached.mark_success();
                            }
                        }
                        Some(RpcCommand::Quit) | None => {
                            debug!("RpcNode actor shutting down");
                            break;
                        }
                    }
                }
                _ = cleanup_interval.tick() => {
                    self.cleanup_stale_connections();
                }
            }
        }
    }

    fn cleanup_stale_connections(&mut self) {
        let stale: Vec<Identity> = self
            .connections
            .iter()
            .filter(|(_, cached)| cached.is_closed() || cached.is_stale())
            .map(|(id, _)| *id)
            .collect();

        for peer_id in stale {
            self.connections.pop(&peer_id);
            trace!(peer = %peer_id.short(), "cleaned up stale connection");
        }
    }

    async fn get_or_connect(&mut self, contact: Contact) -> Result<Connection> {
        let peer_id = contact.identity;

        if let Some(cached) = self.connections.get_mut(&peer_id) {
            if cached.is_closed() {
                trace!(peer = %peer_id.short(), "cached connection is closed, removing");
                self.connections.pop(&peer_id);
            } else if !cached.is_stale() || cached.check_health_passive() {
                cached.mark_success();
                return Ok(cached.connection.clone());
            } else {
                debug!(
                    peer = %peer_id.short(),
                    "stale connection failed passive health check, removing"
                );
                self.connections.pop(&peer_id);
            }
        }

        let conn = self.connect(&contact).await?;
        self.connections.put(peer_id, CachedConnection::new(conn.clone()));
        Ok(conn)
    }

    /// Try each advertised address in order; the server must prove it holds
    /// `contact.identity`.
    async fn connect(&self, contact: &Contact) -> Result<Connection> {
        let sni = identity_to_sni(&contact.identity);
        let mut last_error = None;

        for addr_str in &contact.addrs {
            let addr: SocketAddr = match addr_str.parse() {
                Ok(addr) => addr,
                Err(e) => {
                    last_error = Some(anyhow!("invalid address {}: {}", addr_str, e));
                    continue;
                }
            };
            debug!(addr = %addr, peer = %contact.identity.short(), "initiating connection");
            let attempt = async {
                self.endpoint
                    .connect_with(self.client_config.clone(), addr, &sni)
                    .with_context(|| format!("failed to initiate connection to {}", addr))?
                    .await
                    .with_context(|| format!("failed to establish connection to {}", addr))
            };
            match tokio::time::timeout(self.connect_timeout, attempt).await {
                Ok(Ok(conn)) => return Ok(conn),
                Ok(Err(e)) => last_error = Some(e),
                Err(_) => last_error = Some(anyhow!("connection to {} timed out", addr)),
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("contact has no addresses")))
    }
}

struct CachedConnection {
    connection: Connection,
    last_success: Instant,
}

impl CachedConnection {
    fn new(connection: Connection) -> Self {
        Self {
            connection,
            last_success: Instant::now(),
        }
    }

    fn is_closed(&self) -> bool {
        self.connection.close_reason().is_some()
    }

    fn is_stale(&self) -> bool {
        self.last_success.elapsed() > CONNECTION_STALE_TIMEOUT
    }

    fn mark_success(&mut self) {
        self.last_success = Instant::now();
    }

    fn check_health_passive(&self) -> bool {
        !self.is_closed() && !self.connection.rtt().is_zero()
    }
}

// ============================================================================
// RpcNode Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct RpcNode {
    pub endpoint: Endpoint,
    pub self_contact: Contact,
    rpc_timeout: Duration,
    cmd_tx: mpsc::Sender<RpcCommand>,
}

impl RpcNode {
    pub fn new(
        endpoint: Endpoint,
        self_contact: Contact,
        client_config: ClientConfig,
        rpc_timeout: Duration,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(RPC_COMMAND_CHANNEL_SIZE);
        let actor = RpcNodeActor::new(endpoint.clone(), client_config, rpc_timeout);
        tokio::spawn(actor.run(cmd_rx));

        Self {
            endpoint,
            self_contact,
            rpc_timeout,
            cmd_tx,
        }
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(RpcCommand::Quit).await;
    }

    async fn get_or_connect(&self, contact: &Contact) -> Result<Connection> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(RpcCommand::GetOrConnect {
                contact: contact.clone(),
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow!("RPC actor closed"))?;
        reply_rx.await.map_err(|_| anyhow!("RPC actor closed"))?
    }

    /// Send one request and wait for its response. A transport failure
    /// drops the cached connection; a protocol-level refusal does not.
    pub async fn rpc_raw(&self, contact: &Contact, request: RpcRequest) -> Result<RpcResponse> {
        let peer_id = contact.identity;
        let conn = self.get_or_connect(contact).await?;

        let result = self.rpc_inner(&conn, contact, request).await;
        let cmd = match &result {
            Ok(_) => RpcCommand::MarkSuccess { peer_id },
            Err(_) => RpcCommand::InvalidateConnection { peer_id },
        };
        let _ = self.cmd_tx.send(cmd).await;
        result
    }

    async fn rpc_inner(&self, conn: &Connection, contact: &Contact, request: RpcRequest) -> Result<RpcResponse> {
        tokio::time::timeout(self.rpc_timeout, async {
            let (mut send, mut recv) = conn
                .open_bi()
                .await
                .context("failed to open bidirectional stream")?;

            let request_bytes =
                messages::serialize_message(&request).context("failed to serialize request")?;
            send.write_all(&(request_bytes.len() as u32).to_be_bytes()).await?;
            send.write_all(&request_bytes).await?;
            send.finish()?;

            let mut len_buf = [0u8; 4];
            recv.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len > MAX_RESPONSE_SIZE {
                warn!(
                    peer = %contact.identity.short(),
                    size = len,
                    max = MAX_RESPONSE_SIZE,
                    "peer sent oversized response"
                );
                bail!("response too large: {} bytes (max {})", len, MAX_RESPONSE_SIZE);
            }

            let mut response_bytes = vec![0u8; len];
            recv.read_exact(&mut response_bytes).await?;
            messages::deserialize_bounded(&response_bytes).context("failed to deserialize response")
        })
        .await
        .context("RPC timed out")?
    }

    /// Run an owner command on a remote node; our TLS identity is the
    /// principal checked against its owner.
    pub async fn owner_command(&self, to: &Contact, command: OwnerCommand) -> Result<RpcResponse> {
        let response = self.rpc_raw(to, RpcRequest::Owner(command)).await?;
        into_result(response)
    }

    async fn peer_call(&self, to: &Contact, request: PeerRequest) -> Result<()> {
        match into_result(self.rpc_raw(to, RpcRequest::Peer(request)).await?)? {
            RpcResponse::Ack => Ok(()),
            other => bail!("unexpected response to peer request: {:?}", other),
        }
    }
}

/// Turn refusals into errors. A `Rejected` refusal keeps its
/// [`ProfileError`], so callers can downcast it.
fn into_result(response: RpcResponse) -> Result<RpcResponse> {
    match response {
        RpcResponse::Rejected(err) => Err(anyhow::Error::new(err)),
        RpcResponse::Error { message } => bail!("RPC error: {}", message),
        other => Ok(other),
    }
}

#[async_trait]
impl ProfilePeerRpc for RpcNode {
    async fn receive_connection_request(&self, to: &Contact) -> Result<()> {
        self.peer_call(
            to,
            PeerRequest::ConnectionRequest {
                from: self.self_contact.clone(),
            },
        )
        .await
    }

    async fn confirm_connection(&self, to: &Contact) -> Result<()> {
        self.peer_call(
            to,
            PeerRequest::ConfirmConnection {
                from: self.self_contact.clone(),
            },
        )
        .await
    }

    async fn receive_endorsement(&self, to: &Contact, delivery: EndorsementDelivery) -> Result<()> {
        self.peer_call(
            to,
            PeerRequest::Endorsement {
                from: self.self_contact.clone(),
                delivery,
            },
        )
        .await
    }
}

#[async_trait]
impl ProfileQueryRpc for RpcNode {
    async fn fetch_profile(&self, to: &Contact) -> Result<Profile> {
        match into_result(self.rpc_raw(to, RpcRequest::Query(QueryRequest::Profile)).await?)? {
            RpcResponse::Profile(profile) => Ok(profile),
            other => bail!("unexpected response to Profile: {:?}", other),
        }
    }

    async fn fetch_summary(&self, to: &Contact) -> Result<EndorsementSummary> {
        match into_result(self.rpc_raw(to, RpcRequest::Query(QueryRequest::Summary)).await?)? {
            RpcResponse::Summary(summary) => Ok(summary),
            other => bail!("unexpected response to Summary: {:?}", other),
        }
    }

    async fn fetch_skill_endorsements(&self, to: &Contact, skill: &str) -> Result<Vec<Endorsement>> {
        let request = RpcRequest::Query(QueryRequest::SkillEndorsements {
            skill: skill.to_string(),
        });
        match into_result(self.rpc_raw(to, request).await?)? {
            RpcResponse::Endorsements(records) => Ok(records),
            other => bail!("unexpected response to SkillEndorsements: {:?}", other),
        }
    }
}

// ============================================================================
// Server
// ============================================================================

/// Serve one incoming connection until it closes.
pub async fn handle_connection(node: ProfileNode<RpcNode>, incoming: Incoming) -> Result<()> {
    let connection = incoming.await.context("failed to accept connection")?;
    let remote = connection.remote_address();

    let Some(verified_identity) = extract_verified_identity(&connection) else {
        warn!(remote = %remote, "rejecting connection: could not verify peer identity");
        bail!("could not verify peer identity from certificate");
    };
    debug!(peer = %verified_identity.short(), addr = %remote, "peer connected");

    loop {
        let stream = match connection.accept_bi().await {
            Ok(s) => s,
            Err(quinn::ConnectionError::ApplicationClosed(_)) => {
                debug!(remote = %remote, "connection closed by application");
                break Ok(());
            }
            Err(quinn::ConnectionError::TimedOut) => {
                debug!(remote = %remote, "connection idle timeout");
                break Ok(());
            }
            Err(quinn::ConnectionError::LocallyClosed) => break Ok(()),
            Err(e) => break Err(e.into()),
        };

        let node = node.clone();
        let observed = Contact::single(verified_identity, remote.to_string());
        tokio::spawn(async move {
            if let Err(e) = handle_stream(node, stream, observed).await {
                debug!(error = ?e, "stream error");
            }
        });
    }
}

async fn write_response(send: &mut quinn::SendStream, response: &RpcResponse) -> Result<()> {
    let bytes = messages::serialize_message(response).context("failed to serialize response")?;
    send.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    send.write_all(&bytes).await?;
    send.finish()?;
    Ok(())
}

async fn handle_stream(
    node: ProfileNode<RpcNode>,
    (mut send, mut recv): (quinn::SendStream, quinn::RecvStream),
    observed: Contact,
) -> Result<()> {
    let verified_identity = observed.identity;

    let mut len_buf = [0u8; 4];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut len_buf))
        .await
        .map_err(|_| anyhow!("request header read timed out"))??;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_REQUEST_SIZE {
        warn!(
            peer = %verified_identity.short(),
            size = len,
            max = MAX_REQUEST_SIZE,
            "rejecting oversized request"
        );
        let response = RpcResponse::Error {
            message: format!("request too large: {} bytes (max {})", len, MAX_REQUEST_SIZE),
        };
        return write_response(&mut send, &response).await;
    }

    let mut request_bytes = vec![0u8; len];
    tokio::time::timeout(REQUEST_READ_TIMEOUT, recv.read_exact(&mut request_bytes))
        .await
        .map_err(|_| anyhow!("request body read timed out"))??;

    let request: RpcRequest =
        messages::deserialize_bounded(&request_bytes).context("failed to deserialize request")?;

    if let Some(claimed) = request.sender_identity()
        && claimed != verified_identity
    {
        warn!(
            claimed = %claimed.short(),
            verified = %verified_identity.short(),
            "rejecting request: claimed sender does not match connection identity"
        );
        let response = RpcResponse::Error {
            message: "sender does not match connection identity".to_string(),
        };
        return write_response(&mut send, &response).await;
    }

    let response = match tokio::time::timeout(
        REQUEST_PROCESS_TIMEOUT,
        handle_rpc_request(&node, request, observed),
    )
    .await
    {
        Ok(response) => response,
        Err(_) => {
            warn!(peer = %verified_identity.short(), "request processing timed out");
            RpcResponse::Error {
                message: "request processing timeout".to_string(),
            }
        }
    };

    write_response(&mut send, &response).await
}

fn ack(result: Result<(), ProfileError>) -> RpcResponse {
    match result {
        Ok(()) => RpcResponse::Ack,
        Err(e) => RpcResponse::Rejected(e),
    }
}

/// Dispatch a request whose caller identity has been verified.
async fn handle_rpc_request(
    node: &ProfileNode<RpcNode>,
    request: RpcRequest,
    observed: Contact,
) -> RpcResponse {
    let caller = observed.identity;
    match request {
        RpcRequest::Peer(PeerRequest::ConnectionRequest { from }) => {
            // Prefer the advertised listen addresses; fall back to where the
            // call came from.
            let contact = if from.validate_structure() && !from.addrs.is_empty() {
                from
            } else {
                observed
            };
            ack(node.receive_connection_request(contact).await)
        }
        RpcRequest::Peer(PeerRequest::ConfirmConnection { .. }) => {
            ack(node.confirm_connection(caller).await)
        }
        RpcRequest::Peer(PeerRequest::Endorsement { delivery, .. }) => {
            ack(node.receive_endorsement(caller, delivery).await)
        }
        RpcRequest::Query(query) => handle_query(node, caller, query).await,
        RpcRequest::Owner(command) => handle_owner_command(node, caller, command).await,
    }
}

async fn handle_query(node: &ProfileNode<RpcNode>, caller: Identity, query: QueryRequest) -> RpcResponse {
    let result = match query {
        QueryRequest::Profile => node.get_profile(caller).await.map(RpcResponse::Profile),
        QueryRequest::Summary => node.endorsement_summary().await.map(RpcResponse::Summary),
        QueryRequest::SkillEndorsements { skill } => node
            .skill_endorsements(&skill)
            .await
            .map(RpcResponse::Endorsements),
    };
    result.unwrap_or_else(RpcResponse::Rejected)
}

async fn handle_owner_command(
    node: &ProfileNode<RpcNode>,
    caller: Identity,
    command: OwnerCommand,
) -> RpcResponse {
    if caller != node.owner() {
        warn!(caller = %caller.short(), "refusing owner command from non-owner");
        return RpcResponse::Rejected(ProfileError::Unauthorized { caller });
    }
    debug!(?command, "owner command");

    match command {
        OwnerCommand::Connect { remote } => ack(node.send_connection_request(caller, remote).await),
        OwnerCommand::Accept { from } => match node.accept_connection_request(caller, from).await {
            Ok(outcome) => RpcResponse::Accepted {
                confirmed: outcome.confirmed,
            },
            Err(e) => RpcResponse::Rejected(e),
        },
        OwnerCommand::Reject { from } => ack(node.reject_connection_request(caller, from).await),
        OwnerCommand::Reconfirm { peer } => ack(node.resend_confirmation(caller, peer).await),
        OwnerCommand::Endorse {
            target,
            skill,
            rating,
            comment,
        } => ack(node.endorse_skill(caller, target, skill, rating, comment).await),
        OwnerCommand::UpdateProfile(update) => ack(node.update_profile(caller, update).await),
        OwnerCommand::UpdateSkills(skills) => ack(node.update_skills(caller, skills).await),
        OwnerCommand::AddSkill(skill) => ack(node.add_skill(caller, skill).await),
        OwnerCommand::SetVisibility(is_public) => ack(node.set_visibility(caller, is_public).await),
        OwnerCommand::PendingRequests => node
            .pending_requests()
            .await
            .map(RpcResponse::Identities)
            .unwrap_or_else(RpcResponse::Rejected),
        OwnerCommand::OutgoingRequests => node
            .pending_outgoing()
            .await
            .map(RpcResponse::Identities)
            .unwrap_or_else(RpcResponse::Rejected),
        OwnerCommand::Connections => node
            .connections()
            .await
            .map(RpcResponse::Identities)
            .unwrap_or_else(RpcResponse::Rejected),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusals_become_errors_with_protocol_error_attached() {
        let peer = Identity::from_bytes([4u8; 32]);
        let err = into_result(RpcResponse::Rejected(ProfileError::NotConnected(peer))).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ProfileError>(),
            Some(&ProfileError::NotConnected(peer))
        );

        let err = into_result(RpcResponse::Error { message: "boom".into() }).unwrap_err();
        assert!(err.to_string().contains("boom"));

        assert!(matches!(into_result(RpcResponse::Ack), Ok(RpcResponse::Ack)));
    }

    #[test]
    fn ack_maps_results() {
        assert!(matches!(ack(Ok(())), RpcResponse::Ack));
        assert!(matches!(
            ack(Err(ProfileError::NotPublic)),
            RpcResponse::Rejected(ProfileError::NotPublic)
        ));
    }
}
