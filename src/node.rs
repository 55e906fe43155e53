//! # High-Level Node API
//!
//! A [`Node`] binds a QUIC endpoint, restores (or creates) its identity and
//! state, and serves the profile protocols to other nodes.
//!
//! ## Quick Start
//!
//! ```ignore
//! let node = Node::bind("0.0.0.0:0", NodeConfig::default()).await?;
//! node.update_skills(vec!["Rust".into()]).await?;
//!
//! node.send_connection_request(remote_contact).await?;
//! node.endorse_skill(remote_id, "Rust".into(), 9, "solid".into()).await?;
//!
//! let mut events = node.events().await?;
//! while let Some(event) = events.recv().await {
//!     println!("{:?}", event);
//! }
//! ```
//!
//! Owner operations on a `Node` run with the node's own identity as the
//! caller. A node whose configured owner is a different key is administered
//! remotely through [`RpcNode::owner_command`], see [`admin_client`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use quinn::Endpoint;
use tracing::{info, warn};

use crate::aggregation::EndorsementSummary;
use crate::config::NodeConfig;
use crate::connections::ConnectionState;
use crate::crypto::{create_client_config, endpoint_configs, generate_ed25519_cert};
use crate::error::ProfileResult;
use crate::events::ProfileEvent;
use crate::identity::{Contact, Identity, Keypair};
use crate::ledger::Endorsement;
use crate::messages::{OwnerCommand, RpcResponse};
use crate::profile::{Profile, ProfileUpdate};
use crate::profile_node::{AcceptOutcome, ProfileNode};
use crate::protocols::ProfileQueryRpc;
use crate::rpc::{self, RpcNode};
use crate::state::NodeState;
use crate::storage::NodeStore;

/// A receiver that can be taken exactly once via `.take()`.
type TakeOnce<T> = tokio::sync::Mutex<Option<tokio::sync::mpsc::Receiver<T>>>;

pub struct Node {
    keypair: Keypair,
    endpoint: Endpoint,
    contact: Contact,
    rpcnode: RpcNode,
    profile: ProfileNode<RpcNode>,
    events: TakeOnce<ProfileEvent>,
    listener: tokio::task::JoinHandle<Result<()>>,
}

impl Node {
    /// Bind on `addr` and start serving.
    ///
    /// With a `data_dir`, the key and last snapshot are loaded from it (or
    /// created on first start). A configured owner replaces the persisted one.
    pub async fn bind(addr: &str, config: NodeConfig) -> Result<Self> {
        let store = config.data_dir.clone().map(NodeStore::new);
        let keypair = match &store {
            Some(store) => store.load_or_generate_keypair()?,
            None => Keypair::generate(),
        };
        Self::create(addr, keypair, store, config).await
    }

    /// Bind with an existing keypair. State is still restored from
    /// `config.data_dir` when one is set.
    pub async fn bind_with_keypair(addr: &str, keypair: Keypair, config: NodeConfig) -> Result<Self> {
        let store = config.data_dir.clone().map(NodeStore::new);
        Self::create(addr, keypair, store, config).await
    }

    async fn create(
        addr: &str,
        keypair: Keypair,
        store: Option<NodeStore>,
        config: NodeConfig,
    ) -> Result<Self> {
        let addr: SocketAddr = addr.parse().context("invalid socket address")?;
        let identity = keypair.identity();

        let restored = match &store {
            Some(store) => store.load_state()?,
            None => None,
        };
        let mut state = match restored {
            Some(state) => {
                if state.identity() != identity {
                    bail!(
                        "stored state belongs to {}, not {}",
                        state.identity().short(),
                        identity.short()
                    );
                }
                info!(
                    connections = state.connection_count(),
                    skills = state.skill_count(),
                    "restored node state"
                );
                state
            }
            None => NodeState::new(identity, identity),
        };
        if let Some(owner) = config.owner {
            state.set_owner(owner);
        }
        let owner = state.owner();

        let (server_config, client_config) = endpoint_configs(&keypair)?;
        let mut endpoint =
            Endpoint::server(server_config, addr).context("failed to bind QUIC endpoint")?;
        endpoint.set_default_client_config(client_config.clone());
        let local_addr = endpoint.local_addr()?;

        let contact = Contact::single(identity, local_addr.to_string());
        let rpcnode = RpcNode::new(
            endpoint.clone(),
            contact.clone(),
            client_config,
            config.rpc_timeout,
        );

        let (profile, events_rx) = ProfileNode::spawn(Arc::new(rpcnode.clone()), state, store, &config);

        let listener = {
            let endpoint = endpoint.clone();
            let profile = profile.clone();
            tokio::spawn(async move {
                while let Some(incoming) = endpoint.accept().await {
                    let profile = profile.clone();
                    tokio::spawn(async move {
                        if let Err(e) = rpc::handle_connection(profile, incoming).await {
                            warn!("connection error: {:?}", e);
                        }
                    });
                }
                Ok(())
            })
        };

        info!(
            addr = %local_addr,
            identity = %identity,
            owner = %owner.short(),
            "node listening"
        );

        Ok(Self {
            keypair,
            endpoint,
            contact,
            rpcnode,
            profile,
            events: tokio::sync::Mutex::new(Some(events_rx)),
            listener,
        })
    }

    pub fn identity(&self) -> Identity {
        self.keypair.identity()
    }

    pub fn owner(&self) -> Identity {
        self.profile.owner()
    }

    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// How other nodes reach this one.
    pub fn contact(&self) -> &Contact {
        &self.contact
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr().context("failed to get local address")
    }

    pub fn profile_node(&self) -> &ProfileNode<RpcNode> {
        &self.profile
    }

    pub fn rpc(&self) -> &RpcNode {
        &self.rpcnode
    }

    /// Observability events. Can be taken once.
    pub async fn events(&self) -> Result<tokio::sync::mpsc::Receiver<ProfileEvent>> {
        let mut guard = self.events.lock().await;
        guard.take().context("event receiver already taken")
    }

    // =========================================================================
    // Profile
    // =========================================================================

    pub async fn update_profile(&self, update: ProfileUpdate) -> ProfileResult<()> {
        self.profile.update_profile(self.identity(), update).await
    }

    pub async fn update_skills(&self, skills: Vec<String>) -> ProfileResult<()> {
        self.profile.update_skills(self.identity(), skills).await
    }

    pub async fn add_skill(&self, skill: impl Into<String>) -> ProfileResult<()> {
        self.profile.add_skill(self.identity(), skill.into()).await
    }

    pub async fn set_visibility(&self, is_public: bool) -> ProfileResult<()> {
        self.profile.set_visibility(self.identity(), is_public).await
    }

    /// This node's profile as seen by its own identity.
    pub async fn profile(&self) -> ProfileResult<Profile> {
        self.profile.get_profile(self.identity()).await
    }

    pub async fn skill_count(&self) -> ProfileResult<usize> {
        self.profile.skill_count().await
    }

    // =========================================================================
    // Connections
    // =========================================================================

    pub async fn send_connection_request(&self, remote: Contact) -> ProfileResult<()> {
        self.profile.send_connection_request(self.identity(), remote).await
    }

    pub async fn accept_connection_request(&self, from: Identity) -> ProfileResult<AcceptOutcome> {
        self.profile.accept_connection_request(self.identity(), from).await
    }

    pub async fn reject_connection_request(&self, from: Identity) -> ProfileResult<()> {
        self.profile.reject_connection_request(self.identity(), from).await
    }

    /// Re-send the acceptance confirmation to an already-connected peer.
    pub async fn resend_confirmation(&self, peer: Identity) -> ProfileResult<()> {
        self.profile.resend_confirmation(self.identity(), peer).await
    }

    pub async fn connections(&self) -> ProfileResult<Vec<Identity>> {
        self.profile.connections().await
    }

    pub async fn connection_count(&self) -> ProfileResult<u64> {
        self.profile.connection_count().await
    }

    pub async fn check_connection(&self, peer: Identity) -> ProfileResult<bool> {
        self.profile.check_connection(peer).await
    }

    pub async fn connection_state(&self, peer: Identity) -> ProfileResult<ConnectionState> {
        self.profile.connection_state(peer).await
    }

    pub async fn pending_requests(&self) -> ProfileResult<Vec<Identity>> {
        self.profile.pending_requests().await
    }

    pub async fn pending_outgoing(&self) -> ProfileResult<Vec<Identity>> {
        self.profile.pending_outgoing().await
    }

    // =========================================================================
    // Endorsements
    // =========================================================================

    pub async fn endorse_skill(
        &self,
        target: Identity,
        skill: impl Into<String>,
        rating: u8,
        comment: impl Into<String>,
    ) -> ProfileResult<()> {
        self.profile
            .endorse_skill(self.identity(), target, skill.into(), rating, comment.into())
            .await
    }

    pub async fn skill_endorsements(&self, skill: &str) -> ProfileResult<Vec<Endorsement>> {
        self.profile.skill_endorsements(skill).await
    }

    pub async fn has_endorsed_skill(&self, skill: &str, endorser: Identity) -> ProfileResult<bool> {
        self.profile.has_endorsed_skill(skill, endorser).await
    }

    pub async fn all_endorsed_skills(&self) -> ProfileResult<Vec<String>> {
        self.profile.all_endorsed_skills().await
    }

    pub async fn has_given_endorsement(&self, target: Identity, skill: &str) -> ProfileResult<bool> {
        self.profile.has_given_endorsement(target, skill).await
    }

    pub async fn endorsement_count(&self) -> ProfileResult<usize> {
        self.profile.endorsement_count().await
    }

    pub async fn endorsement_summary(&self) -> ProfileResult<EndorsementSummary> {
        self.profile.endorsement_summary().await
    }

    // =========================================================================
    // Remote queries and administration
    // =========================================================================

    pub async fn fetch_profile(&self, remote: &Contact) -> Result<Profile> {
        self.rpcnode.fetch_profile(remote).await
    }

    pub async fn fetch_summary(&self, remote: &Contact) -> Result<EndorsementSummary> {
        self.rpcnode.fetch_summary(remote).await
    }

    pub async fn fetch_skill_endorsements(&self, remote: &Contact, skill: &str) -> Result<Vec<Endorsement>> {
        self.rpcnode.fetch_skill_endorsements(remote, skill).await
    }

    /// Administer `remote` with this node's identity as the principal.
    pub async fn owner_command(&self, remote: &Contact, command: OwnerCommand) -> Result<RpcResponse> {
        self.rpcnode.owner_command(remote, command).await
    }

    pub async fn shutdown(&self) {
        self.listener.abort();

        self.profile.quit().await;
        self.rpcnode.quit().await;
        self.endpoint.close(0u32.into(), b"shutdown");
    }
}

/// A client-only endpoint that calls nodes as `keypair`. Used to administer
/// a node remotely with its owner key.
pub fn admin_client(keypair: &Keypair, rpc_timeout: Duration) -> Result<RpcNode> {
    let (client_certs, client_key) = generate_ed25519_cert(keypair)?;
    let client_config = create_client_config(client_certs, client_key)?;

    let bind: SocketAddr = "0.0.0.0:0".parse().context("invalid client bind address")?;
    let mut endpoint = Endpoint::client(bind).context("failed to bind client endpoint")?;
    endpoint.set_default_client_config(client_config.clone());

    let contact = Contact::new(keypair.identity(), Vec::new());
    Ok(RpcNode::new(endpoint, contact, client_config, rpc_timeout))
}
