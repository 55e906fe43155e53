//! # Profile Node Actor
//!
//! One [`ProfileNodeActor`] task owns a node's [`NodeState`] and processes
//! commands one at a time, so each local transition is atomic. The public
//! [`ProfileNode`] handle is cheap to clone and drives the operations that
//! reach a counterpart:
//!
//! ```text
//! handle ──commit──▶ actor        (local state updated, persisted)
//! handle ──invoke──▶ counterpart  (outside the actor)
//! handle ──finish──▶ actor        (finalize or compensate)
//! ```
//!
//! Because the actor never waits on the network, a counterpart that calls
//! back into this node while our outgoing call is in flight is served
//! immediately and observes the already-committed local state.
//!
//! ## Failure Handling
//!
//! | Operation | Remote failure |
//! |-----------|----------------|
//! | send request | local `OutgoingPending` reset to `None`, `DeliveryFailed` |
//! | accept | local `Connected` kept, reported as `confirmed: false` |
//! | endorse | guard not consumed, `EndorsementDeliveryFailed` |
//!
//! A refusal proving that an earlier attempt landed is not a failure: a
//! `DuplicateRequest` keeps the request pending, an `AlreadyConnected`
//! completes the edge locally, and an `AlreadyEndorsed` consumes the guard.
//! An accepter whose confirmation was lost can send it again with
//! [`ProfileNode::resend_confirmation`].

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::aggregation::EndorsementSummary;
use crate::config::NodeConfig;
use crate::connections::ConnectionState;
use crate::error::{ProfileError, ProfileResult};
use crate::events::ProfileEvent;
use crate::identity::{Contact, Identity};
use crate::ledger::Endorsement;
use crate::messages::EndorsementDelivery;
use crate::profile::{Profile, ProfileUpdate};
use crate::protocols::ProfilePeerRpc;
use crate::state::NodeState;
use crate::storage::NodeStore;

/// Command channel capacity for the profile actor.
const PROFILE_COMMAND_CHANNEL_SIZE: usize = 256;

type Reply<T> = oneshot::Sender<ProfileResult<T>>;
type ReadFn = Box<dyn FnOnce(&NodeState) + Send>;

/// Result of accepting a connection request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AcceptOutcome {
    pub peer: Identity,
    /// Whether the requester acknowledged the acceptance. `false` leaves the
    /// requester `OutgoingPending` until reconciled; the local side stays
    /// `Connected` either way.
    pub confirmed: bool,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    UpdateProfile(Identity, ProfileUpdate, Reply<()>),
    UpdateSkills(Identity, Vec<String>, Reply<()>),
    AddSkill(Identity, String, Reply<()>),
    SetVisibility(Identity, bool, Reply<()>),
    BeginConnectionRequest {
        caller: Identity,
        remote: Contact,
        reply: Reply<()>,
    },
    ConnectionRequestDelivered {
        peer: Identity,
    },
    RollbackConnectionRequest {
        peer: Identity,
        reply: oneshot::Sender<bool>,
    },
    ReceiveConnectionRequest {
        from: Contact,
        reply: Reply<()>,
    },
    AcceptConnectionRequest {
        caller: Identity,
        from: Identity,
        reply: Reply<Option<Contact>>,
    },
    ConfirmConnection {
        friend: Identity,
        reply: Reply<()>,
    },
    RejectConnectionRequest {
        caller: Identity,
        from: Identity,
        reply: Reply<()>,
    },
    BeginEndorsement {
        caller: Identity,
        target: Identity,
        delivery: EndorsementDelivery,
        reply: Reply<Contact>,
    },
    FinishEndorsement {
        target: Identity,
        skill: String,
        delivered: bool,
        reply: oneshot::Sender<()>,
    },
    ReceiveEndorsement {
        from: Identity,
        delivery: EndorsementDelivery,
        reply: Reply<()>,
    },
    Read(ReadFn),
    Quit,
}

// ============================================================================
// ProfileNode Handle (public API - cheap to clone)
// ============================================================================

pub struct ProfileNode<N: ProfilePeerRpc> {
    cmd_tx: mpsc::Sender<Command>,
    network: Arc<N>,
    identity: Identity,
    owner: Identity,
}

impl<N: ProfilePeerRpc> Clone for ProfileNode<N> {
    fn clone(&self) -> Self {
        Self {
            cmd_tx: self.cmd_tx.clone(),
            network: self.network.clone(),
            identity: self.identity,
            owner: self.owner,
        }
    }
}

impl<N: ProfilePeerRpc> ProfileNode<N> {
    /// Spawn the actor over `state`. Every committed mutation is written to
    /// `store` when one is given.
    pub fn spawn(
        network: Arc<N>,
        state: NodeState,
        store: Option<NodeStore>,
        config: &NodeConfig,
    ) -> (Self, mpsc::Receiver<ProfileEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(PROFILE_COMMAND_CHANNEL_SIZE);
        let (event_tx, event_rx) = mpsc::channel(config.event_channel_size.max(1));

        let identity = state.identity();
        let owner = state.owner();
        let actor = ProfileNodeActor {
            state,
            store,
            events: event_tx,
            require_listed_skill: config.require_listed_skill,
        };
        tokio::spawn(actor.run(cmd_rx));

        (
            Self {
                cmd_tx,
                network,
                identity,
                owner,
            },
            event_rx,
        )
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn owner(&self) -> Identity {
        self.owner
    }

    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(Command::Quit).await;
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> ProfileResult<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| ProfileError::Unavailable)?;
        rx.await.map_err(|_| ProfileError::Unavailable)
    }

    async fn read<T: Send + 'static>(
        &self,
        f: impl FnOnce(&NodeState) -> T + Send + 'static,
    ) -> ProfileResult<T> {
        self.request(|tx| {
            Command::Read(Box::new(move |state: &NodeState| {
                let _ = tx.send(f(state));
            }))
        })
        .await
    }

    // ------------------------------------------------------------------
    // Profile store (owner-only mutators)
    // ------------------------------------------------------------------

    pub async fn update_profile(&self, caller: Identity, update: ProfileUpdate) -> ProfileResult<()> {
        self.request(|reply| Command::UpdateProfile(caller, update, reply)).await?
    }

    pub async fn update_skills(&self, caller: Identity, skills: Vec<String>) -> ProfileResult<()> {
        self.request(|reply| Command::UpdateSkills(caller, skills, reply)).await?
    }

    pub async fn add_skill(&self, caller: Identity, skill: String) -> ProfileResult<()> {
        self.request(|reply| Command::AddSkill(caller, skill, reply)).await?
    }

    pub async fn set_visibility(&self, caller: Identity, is_public: bool) -> ProfileResult<()> {
        self.request(|reply| Command::SetVisibility(caller, is_public, reply)).await?
    }

    pub async fn get_profile(&self, caller: Identity) -> ProfileResult<Profile> {
        self.read(move |state| state.get_profile(caller)).await?
    }

    pub async fn skill_count(&self) -> ProfileResult<usize> {
        self.read(|state| state.skill_count()).await
    }

    // ------------------------------------------------------------------
    // Connection handshake
    // ------------------------------------------------------------------

    /// Request a connection to `remote`.
    ///
    /// `OutgoingPending` is committed locally before the request is
    /// delivered; if delivery fails the pending state is reset to `None`.
    pub async fn send_connection_request(&self, caller: Identity, remote: Contact) -> ProfileResult<()> {
        let node = self.clone();
        // Detached so a dropped caller cannot skip the rollback.
        tokio::spawn(async move { node.send_connection_request_inner(caller, remote).await })
            .await
            .map_err(|_| ProfileError::Unavailable)?
    }

    async fn send_connection_request_inner(&self, caller: Identity, remote: Contact) -> ProfileResult<()> {
        let peer = remote.identity;
        let commit_remote = remote.clone();
        self.request(|reply| Command::BeginConnectionRequest {
            caller,
            remote: commit_remote,
            reply,
        })
        .await??;

        let result = self.network.receive_connection_request(&remote).await;
        let refusal = result
            .as_ref()
            .err()
            .and_then(|e| e.downcast_ref::<ProfileError>())
            .cloned();
        match (result, refusal) {
            (Ok(()), _) | (Err(_), Some(ProfileError::DuplicateRequest(_))) => {
                // A duplicate refusal means the counterpart already holds our
                // request from an attempt whose reply never arrived.
                let _ = self
                    .cmd_tx
                    .send(Command::ConnectionRequestDelivered { peer })
                    .await;
                info!(peer = %peer.short(), "connection request delivered");
                Ok(())
            }
            (Err(_), Some(ProfileError::AlreadyConnected(_))) => {
                // The counterpart accepted an earlier attempt but its
                // confirmation was lost; its refusal stands in for it.
                match self
                    .request(|reply| Command::ConfirmConnection { friend: peer, reply })
                    .await?
                {
                    Ok(()) => {}
                    // A confirmation raced in ahead of us.
                    Err(_) if self.check_connection(peer).await? => {}
                    Err(e) => return Err(e),
                }
                info!(peer = %peer.short(), "counterpart already connected, edge completed");
                Ok(())
            }
            (Err(e), _) => {
                let reset = self
                    .request(|reply| Command::RollbackConnectionRequest { peer, reply })
                    .await
                    .unwrap_or(false);
                warn!(
                    peer = %peer.short(),
                    error = %e,
                    reset,
                    "connection request delivery failed, rolled back"
                );
                Err(ProfileError::DeliveryFailed {
                    peer,
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    /// Handle a connection request from `from`, the authenticated caller.
    pub async fn receive_connection_request(&self, from: Contact) -> ProfileResult<()> {
        self.request(|reply| Command::ReceiveConnectionRequest { from, reply }).await?
    }

    /// Accept a pending request and notify the requester.
    ///
    /// The local `Connected` state is committed first and is never undone;
    /// a failed notification only shows up as `confirmed: false`.
    pub async fn accept_connection_request(&self, caller: Identity, from: Identity) -> ProfileResult<AcceptOutcome> {
        let node = self.clone();
        tokio::spawn(async move { node.accept_connection_request_inner(caller, from).await })
            .await
            .map_err(|_| ProfileError::Unavailable)?
    }

    async fn accept_connection_request_inner(
        &self,
        caller: Identity,
        from: Identity,
    ) -> ProfileResult<AcceptOutcome> {
        let contact = self
            .request(|reply| Command::AcceptConnectionRequest { caller, from, reply })
            .await??;

        let confirmed = match contact {
            Some(contact) => match self.network.confirm_connection(&contact).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(
                        peer = %from.short(),
                        error = %e,
                        "connection confirmation failed; requester not yet connected"
                    );
                    false
                }
            },
            None => {
                warn!(peer = %from.short(), "no contact for requester; cannot confirm");
                false
            }
        };

        Ok(AcceptOutcome { peer: from, confirmed })
    }

    /// Handle a confirmation from `friend`, the authenticated caller.
    pub async fn confirm_connection(&self, friend: Identity) -> ProfileResult<()> {
        self.request(|reply| Command::ConfirmConnection { friend, reply }).await?
    }

    /// Send the confirmation for an accepted request again, for when the
    /// first one never reached the requester.
    pub async fn resend_confirmation(&self, caller: Identity, peer: Identity) -> ProfileResult<()> {
        let contact = self
            .read(move |state| -> ProfileResult<Contact> {
                state.authorize(caller)?;
                if !state.check_connection(&peer) {
                    return Err(ProfileError::NotConnected(peer));
                }
                state
                    .contact(&peer)
                    .cloned()
                    .ok_or(ProfileError::NotConnected(peer))
            })
            .await??;

        self.network.confirm_connection(&contact).await.map_err(|e| {
            warn!(peer = %peer.short(), error = %e, "confirmation resend failed");
            ProfileError::DeliveryFailed {
                peer,
                reason: format!("{:#}", e),
            }
        })?;
        info!(peer = %peer.short(), "confirmation delivered");
        Ok(())
    }

    /// Drop a pending incoming request.
    ///
    /// The requester is not told and stays `OutgoingPending` toward us; it
    /// has no way to cancel. Kept as-is pending a product decision.
    pub async fn reject_connection_request(&self, caller: Identity, from: Identity) -> ProfileResult<()> {
        self.request(|reply| Command::RejectConnectionRequest { caller, from, reply })
            .await?
    }

    pub async fn connections(&self) -> ProfileResult<Vec<Identity>> {
        self.read(|state| state.connections().to_vec()).await
    }

    pub async fn connection_count(&self) -> ProfileResult<u64> {
        self.read(|state| state.connection_count()).await
    }

    pub async fn check_connection(&self, peer: Identity) -> ProfileResult<bool> {
        self.read(move |state| state.check_connection(&peer)).await
    }

    pub async fn connection_state(&self, peer: Identity) -> ProfileResult<ConnectionState> {
        self.read(move |state| state.connection_state(&peer)).await
    }

    /// Identities with a request waiting for our accept or reject.
    pub async fn pending_requests(&self) -> ProfileResult<Vec<Identity>> {
        self.read(|state| state.pending_requests()).await
    }

    /// Peers our own requests are still waiting on.
    pub async fn pending_outgoing(&self) -> ProfileResult<Vec<Identity>> {
        self.read(|state| state.pending_outgoing()).await
    }

    pub async fn contact(&self, peer: Identity) -> ProfileResult<Option<Contact>> {
        self.read(move |state| state.contact(&peer).cloned()).await
    }

    // ------------------------------------------------------------------
    // Endorsements
    // ------------------------------------------------------------------

    /// Endorse `skill` on the connected node `target`.
    ///
    /// The one-endorsement allowance for `(target, skill)` is consumed only
    /// once the target has recorded it.
    pub async fn endorse_skill(
        &self,
        caller: Identity,
        target: Identity,
        skill: String,
        rating: u8,
        comment: String,
    ) -> ProfileResult<()> {
        let node = self.clone();
        let delivery = EndorsementDelivery { skill, rating, comment };
        tokio::spawn(async move { node.endorse_skill_inner(caller, target, delivery).await })
            .await
            .map_err(|_| ProfileError::Unavailable)?
    }

    async fn endorse_skill_inner(
        &self,
        caller: Identity,
        target: Identity,
        delivery: EndorsementDelivery,
    ) -> ProfileResult<()> {
        let skill = delivery.skill.clone();
        let commit_delivery = delivery.clone();
        let contact = self
            .request(|reply| Command::BeginEndorsement {
                caller,
                target,
                delivery: commit_delivery,
                reply,
            })
            .await??;

        let rating = delivery.rating;
        let result = self.network.receive_endorsement(&contact, delivery).await;
        // The target already holding our record means an earlier delivery
        // landed even though its reply did not.
        let already_recorded = matches!(
            result.as_ref().err().and_then(|e| e.downcast_ref::<ProfileError>()),
            Some(ProfileError::AlreadyEndorsed { .. })
        );
        let delivered = result.is_ok() || already_recorded;
        let finish_skill = skill.clone();
        self.request(|reply| Command::FinishEndorsement {
            target,
            skill: finish_skill,
            delivered,
            reply,
        })
        .await?;

        match result {
            Ok(()) => {
                info!(peer = %target.short(), skill = %skill, rating, "endorsement delivered");
                Ok(())
            }
            Err(_) if already_recorded => {
                info!(peer = %target.short(), skill = %skill, "target already holds this endorsement");
                Err(ProfileError::AlreadyEndorsed {
                    endorser: self.identity,
                    skill,
                })
            }
            Err(e) => {
                warn!(peer = %target.short(), skill = %skill, error = %e, "endorsement delivery failed");
                Err(ProfileError::EndorsementDeliveryFailed {
                    peer: target,
                    skill,
                    reason: format!("{:#}", e),
                })
            }
        }
    }

    /// Record an endorsement from `from`, the authenticated caller.
    pub async fn receive_endorsement(&self, from: Identity, delivery: EndorsementDelivery) -> ProfileResult<()> {
        self.request(|reply| Command::ReceiveEndorsement { from, delivery, reply })
            .await?
    }

    pub async fn skill_endorsements(&self, skill: &str) -> ProfileResult<Vec<Endorsement>> {
        let skill = skill.to_string();
        self.read(move |state| state.skill_endorsements(&skill)).await
    }

    pub async fn has_endorsed_skill(&self, skill: &str, endorser: Identity) -> ProfileResult<bool> {
        let skill = skill.to_string();
        self.read(move |state| state.has_endorsed_skill(&skill, &endorser)).await
    }

    pub async fn all_endorsed_skills(&self) -> ProfileResult<Vec<String>> {
        self.read(|state| state.all_endorsed_skills()).await
    }

    pub async fn has_given_endorsement(&self, target: Identity, skill: &str) -> ProfileResult<bool> {
        let skill = skill.to_string();
        self.read(move |state| state.has_given_endorsement(&target, &skill)).await
    }

    /// Per-skill counts and ×100 average ratings, from a single snapshot.
    pub async fn endorsement_count(&self) -> ProfileResult<usize> {
        self.read(|state| state.endorsement_count()).await
    }

    pub async fn endorsement_summary(&self) -> ProfileResult<EndorsementSummary> {
        self.read(|state| state.endorsement_summary()).await
    }
}

// ============================================================================
// Actor (owns all mutable state)
// ============================================================================

struct ProfileNodeActor {
    state: NodeState,
    store: Option<NodeStore>,
    events: mpsc::Sender<ProfileEvent>,
    require_listed_skill: bool,
}

impl ProfileNodeActor {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::Quit => {
                    debug!("profile actor quitting");
                    break;
                }
                cmd => self.handle(cmd),
            }
        }
        debug!(node = %self.state.identity().short(), "profile actor stopped");
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::UpdateProfile(caller, update, reply) => {
                let result = self.state.update_profile(caller, update);
                self.after_profile_change(&result);
                let _ = reply.send(result);
            }
            Command::UpdateSkills(caller, skills, reply) => {
                let result = self.state.update_skills(caller, skills);
                self.after_profile_change(&result);
                let _ = reply.send(result);
            }
            Command::AddSkill(caller, skill, reply) => {
                let result = self.state.add_skill(caller, skill);
                self.after_profile_change(&result);
                let _ = reply.send(result);
            }
            Command::SetVisibility(caller, is_public, reply) => {
                let result = self.state.set_visibility(caller, is_public);
                self.after_profile_change(&result);
                let _ = reply.send(result);
            }
            Command::BeginConnectionRequest { caller, remote, reply } => {
                let result = self.state.begin_connection_request(caller, &remote);
                if result.is_ok() {
                    self.persist();
                }
                let _ = reply.send(result);
            }
            Command::ConnectionRequestDelivered { peer } => {
                self.emit(ProfileEvent::ConnectionRequested {
                    from: self.state.identity(),
                    to: peer,
                });
            }
            Command::RollbackConnectionRequest { peer, reply } => {
                let reset = self.state.rollback_connection_request(&peer);
                if reset {
                    self.persist();
                }
                let _ = reply.send(reset);
            }
            Command::ReceiveConnectionRequest { from, reply } => {
                let peer = from.identity;
                let result = self.state.receive_connection_request(&from);
                match &result {
                    Ok(()) => {
                        self.persist();
                        info!(peer = %peer.short(), "incoming connection request");
                    }
                    Err(e) => debug!(peer = %peer.short(), error = %e, "refused connection request"),
                }
                let _ = reply.send(result);
            }
            Command::AcceptConnectionRequest { caller, from, reply } => {
                let result = self.state.accept_connection_request(caller, &from);
                if result.is_ok() {
                    self.persist();
                    info!(peer = %from.short(), "accepted connection request");
                    self.emit(ProfileEvent::ConnectionAccepted {
                        requester: from,
                        accepter: self.state.identity(),
                    });
                }
                let _ = reply.send(result);
            }
            Command::ConfirmConnection { friend, reply } => {
                let result = self.state.confirm_connection(&friend);
                match &result {
                    Ok(()) => {
                        self.persist();
                        info!(peer = %friend.short(), "connection confirmed");
                    }
                    Err(e) => debug!(peer = %friend.short(), error = %e, "refused confirmation"),
                }
                let _ = reply.send(result);
            }
            Command::RejectConnectionRequest { caller, from, reply } => {
                let result = self.state.reject_connection_request(caller, &from);
                if result.is_ok() {
                    self.persist();
                    debug!(peer = %from.short(), "rejected connection request");
                }
                let _ = reply.send(result);
            }
            Command::BeginEndorsement { caller, target, delivery, reply } => {
                let result = self.state.begin_endorsement(
                    caller,
                    &target,
                    &delivery.skill,
                    delivery.rating,
                    &delivery.comment,
                );
                let _ = reply.send(result);
            }
            Command::FinishEndorsement { target, skill, delivered, reply } => {
                self.state.finish_endorsement(&target, &skill, delivered);
                if delivered {
                    self.persist();
                }
                let _ = reply.send(());
            }
            Command::ReceiveEndorsement { from, delivery, reply } => {
                let result = self.state.receive_endorsement(
                    &from,
                    &delivery.skill,
                    delivery.rating,
                    &delivery.comment,
                    self.require_listed_skill,
                );
                let result = match result {
                    Ok(record) => {
                        self.persist();
                        info!(
                            endorser = %from.short(),
                            skill = %record.skill,
                            rating = record.rating,
                            "endorsement recorded"
                        );
                        self.emit(ProfileEvent::SkillEndorsed {
                            endorser: from,
                            endorsed: self.state.identity(),
                            skill: record.skill,
                            rating: record.rating,
                        });
                        Ok(())
                    }
                    Err(e) => {
                        debug!(endorser = %from.short(), error = %e, "refused endorsement");
                        Err(e)
                    }
                };
                let _ = reply.send(result);
            }
            Command::Read(f) => f(&self.state),
            Command::Quit => {}
        }
    }

    fn after_profile_change(&mut self, result: &ProfileResult<()>) {
        if result.is_ok() {
            self.persist();
            self.emit(ProfileEvent::ProfileUpdated {
                owner: self.state.owner(),
            });
        }
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.save_state(&self.state) {
            error!(
                dir = %store.dir().display(),
                error = %format!("{:#}", e),
                "failed to persist node state"
            );
        }
    }

    fn emit(&self, event: ProfileEvent) {
        match self.events.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(?event, "event channel full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}
