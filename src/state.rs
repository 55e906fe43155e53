//! # Node State
//!
//! Everything one node owns: its owner, profile, connection table,
//! endorsement ledger, and the endorser-side guard of endorsements it has
//! already delivered.
//!
//! All methods are synchronous and atomic: they either apply completely or
//! return an error with the state unchanged. Owner-only operations take the
//! authenticated `caller` and check it against [`NodeState::owner`] before
//! anything else.
//!
//! Operations that reach a counterpart are split into a local commit
//! (`begin_*`) and a finalize/compensate step (`rollback_*`, `finish_*`);
//! the remote call happens in between, outside this type.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::aggregation::{EndorsementSummary, summarize};
use crate::connections::{ConnectionState, ConnectionTable};
use crate::error::{ProfileError, ProfileResult};
use crate::identity::{Contact, Identity, now_ms};
use crate::ledger::{Endorsement, EndorsementLedger, validate_endorsement};
use crate::profile::{Profile, ProfileUpdate};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeState {
    identity: Identity,
    owner: Identity,
    profile: Profile,
    connections: ConnectionTable,
    ledger: EndorsementLedger,
    /// `(target, skill)` endorsements this node has delivered.
    given: BTreeSet<(Identity, String)>,
    /// Endorsements currently being delivered. Not persisted: a restart
    /// aborts any delivery in progress.
    #[serde(skip)]
    in_flight: BTreeSet<(Identity, String)>,
}

impl NodeState {
    pub fn new(identity: Identity, owner: Identity) -> Self {
        Self {
            identity,
            owner,
            profile: Profile::new(now_ms()),
            connections: ConnectionTable::default(),
            ledger: EndorsementLedger::default(),
            given: BTreeSet::new(),
            in_flight: BTreeSet::new(),
        }
    }

    pub fn identity(&self) -> Identity {
        self.identity
    }

    pub fn owner(&self) -> Identity {
        self.owner
    }

    pub(crate) fn set_owner(&mut self, owner: Identity) {
        self.owner = owner;
    }

    pub fn authorize(&self, caller: Identity) -> ProfileResult<()> {
        if caller != self.owner {
            return Err(ProfileError::Unauthorized { caller });
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Profile store
    // ------------------------------------------------------------------

    pub fn update_profile(&mut self, caller: Identity, update: ProfileUpdate) -> ProfileResult<()> {
        self.authorize(caller)?;
        self.profile.apply_update(update, now_ms())
    }

    pub fn update_skills(&mut self, caller: Identity, skills: Vec<String>) -> ProfileResult<()> {
        self.authorize(caller)?;
        self.profile.set_skills(skills, now_ms())
    }

    pub fn add_skill(&mut self, caller: Identity, skill: String) -> ProfileResult<()> {
        self.authorize(caller)?;
        self.profile.add_skill(skill, now_ms())
    }

    pub fn set_visibility(&mut self, caller: Identity, is_public: bool) -> ProfileResult<()> {
        self.authorize(caller)?;
        self.profile.set_visibility(is_public, now_ms());
        Ok(())
    }

    /// Hidden profiles are only readable by the owner.
    pub fn get_profile(&self, caller: Identity) -> ProfileResult<Profile> {
        if !self.profile.is_public && caller != self.owner {
            return Err(ProfileError::NotPublic);
        }
        Ok(self.profile.clone())
    }

    pub fn skill_count(&self) -> usize {
        self.profile.skill_count()
    }

    // ------------------------------------------------------------------
    // Connections
    // ------------------------------------------------------------------

    /// Commit `OutgoingPending` for `remote` before the request is delivered.
    pub fn begin_connection_request(&mut self, caller: Identity, remote: &Contact) -> ProfileResult<()> {
        self.authorize(caller)?;
        if !remote.validate_structure() {
            return Err(ProfileError::invalid("malformed contact"));
        }
        self.connections.begin_outgoing(self.identity, remote)
    }

    /// Compensate a failed delivery. Only resets a still-pending request.
    pub fn rollback_connection_request(&mut self, peer: &Identity) -> bool {
        self.connections.rollback_outgoing(peer)
    }

    /// `from` must be the transport-authenticated caller.
    pub fn receive_connection_request(&mut self, from: &Contact) -> ProfileResult<()> {
        if from.identity == self.identity {
            return Err(ProfileError::SelfConnection);
        }
        if !from.validate_structure() {
            return Err(ProfileError::invalid("malformed contact"));
        }
        self.connections.register_incoming(from)
    }

    /// Returns the requester's contact, to confirm the acceptance remotely.
    pub fn accept_connection_request(
        &mut self,
        caller: Identity,
        from: &Identity,
    ) -> ProfileResult<Option<Contact>> {
        self.authorize(caller)?;
        self.connections.accept_incoming(from)
    }

    pub fn confirm_connection(&mut self, friend: &Identity) -> ProfileResult<()> {
        self.connections.confirm_outgoing(friend)
    }

    pub fn reject_connection_request(&mut self, caller: Identity, from: &Identity) -> ProfileResult<()> {
        self.authorize(caller)?;
        self.connections.reject_incoming(from)
    }

    pub fn connections(&self) -> &[Identity] {
        self.connections.connections()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.connection_count()
    }

    pub fn check_connection(&self, peer: &Identity) -> bool {
        self.connections.is_connected(peer)
    }

    pub fn connection_state(&self, peer: &Identity) -> ConnectionState {
        self.connections.state(peer)
    }

    pub fn pending_requests(&self) -> Vec<Identity> {
        self.connections.pending_incoming()
    }

    pub fn pending_outgoing(&self) -> Vec<Identity> {
        self.connections.pending_outgoing()
    }

    pub fn contact(&self, peer: &Identity) -> Option<&Contact> {
        self.connections.contact(peer)
    }

    // ------------------------------------------------------------------
    // Endorsements
    // ------------------------------------------------------------------

    /// Reserve `(target, skill)` for delivery and return where to deliver it.
    ///
    /// The reservation blocks a concurrent endorsement of the same pair until
    /// [`NodeState::finish_endorsement`] releases it.
    pub fn begin_endorsement(
        &mut self,
        caller: Identity,
        target: &Identity,
        skill: &str,
        rating: u8,
        comment: &str,
    ) -> ProfileResult<Contact> {
        self.authorize(caller)?;
        validate_endorsement(skill, rating, comment)?;
        if !self.connections.is_connected(target) {
            return Err(ProfileError::NotConnected(*target));
        }
        let key = (*target, skill.to_string());
        if self.given.contains(&key) || self.in_flight.contains(&key) {
            return Err(ProfileError::AlreadyEndorsed {
                endorser: self.identity,
                skill: skill.to_string(),
            });
        }
        let contact = self
            .connections
            .contact(target)
            .cloned()
            .ok_or(ProfileError::NotConnected(*target))?;
        self.in_flight.insert(key);
        Ok(contact)
    }

    /// Release the reservation; consume the one-shot allowance only if the
    /// target recorded the endorsement.
    pub fn finish_endorsement(&mut self, target: &Identity, skill: &str, delivered: bool) {
        let key = (*target, skill.to_string());
        self.in_flight.remove(&key);
        if delivered {
            self.given.insert(key);
        }
    }

    /// Record an endorsement from `from`, the transport-authenticated caller.
    pub fn receive_endorsement(
        &mut self,
        from: &Identity,
        skill: &str,
        rating: u8,
        comment: &str,
        require_listed_skill: bool,
    ) -> ProfileResult<Endorsement> {
        if !self.connections.is_connected(from) {
            return Err(ProfileError::NotConnected(*from));
        }
        validate_endorsement(skill, rating, comment)?;
        if require_listed_skill && !self.profile.has_skill(skill) {
            return Err(ProfileError::UnknownSkill(skill.to_string()));
        }

        let endorsement = Endorsement {
            endorser: *from,
            skill: skill.to_string(),
            rating,
            comment: comment.to_string(),
            created_at_ms: now_ms(),
        };
        self.ledger.record(endorsement.clone())?;
        Ok(endorsement)
    }

    pub fn skill_endorsements(&self, skill: &str) -> Vec<Endorsement> {
        self.ledger.skill_endorsements(skill).to_vec()
    }

    pub fn has_endorsed_skill(&self, skill: &str, endorser: &Identity) -> bool {
        self.ledger.has_endorsed_skill(skill, endorser)
    }

    pub fn all_endorsed_skills(&self) -> Vec<String> {
        self.ledger.endorsed_skills().to_vec()
    }

    /// Received endorsement records across all skills.
    pub fn endorsement_count(&self) -> usize {
        self.ledger.total_records()
    }

    pub fn has_given_endorsement(&self, target: &Identity, skill: &str) -> bool {
        self.given.contains(&(*target, skill.to_string()))
    }

    pub fn endorsement_summary(&self) -> EndorsementSummary {
        summarize(&self.ledger)
    }
}
