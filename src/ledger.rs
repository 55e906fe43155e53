//! # Endorsement Ledger
//!
//! Endorsements are stored on the *endorsed* node: an append-only list of
//! records per skill, a permanent duplicate guard per `(endorser, skill)`,
//! and the index of skills that have at least one record, in the order each
//! skill first received one.
//!
//! Connection gating and skill-listing checks belong to
//! [`crate::state::NodeState`], which consults the connection table and
//! profile before calling [`EndorsementLedger::record`].

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{ProfileError, ProfileResult};
use crate::identity::Identity;
use crate::profile::validate_skill_name;

pub const MIN_RATING: u8 = 1;
pub const MAX_RATING: u8 = 10;
pub const MAX_COMMENT_LEN: usize = 1024;

/// An immutable attestation of one skill by one connected peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endorsement {
    pub endorser: Identity,
    pub skill: String,
    pub rating: u8,
    pub comment: String,
    /// Processing time on the endorsed node.
    pub created_at_ms: u64,
}

/// Validate the caller-supplied part of an endorsement.
///
/// Applied twice: by the endorser before delivery and again by the endorsed
/// node on receipt, since the endorsed node cannot trust the sender.
pub(crate) fn validate_endorsement(skill: &str, rating: u8, comment: &str) -> ProfileResult<()> {
    if !(MIN_RATING..=MAX_RATING).contains(&rating) {
        return Err(ProfileError::InvalidRating(rating));
    }
    validate_skill_name(skill)?;
    if comment.len() > MAX_COMMENT_LEN {
        return Err(ProfileError::invalid(format!(
            "comment too long: {} bytes (max {})",
            comment.len(),
            MAX_COMMENT_LEN
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementLedger {
    records: BTreeMap<String, Vec<Endorsement>>,
    /// `(endorser, skill)` pairs already accepted. Never cleared.
    received: BTreeSet<(Identity, String)>,
    /// Skills with at least one record, in first-insertion order.
    index: Vec<String>,
}

impl EndorsementLedger {
    /// Append an endorsement and set its duplicate guard.
    ///
    /// Returns `true` when this was the first record for the skill, i.e. the
    /// skill was just added to the index.
    pub fn record(&mut self, endorsement: Endorsement) -> ProfileResult<bool> {
        let guard = (endorsement.endorser, endorsement.skill.clone());
        if self.received.contains(&guard) {
            return Err(ProfileError::AlreadyEndorsed {
                endorser: endorsement.endorser,
                skill: endorsement.skill,
            });
        }

        let list = self.records.entry(endorsement.skill.clone()).or_default();
        let first = list.is_empty();
        if first {
            self.index.push(endorsement.skill.clone());
        }
        list.push(endorsement);
        self.received.insert(guard);
        Ok(first)
    }

    pub fn skill_endorsements(&self, skill: &str) -> &[Endorsement] {
        self.records.get(skill).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_endorsed_skill(&self, skill: &str, endorser: &Identity) -> bool {
        self.received.contains(&(*endorser, skill.to_string()))
    }

    pub fn endorsed_skills(&self) -> &[String] {
        &self.index
    }

    /// Indexed skills with their records, in index order.
    pub fn iter_indexed(&self) -> impl Iterator<Item = (&str, &[Endorsement])> {
        self.index
            .iter()
            .map(|skill| (skill.as_str(), self.skill_endorsements(skill)))
    }

    pub fn total_records(&self) -> usize {
        self.records.values().map(Vec::len).sum()
    }
}
