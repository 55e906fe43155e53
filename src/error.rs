//! Protocol error taxonomy.
//!
//! [`ProfileError`] is returned by every profile, connection and endorsement
//! operation. It is serializable so a node can report the exact rejection to
//! a remote caller (an owner administering the node over RPC, or a peer whose
//! delivery was refused).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::Identity;

pub type ProfileResult<T> = Result<T, ProfileError>;

/// Coarse classification of a [`ProfileError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A non-owner attempted an owner-only operation.
    Authorization,
    /// Rating out of range, self-targeting, or a bounds violation.
    InvalidInput,
    /// The operation conflicts with the current connection or guard state.
    StateConflict,
    /// The operation requires a confirmed connection.
    NotConnected,
    /// The requested data does not exist or is not visible.
    NotFound,
    /// A cross-node invocation failed.
    DeliveryFailed,
    /// The local node actor has shut down.
    Unavailable,
}

#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ProfileError {
    #[error("caller {caller} is not the owner of this node")]
    Unauthorized { caller: Identity },

    #[error("a node cannot connect to itself")]
    SelfConnection,

    #[error("rating {0} is outside 1..=10")]
    InvalidRating(u8),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("already connected to {0}")]
    AlreadyConnected(Identity),

    #[error("connection request to {0} already sent")]
    RequestAlreadySent(Identity),

    #[error("connection request from {0} already pending")]
    DuplicateRequest(Identity),

    #[error("no pending connection request involving {0}")]
    NoPendingRequest(Identity),

    /// The counterpart already asked us; the owner should accept instead.
    #[error("{0} has already requested a connection; accept it instead")]
    IncomingRequestPending(Identity),

    /// Both sides requested concurrently and the requests crossed in flight.
    #[error("connection requests with {0} crossed in flight")]
    CrossedRequest(Identity),

    #[error("{endorser} already endorsed skill {skill:?}")]
    AlreadyEndorsed { endorser: Identity, skill: String },

    #[error("not connected to {0}")]
    NotConnected(Identity),

    #[error("skill {0:?} is not listed on this profile")]
    UnknownSkill(String),

    #[error("profile is not public")]
    NotPublic,

    #[error("connection request delivery to {peer} failed: {reason}")]
    DeliveryFailed { peer: Identity, reason: String },

    #[error("endorsement of {skill:?} to {peer} failed: {reason}")]
    EndorsementDeliveryFailed {
        peer: Identity,
        skill: String,
        reason: String,
    },

    #[error("profile node unavailable")]
    Unavailable,
}

impl ProfileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProfileError::Unauthorized { .. } => ErrorKind::Authorization,
            ProfileError::SelfConnection
            | ProfileError::InvalidRating(_)
            | ProfileError::InvalidInput(_) => ErrorKind::InvalidInput,
            ProfileError::AlreadyConnected(_)
            | ProfileError::RequestAlreadySent(_)
            | ProfileError::DuplicateRequest(_)
            | ProfileError::NoPendingRequest(_)
            | ProfileError::IncomingRequestPending(_)
            | ProfileError::CrossedRequest(_)
            | ProfileError::AlreadyEndorsed { .. } => ErrorKind::StateConflict,
            ProfileError::NotConnected(_) => ErrorKind::NotConnected,
            ProfileError::UnknownSkill(_) | ProfileError::NotPublic => ErrorKind::NotFound,
            ProfileError::DeliveryFailed { .. }
            | ProfileError::EndorsementDeliveryFailed { .. } => ErrorKind::DeliveryFailed,
            ProfileError::Unavailable => ErrorKind::Unavailable,
        }
    }

    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        ProfileError::InvalidInput(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn some_identity() -> Identity {
        Identity::from_bytes([7u8; 32])
    }

    #[test]
    fn kinds_follow_taxonomy() {
        let peer = some_identity();
        assert_eq!(
            ProfileError::Unauthorized { caller: peer }.kind(),
            ErrorKind::Authorization
        );
        assert_eq!(ProfileError::InvalidRating(11).kind(), ErrorKind::InvalidInput);
        assert_eq!(ProfileError::SelfConnection.kind(), ErrorKind::InvalidInput);
        assert_eq!(ProfileError::RequestAlreadySent(peer).kind(), ErrorKind::StateConflict);
        assert_eq!(
            ProfileError::AlreadyEndorsed { endorser: peer, skill: "Rust".into() }.kind(),
            ErrorKind::StateConflict
        );
        assert_eq!(ProfileError::NotConnected(peer).kind(), ErrorKind::NotConnected);
        assert_eq!(
            ProfileError::DeliveryFailed { peer, reason: "x".into() }.kind(),
            ErrorKind::DeliveryFailed
        );
    }

    #[test]
    fn errors_survive_wire_encoding() {
        let err = ProfileError::EndorsementDeliveryFailed {
            peer: some_identity(),
            skill: "Go".into(),
            reason: "peer unreachable".into(),
        };
        let bytes = bincode::serialize(&err).expect("serialize");
        let decoded: ProfileError = bincode::deserialize(&bytes).expect("deserialize");
        assert_eq!(decoded, err);
    }
}
