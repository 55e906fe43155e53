//! # Wire Protocol Messages
//!
//! All messages exchanged between profilemesh nodes. Every request travels as
//! a single [`RpcRequest`] on its own bidirectional QUIC stream, framed with
//! a 4-byte big-endian length prefix and encoded with bincode.
//!
//! ## Request Families
//!
//! | Family | Type | Caller |
//! |--------|------|--------|
//! | Peer | [`PeerRequest`] | another profile node driving a handshake or endorsement |
//! | Query | [`QueryRequest`] | anyone; read-only |
//! | Owner | [`OwnerCommand`] | the node's owner administering it remotely |
//!
//! ## Security Limits
//!
//! - Requests are capped at `MAX_REQUEST_SIZE` bytes on the server
//! - All deserialization goes through [`deserialize_bounded`]
//! - A request's claimed sender (if any) must match the TLS-verified peer

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::aggregation::EndorsementSummary;
use crate::error::ProfileError;
use crate::identity::{Contact, Identity};
use crate::ledger::Endorsement;
use crate::profile::{Profile, ProfileUpdate};

/// Maximum size of a single response payload (1 MiB).
pub const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
pub const MAX_DESERIALIZE_SIZE: u64 = (MAX_RESPONSE_SIZE as u64) + 4096;

/// Returns bincode options with size limits enforced.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize_message<T: Serialize>(message: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(message)
}

/// Endorsement payload as delivered by the endorser. The endorser's identity
/// is not part of it: the receiver takes it from the transport.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndorsementDelivery {
    pub skill: String,
    pub rating: u8,
    pub comment: String,
}

/// Node-to-node protocol calls.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PeerRequest {
    ConnectionRequest { from: Contact },
    ConfirmConnection { from: Contact },
    Endorsement {
        from: Contact,
        delivery: EndorsementDelivery,
    },
}

impl PeerRequest {
    pub fn sender(&self) -> &Contact {
        match self {
            PeerRequest::ConnectionRequest { from }
            | PeerRequest::ConfirmConnection { from }
            | PeerRequest::Endorsement { from, .. } => from,
        }
    }
}

/// Read-only queries.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum QueryRequest {
    Profile,
    Summary,
    SkillEndorsements { skill: String },
}

/// Owner-only operations, authorized against the caller's TLS identity.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum OwnerCommand {
    Connect { remote: Contact },
    Accept { from: Identity },
    Reject { from: Identity },
    /// Send the acceptance confirmation to a connected peer again.
    Reconfirm { peer: Identity },
    Endorse {
        target: Identity,
        skill: String,
        rating: u8,
        comment: String,
    },
    UpdateProfile(ProfileUpdate),
    UpdateSkills(Vec<String>),
    AddSkill(String),
    SetVisibility(bool),
    PendingRequests,
    OutgoingRequests,
    Connections,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    Peer(PeerRequest),
    Query(QueryRequest),
    Owner(OwnerCommand),
}

impl RpcRequest {
    /// Identity the request claims to come from, if it carries one.
    pub fn sender_identity(&self) -> Option<Identity> {
        match self {
            RpcRequest::Peer(peer) => Some(peer.sender().identity),
            RpcRequest::Query(_) | RpcRequest::Owner(_) => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    Ack,
    Accepted { confirmed: bool },
    Profile(Profile),
    Summary(EndorsementSummary),
    Endorsements(Vec<Endorsement>),
    Identities(Vec<Identity>),
    /// The target's protocol logic refused the call.
    Rejected(ProfileError),
    /// Transport-level or framing failure.
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contact() -> Contact {
        Contact::single(Identity::from_bytes([5u8; 32]), "127.0.0.1:4000")
    }

    #[test]
    fn peer_requests_expose_sender() {
        let request = RpcRequest::Peer(PeerRequest::Endorsement {
            from: contact(),
            delivery: EndorsementDelivery {
                skill: "Rust".into(),
                rating: 9,
                comment: "great".into(),
            },
        });
        assert_eq!(request.sender_identity(), Some(contact().identity));
        assert_eq!(RpcRequest::Query(QueryRequest::Summary).sender_identity(), None);
        assert_eq!(
            RpcRequest::Owner(OwnerCommand::PendingRequests).sender_identity(),
            None
        );
    }

    #[test]
    fn rejection_carries_protocol_error() {
        let response = RpcResponse::Rejected(ProfileError::NotConnected(contact().identity));
        let bytes = serialize_message(&response).expect("serialize");
        let decoded: RpcResponse = deserialize_bounded(&bytes).expect("deserialize");
        match decoded {
            RpcResponse::Rejected(err) => {
                assert_eq!(err, ProfileError::NotConnected(contact().identity));
            }
            other => panic!("unexpected response: {:?}", other),
        }
    }

    #[test]
    fn bounded_deserialize_rejects_garbage() {
        let garbage = vec![0xFFu8; 64];
        assert!(deserialize_bounded::<RpcRequest>(&garbage).is_err());
    }
}
