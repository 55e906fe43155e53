//! # profilemesh - Peer-to-Peer Professional Identity Network
//!
//! Every participant runs a node that holds its own profile, its connection
//! states toward other nodes, and the endorsements it has received. Nodes
//! talk to each other directly:
//!
//! - **Identity**: Ed25519 public keys (32 bytes); the key proven during the
//!   TLS handshake is the caller identity for every request
//! - **Connections**: a request/accept handshake per directed pair, with
//!   rollback when the request cannot be delivered
//! - **Endorsements**: one rating (1-10) per endorser per skill, delivered
//!   into the target's ledger and aggregated into ×100 fixed-point averages
//!
//! ## Architecture
//!
//! - Each node's state is owned by a single actor (`ProfileNode`); handles are
//!   cheap to clone and communicate via async channels
//! - Local effects commit before any outbound call and are compensated when
//!   the call fails; the actor never waits on the network
//! - State is snapshotted to disk after every committed mutation
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API: endpoint, listener, persistence wiring |
//! | `profile_node` | State actor and the handshake/endorsement orchestration |
//! | `state` | Per-node state and owner guard |
//! | `connections` | Connection state machine per directed pair |
//! | `ledger` | Endorsement records and duplicate guard |
//! | `aggregation` | Per-skill counts and average ratings |
//! | `profile` | Profile fields and skill list |
//! | `identity` | Keypairs, Identities, Contacts |
//! | `crypto` | TLS certificate generation and verification |
//! | `protocols` | Cross-node call traits |
//! | `rpc` | QUIC transport implementing the protocols |
//! | `messages` | Wire types |
//! | `storage` | Key file and state snapshots |

mod aggregation;
mod config;
mod connections;
mod crypto;
mod error;
mod events;
mod identity;
mod ledger;
mod messages;
mod node;
mod profile;
mod profile_node;
mod protocols;
mod rpc;
mod state;
mod storage;

pub use aggregation::{EndorsementSummary, RATING_SCALE, SkillSummary};
pub use config::NodeConfig;
pub use connections::ConnectionState;
pub use error::{ErrorKind, ProfileError, ProfileResult};
pub use events::ProfileEvent;
pub use identity::{Contact, Identity, Keypair};
pub use ledger::{Endorsement, MAX_RATING, MIN_RATING};
pub use messages::{
    EndorsementDelivery, OwnerCommand, PeerRequest, QueryRequest, RpcRequest, RpcResponse,
};
pub use node::{Node, admin_client};
pub use profile::{Profile, ProfileUpdate};
pub use profile_node::{AcceptOutcome, ProfileNode};
pub use protocols::{ProfilePeerRpc, ProfileQueryRpc};
pub use rpc::RpcNode;
pub use state::NodeState;
pub use storage::{NodeStore, load_key_file, write_key_file};
