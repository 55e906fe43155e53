//! Protocol trait definitions for the cross-node invocation layer.
//!
//! | Trait | Purpose |
//! |-------|---------|
//! | [`ProfilePeerRpc`] | handshake and endorsement delivery into a counterpart |
//! | [`ProfileQueryRpc`] | read-only queries against a remote node |
//!
//! Every call reports success or failure; `Err` covers an unreachable
//! target, a target that does not speak the protocol, and a target whose own
//! logic refused the call. Callers treat `Err` as an expected outcome and
//! apply their own compensation. Nothing here retries.
//!
//! The caller's identity is never a parameter: the receiving side learns it
//! from the authenticated transport.

use anyhow::Result;
use async_trait::async_trait;

use crate::aggregation::EndorsementSummary;
use crate::identity::Contact;
use crate::ledger::Endorsement;
use crate::messages::EndorsementDelivery;
use crate::profile::Profile;

/// Calls a profile node makes into a counterpart.
#[async_trait]
pub trait ProfilePeerRpc: Send + Sync + 'static {
    /// Ask `to` to record an incoming connection request from us.
    async fn receive_connection_request(&self, to: &Contact) -> Result<()>;

    /// Tell `to` that we accepted its request.
    async fn confirm_connection(&self, to: &Contact) -> Result<()>;

    /// Deliver an endorsement into `to`'s ledger.
    async fn receive_endorsement(&self, to: &Contact, delivery: EndorsementDelivery) -> Result<()>;
}

/// Read-only remote queries.
#[async_trait]
pub trait ProfileQueryRpc: Send + Sync {
    async fn fetch_profile(&self, to: &Contact) -> Result<Profile>;

    async fn fetch_summary(&self, to: &Contact) -> Result<EndorsementSummary>;

    async fn fetch_skill_endorsements(&self, to: &Contact, skill: &str) -> Result<Vec<Endorsement>>;
}
