//! # Connection State Machine
//!
//! Each node keeps its own directional view of every counterpart:
//!
//! ```text
//! None ──send──▶ OutgoingPending ──confirm──▶ Connected
//! None ──recv──▶ IncomingPending ──accept───▶ Connected
//!                IncomingPending ──reject───▶ None
//! ```
//!
//! `Connected` is terminal. A pair is connected only when both nodes' local
//! views are `Connected`; the handshake driven by
//! [`crate::profile_node::ProfileNode`] gets there through two independent
//! tables, one per node.
//!
//! The table here is purely local and synchronous: every method either
//! applies one transition completely or returns an error and leaves the
//! table untouched. Cross-node effects are sequenced by the caller.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ProfileError, ProfileResult};
use crate::identity::{Contact, Identity};

/// Local view of the edge to one counterpart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    None,
    OutgoingPending,
    IncomingPending,
    Connected,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionTable {
    /// Absent key means [`ConnectionState::None`].
    states: BTreeMap<Identity, ConnectionState>,
    /// Confirmed peers in the order they became connected.
    connected: Vec<Identity>,
    connection_count: u64,
    /// Last known contact for each counterpart.
    peer_book: BTreeMap<Identity, Contact>,
}

impl ConnectionTable {
    pub fn state(&self, peer: &Identity) -> ConnectionState {
        self.states.get(peer).copied().unwrap_or_default()
    }

    pub fn is_connected(&self, peer: &Identity) -> bool {
        self.state(peer) == ConnectionState::Connected
    }

    pub fn connections(&self) -> &[Identity] {
        &self.connected
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_count
    }

    pub fn contact(&self, peer: &Identity) -> Option<&Contact> {
        self.peer_book.get(peer)
    }

    pub fn pending_incoming(&self) -> Vec<Identity> {
        self.with_state(ConnectionState::IncomingPending)
    }

    pub fn pending_outgoing(&self) -> Vec<Identity> {
        self.with_state(ConnectionState::OutgoingPending)
    }

    fn with_state(&self, wanted: ConnectionState) -> Vec<Identity> {
        self.states
            .iter()
            .filter(|(_, state)| **state == wanted)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Tentatively record an outgoing request to `remote`.
    ///
    /// The caller must deliver the request and then either keep this state or
    /// undo it with [`ConnectionTable::rollback_outgoing`].
    pub fn begin_outgoing(&mut self, local: Identity, remote: &Contact) -> ProfileResult<()> {
        let peer = remote.identity;
        if peer == local {
            return Err(ProfileError::SelfConnection);
        }
        match self.state(&peer) {
            ConnectionState::Connected => return Err(ProfileError::AlreadyConnected(peer)),
            ConnectionState::OutgoingPending => return Err(ProfileError::RequestAlreadySent(peer)),
            ConnectionState::IncomingPending => {
                return Err(ProfileError::IncomingRequestPending(peer));
            }
            ConnectionState::None => {}
        }
        self.states.insert(peer, ConnectionState::OutgoingPending);
        self.peer_book.insert(peer, remote.clone());
        Ok(())
    }

    /// Undo a tentative outgoing request. Only an `OutgoingPending` entry is
    /// reset; returns whether a reset happened.
    pub fn rollback_outgoing(&mut self, peer: &Identity) -> bool {
        if self.state(peer) == ConnectionState::OutgoingPending {
            self.states.remove(peer);
            true
        } else {
            false
        }
    }

    /// Record an incoming request from `from`, whose identity has already
    /// been authenticated by the transport.
    pub fn register_incoming(&mut self, from: &Contact) -> ProfileResult<()> {
        let peer = from.identity;
        match self.state(&peer) {
            ConnectionState::Connected => return Err(ProfileError::AlreadyConnected(peer)),
            ConnectionState::IncomingPending => return Err(ProfileError::DuplicateRequest(peer)),
            ConnectionState::OutgoingPending => return Err(ProfileError::CrossedRequest(peer)),
            ConnectionState::None => {}
        }
        self.states.insert(peer, ConnectionState::IncomingPending);
        self.peer_book.insert(peer, from.clone());
        Ok(())
    }

    /// Accept a pending incoming request. Returns the requester's contact so
    /// the acceptance can be confirmed on the remote side.
    pub fn accept_incoming(&mut self, from: &Identity) -> ProfileResult<Option<Contact>> {
        match self.state(from) {
            ConnectionState::Connected => return Err(ProfileError::AlreadyConnected(*from)),
            ConnectionState::IncomingPending => {}
            _ => return Err(ProfileError::NoPendingRequest(*from)),
        }
        self.mark_connected(*from);
        Ok(self.peer_book.get(from).cloned())
    }

    /// Finalize our outgoing request after the counterpart accepted it.
    pub fn confirm_outgoing(&mut self, friend: &Identity) -> ProfileResult<()> {
        if self.state(friend) != ConnectionState::OutgoingPending {
            return Err(ProfileError::NoPendingRequest(*friend));
        }
        self.mark_connected(*friend);
        Ok(())
    }

    pub fn reject_incoming(&mut self, from: &Identity) -> ProfileResult<()> {
        if self.state(from) != ConnectionState::IncomingPending {
            return Err(ProfileError::NoPendingRequest(*from));
        }
        self.states.remove(from);
        Ok(())
    }

    fn mark_connected(&mut self, peer: Identity) {
        self.states.insert(peer, ConnectionState::Connected);
        self.connected.push(peer);
        self.connection_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(seed: u8) -> Identity {
        Identity::from_bytes([seed; 32])
    }

    fn contact(seed: u8) -> Contact {
        Contact::single(id(seed), format!("10.0.0.{}:9000", seed))
    }

    #[test]
    fn outgoing_then_confirm_connects() {
        let mut table = ConnectionTable::default();
        table.begin_outgoing(id(1), &contact(2)).expect("begin");
        assert_eq!(table.state(&id(2)), ConnectionState::OutgoingPending);

        table.confirm_outgoing(&id(2)).expect("confirm");
        assert!(table.is_connected(&id(2)));
        assert_eq!(table.connections(), &[id(2)]);
        assert_eq!(table.connection_count(), 1);
    }

    #[test]
    fn self_connection_rejected() {
        let mut table = ConnectionTable::default();
        let err = table.begin_outgoing(id(1), &contact(1)).unwrap_err();
        assert_eq!(err, ProfileError::SelfConnection);
        assert_eq!(table.state(&id(1)), ConnectionState::None);
    }

    #[test]
    fn repeated_outgoing_rejected() {
        let mut table = ConnectionTable::default();
        table.begin_outgoing(id(1), &contact(2)).expect("begin");
        assert_eq!(
            table.begin_outgoing(id(1), &contact(2)).unwrap_err(),
            ProfileError::RequestAlreadySent(id(2))
        );

        table.confirm_outgoing(&id(2)).expect("confirm");
        assert_eq!(
            table.begin_outgoing(id(1), &contact(2)).unwrap_err(),
            ProfileError::AlreadyConnected(id(2))
        );
    }

    #[test]
    fn rollback_only_resets_outgoing_pending() {
        let mut table = ConnectionTable::default();
        table.begin_outgoing(id(1), &contact(2)).expect("begin");
        assert!(table.rollback_outgoing(&id(2)));
        assert_eq!(table.state(&id(2)), ConnectionState::None);

        table.register_incoming(&contact(3)).expect("incoming");
        assert!(!table.rollback_outgoing(&id(3)));
        assert_eq!(table.state(&id(3)), ConnectionState::IncomingPending);
    }

    #[test]
    fn incoming_accept_connects_and_returns_contact() {
        let mut table = ConnectionTable::default();
        table.register_incoming(&contact(4)).expect("incoming");
        assert_eq!(table.pending_incoming(), vec![id(4)]);

        let confirmed = table.accept_incoming(&id(4)).expect("accept");
        assert_eq!(confirmed, Some(contact(4)));
        assert!(table.is_connected(&id(4)));
        assert!(table.pending_incoming().is_empty());
    }

    #[test]
    fn duplicate_and_conflicting_incoming_rejected() {
        let mut table = ConnectionTable::default();
        table.register_incoming(&contact(4)).expect("incoming");
        assert_eq!(
            table.register_incoming(&contact(4)).unwrap_err(),
            ProfileError::DuplicateRequest(id(4))
        );

        table.begin_outgoing(id(1), &contact(5)).expect("begin");
        assert_eq!(
            table.register_incoming(&contact(5)).unwrap_err(),
            ProfileError::CrossedRequest(id(5))
        );
        assert_eq!(table.state(&id(5)), ConnectionState::OutgoingPending);

        table.accept_incoming(&id(4)).expect("accept");
        assert_eq!(
            table.register_incoming(&contact(4)).unwrap_err(),
            ProfileError::AlreadyConnected(id(4))
        );
    }

    #[test]
    fn outgoing_while_incoming_pending_rejected() {
        let mut table = ConnectionTable::default();
        table.register_incoming(&contact(6)).expect("incoming");
        assert_eq!(
            table.begin_outgoing(id(1), &contact(6)).unwrap_err(),
            ProfileError::IncomingRequestPending(id(6))
        );
        assert_eq!(table.state(&id(6)), ConnectionState::IncomingPending);
    }

    #[test]
    fn accept_and_confirm_require_matching_pending_state() {
        let mut table = ConnectionTable::default();
        assert_eq!(
            table.accept_incoming(&id(7)).unwrap_err(),
            ProfileError::NoPendingRequest(id(7))
        );
        assert_eq!(
            table.confirm_outgoing(&id(7)).unwrap_err(),
            ProfileError::NoPendingRequest(id(7))
        );

        table.begin_outgoing(id(1), &contact(7)).expect("begin");
        assert_eq!(
            table.accept_incoming(&id(7)).unwrap_err(),
            ProfileError::NoPendingRequest(id(7))
        );

        table.confirm_outgoing(&id(7)).expect("confirm");
        assert_eq!(
            table.confirm_outgoing(&id(7)).unwrap_err(),
            ProfileError::NoPendingRequest(id(7))
        );
        assert_eq!(table.connection_count(), 1);
    }

    #[test]
    fn reject_clears_incoming_silently() {
        let mut table = ConnectionTable::default();
        table.register_incoming(&contact(8)).expect("incoming");
        table.reject_incoming(&id(8)).expect("reject");
        assert_eq!(table.state(&id(8)), ConnectionState::None);
        assert_eq!(
            table.reject_incoming(&id(8)).unwrap_err(),
            ProfileError::NoPendingRequest(id(8))
        );

        // A fresh request after rejection starts over.
        table.register_incoming(&contact(8)).expect("incoming again");
        assert_eq!(table.state(&id(8)), ConnectionState::IncomingPending);
    }

    #[test]
    fn connections_keep_insertion_order() {
        let mut table = ConnectionTable::default();
        for seed in [9u8, 3, 6] {
            table.register_incoming(&contact(seed)).expect("incoming");
            table.accept_incoming(&id(seed)).expect("accept");
        }
        assert_eq!(table.connections(), &[id(9), id(3), id(6)]);
        assert_eq!(table.connection_count(), 3);
        assert_eq!(table.connections(), table.connections());
    }
}
