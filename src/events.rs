use serde::{Deserialize, Serialize};

use crate::identity::Identity;

/// Notification emitted once for every committed state transition, on the
/// node where the transition committed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProfileEvent {
    /// Profile fields, skills or visibility changed.
    ProfileUpdated { owner: Identity },
    /// Our request reached `to`, which now holds it as pending.
    ConnectionRequested { from: Identity, to: Identity },
    /// We accepted a request from `requester`.
    ConnectionAccepted { requester: Identity, accepter: Identity },
    /// An endorsement was recorded on this node.
    SkillEndorsed {
        endorser: Identity,
        endorsed: Identity,
        skill: String,
        rating: u8,
    },
}
