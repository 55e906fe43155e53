use std::path::PathBuf;
use std::time::Duration;

use crate::identity::Identity;

/// Default timeout for a single cross-node call.
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Default capacity of the profile event channel.
pub const DEFAULT_EVENT_CHANNEL_SIZE: usize = 1024;

/// Profile node configuration.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Directory holding `node.key` and `state.bin`. `None` keeps everything
    /// in memory and generates a fresh keypair.
    pub data_dir: Option<PathBuf>,
    /// Controlling principal. Defaults to the node's own identity.
    pub owner: Option<Identity>,
    /// Reject endorsements for skills not on the current profile.
    pub require_listed_skill: bool,
    pub rpc_timeout: Duration,
    /// Events beyond this many unread are dropped with a warning.
    pub event_channel_size: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            owner: None,
            require_listed_skill: true,
            rpc_timeout: DEFAULT_RPC_TIMEOUT,
            event_channel_size: DEFAULT_EVENT_CHANNEL_SIZE,
        }
    }
}

impl NodeConfig {
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_owner(mut self, owner: Identity) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn with_require_listed_skill(mut self, require: bool) -> Self {
        self.require_listed_skill = require;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }
}
