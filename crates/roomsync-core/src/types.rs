use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::{
    retry::{RateLimitPolicy, RetryPolicy},
    session::Session,
};

/// Lifecycle of a runtime-owned session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionLifecycleState {
    /// Only password credentials are known; login has not run yet.
    Unauthenticated,
    /// A login call is in flight.
    Authenticating,
    /// An access token is installed.
    Ready,
    /// The sync loop is running.
    Syncing,
    /// Unrecoverable failure; the runtime accepts no further work.
    Fatal,
}

/// Membership change acknowledged by the homeserver.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Membership {
    Join,
    Leave,
}

/// Tuning for remote calls made on behalf of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Extra attempts granted to transient failures.
    pub retry_limit: u32,
    pub retry_policy: RetryPolicy,
    pub rate_limit_policy: RateLimitPolicy,
    /// Events requested per backward pagination call.
    pub backfill_limit: u16,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_policy: RetryPolicy::default(),
            rate_limit_policy: RateLimitPolicy::default(),
            backfill_limit: 30,
        }
    }
}

/// Command channel input accepted by the session runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SessionCommand {
    /// Fetch the homeserver's advertised protocol versions.
    NegotiateVersions,
    /// Exchange pending password credentials for an access token.
    Login,
    /// Start the continuous sync loop.
    StartSync,
    /// Stop the continuous sync loop.
    StopSync,
    /// Fetch one event and merge it into its room.
    FetchEvent {
        room_id: String,
        event_id: String,
    },
    /// Fill the newest gap of a room (or extend its history backwards).
    Backfill {
        room_id: String,
    },
}

/// Sync loop status updates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncStatus {
    /// Whether sync is currently running.
    pub running: bool,
    /// Sync rounds folded since the loop started.
    pub rounds: u64,
}

/// Event channel output emitted by the session runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Lifecycle transition.
    StateChanged {
        state: SessionLifecycleState,
    },
    /// A diff was folded; this is the new canonical snapshot.
    SnapshotUpdated(Arc<Session>),
    SyncStatus(SyncStatus),
    /// A command or remote call failed.
    Error {
        /// Stable error code.
        code: String,
        /// Human-readable error message.
        message: String,
        /// Indicates whether retrying may recover.
        recoverable: bool,
    },
}
