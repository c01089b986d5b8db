//! Client-side session reconciliation for a Matrix-style chat protocol.
//!
//! A [`Session`] is an immutable snapshot of rooms, timelines and state.
//! Remote calls in [`api`] yield [`UpdateDiff`] values; folding a diff with
//! [`Session::apply_update`] produces the next snapshot. Retry combinators and
//! the protocol version resolver wrap those calls.

/// Remote calls producing update diffs.
pub mod api;
/// Update diff variants folded into a session.
pub mod diff;
/// Stable error types and HTTP classification helpers.
pub mod error;
/// Events and the id-keyed event store.
pub mod event;
/// Wire-to-domain conversion helpers.
pub mod normalization;
/// Bounded and rate-limit-aware retry combinators.
pub mod retry;
pub mod room;
pub mod session;
/// Derived room state.
pub mod state;
/// Runtime lifecycle state machine.
pub mod state_machine;
/// Gap-aware room timeline.
pub mod timeline;
/// Request/response boundary towards the homeserver.
pub mod transport;
/// Runtime-facing protocol types (commands, events, tuning).
pub mod types;
/// Protocol version negotiation tables.
pub mod version;
pub mod wire;

pub use diff::UpdateDiff;
pub use error::{SessionError, SessionErrorCategory, classify_http_status};
pub use event::{Event, EventShape, EventStore};
pub use normalization::normalize_error;
pub use retry::{
    RateLimitPolicy, RetryPolicy, ratelimited, ratelimited_with, retry_task, retry_task_with,
};
pub use room::Room;
pub use session::{Auth, Session, SessionContext};
pub use state::StateManager;
pub use state_machine::SessionStateMachine;
pub use timeline::{ChunkPlacement, Gap, Timeline, TimelineChunk, TimelineEntry, TimelineUpdate};
pub use transport::{ApiRequest, ApiResponse, Method, Transport, decode_response};
pub use types::{
    Membership, RuntimeConfig, SessionCommand, SessionEvent, SessionLifecycleState, SyncStatus,
};
pub use version::{ApiRevision, Endpoint, VersionTable};
