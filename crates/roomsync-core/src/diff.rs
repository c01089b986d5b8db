use crate::{
    event::Event,
    timeline::TimelineChunk,
    types::Membership,
    wire::SyncResponse,
};

/// Result of one remote call, ready to be folded into a [`Session`].
///
/// Produced by a call, consumed by one fold, then dropped.
///
/// [`Session`]: crate::session::Session
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateDiff {
    /// Fold every sub-diff left to right.
    Batch(Vec<UpdateDiff>),
    SyncUpdate {
        /// Cursor the request was made with; anchors gaps without `prev_batch`.
        since: Option<String>,
        response: SyncResponse,
    },
    GetEventResult {
        room_id: String,
        /// Blind event as fetched.
        event: Event,
    },
    BackfillResult {
        room_id: String,
        chunk: TimelineChunk,
    },
    LoginResult {
        access_token: String,
        user_id: String,
        device_id: Option<String>,
        refresh_token: Option<String>,
    },
    TokenUpdate {
        access_token: String,
        refresh_token: Option<String>,
    },
    VersionsUpdate {
        versions: Vec<String>,
    },
    InviteAck {
        room_id: String,
        user_id: String,
    },
    MembershipAck {
        room_id: String,
        membership: Membership,
    },
    MessageSent {
        room_id: String,
        event_id: String,
        txn_id: String,
    },
    RedactionAck {
        room_id: String,
        event_id: String,
    },
    StateChangeAck {
        room_id: String,
        event_id: String,
    },
}

impl UpdateDiff {
    /// Stable name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Batch(_) => "batch",
            Self::SyncUpdate { .. } => "sync_update",
            Self::GetEventResult { .. } => "get_event_result",
            Self::BackfillResult { .. } => "backfill_result",
            Self::LoginResult { .. } => "login_result",
            Self::TokenUpdate { .. } => "token_update",
            Self::VersionsUpdate { .. } => "versions_update",
            Self::InviteAck { .. } => "invite_ack",
            Self::MembershipAck { .. } => "membership_ack",
            Self::MessageSent { .. } => "message_sent",
            Self::RedactionAck { .. } => "redaction_ack",
            Self::StateChangeAck { .. } => "state_change_ack",
        }
    }
}
