//! Homeserver payloads, reduced to the fields reconciliation reads.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    pub event_id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub sender: String,
    /// Absent inside sync room sections, present on single-event lookups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default)]
    pub content: Value,
    #[serde(default)]
    pub origin_server_ts: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unsigned: Option<Value>,
}

/// `{ "events": [...] }` wrapper used by several sync sections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventList<T> {
    #[serde(default = "Vec::new")]
    pub events: Vec<T>,
}

impl<T> Default for EventList<T> {
    fn default() -> Self {
        Self { events: Vec::new() }
    }
}

/// Account data or ephemeral event: a type and opaque content.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypedContent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub content: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TimelineSection {
    #[serde(default)]
    pub events: Vec<RawEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JoinedRoom {
    #[serde(default)]
    pub timeline: TimelineSection,
    /// State at the start of the timeline section.
    #[serde(default)]
    pub state: EventList<RawEvent>,
    #[serde(default)]
    pub account_data: EventList<TypedContent>,
    #[serde(default)]
    pub ephemeral: EventList<TypedContent>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Rooms {
    #[serde(default)]
    pub join: BTreeMap<String, JoinedRoom>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: Rooms,
    #[serde(default)]
    pub account_data: EventList<TypedContent>,
}

/// Backward pagination response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagesResponse {
    pub start: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    /// Newest first when paginating backwards.
    #[serde(default)]
    pub chunk: Vec<RawEvent>,
    #[serde(default)]
    pub state: Vec<RawEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoginResponse {
    pub access_token: String,
    pub user_id: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RefreshResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VersionsResponse {
    pub versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventIdResponse {
    pub event_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JoinResponse {
    pub room_id: String,
}

/// Structured error body returned by the homeserver.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerErrorBody {
    pub errcode: String,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_after_ms: Option<u64>,
}
