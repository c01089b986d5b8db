use std::sync::Arc;

use crate::{
    error::SessionError,
    event::{Event, EventShape},
    types::SessionEvent,
    wire::RawEvent,
};

/// Convert a wire event received inside a room section into a full event.
pub fn normalize_room_event(room_id: &str, raw: RawEvent) -> Arc<Event> {
    let redacted_because = redaction_marker(&raw);
    Arc::new(Event {
        event_id: raw.event_id,
        event_type: raw.event_type,
        sender: raw.sender,
        room_id: room_id.to_owned(),
        state_key: raw.state_key,
        content: raw.content,
        origin_server_ts: raw.origin_server_ts,
        redacted_because,
        shape: EventShape::Full,
    })
}

/// Convert a wire event fetched out of room context.
///
/// The room id is whatever the payload carried, possibly empty.
pub fn normalize_blind_event(raw: RawEvent) -> Event {
    let redacted_because = redaction_marker(&raw);
    Event {
        event_id: raw.event_id,
        event_type: raw.event_type,
        sender: raw.sender,
        room_id: raw.room_id.unwrap_or_default(),
        state_key: raw.state_key,
        content: raw.content,
        origin_server_ts: raw.origin_server_ts,
        redacted_because,
        shape: EventShape::Blind,
    }
}

/// Attach room context to a blind event.
pub fn contextualize(event: Event, room_id: &str) -> Arc<Event> {
    Arc::new(Event {
        room_id: room_id.to_owned(),
        shape: EventShape::Full,
        ..event
    })
}

/// Convert an error into an `Error` session event.
pub fn normalize_error(error: SessionError) -> SessionEvent {
    let recoverable = error.is_transient() || error.is_rate_limited();
    SessionEvent::Error {
        code: error.code,
        message: error.message,
        recoverable,
    }
}

fn redaction_marker(raw: &RawEvent) -> Option<String> {
    raw.unsigned
        .as_ref()?
        .get("redacted_because")?
        .get("event_id")?
        .as_str()
        .map(ToOwned::to_owned)
}
