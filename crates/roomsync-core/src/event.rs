use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event type of redaction events.
pub const REDACTION_EVENT_TYPE: &str = "m.room.redaction";

/// Whether an event was received with its room context.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventShape {
    /// Fetched out of room context (for example a single-event lookup).
    Blind,
    /// Received through a room timeline or state section.
    Full,
}

/// Immutable room event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub event_id: String,
    pub event_type: String,
    pub sender: String,
    pub room_id: String,
    /// Present on state events only.
    pub state_key: Option<String>,
    /// Opaque event content.
    pub content: Value,
    /// Milliseconds since Unix epoch, as reported by the origin server.
    pub origin_server_ts: u64,
    /// Id of the redaction event that removed this event's content.
    pub redacted_because: Option<String>,
    pub shape: EventShape,
}

impl Event {
    pub fn is_state(&self) -> bool {
        self.state_key.is_some()
    }

    pub fn is_redacted(&self) -> bool {
        self.redacted_because.is_some()
    }

    /// `(type, state_key)` pair for state events.
    pub fn state_key_pair(&self) -> Option<(String, String)> {
        self.state_key
            .as_ref()
            .map(|key| (self.event_type.clone(), key.clone()))
    }

    /// Target event id when this is a redaction.
    pub fn redacts(&self) -> Option<&str> {
        if self.event_type != REDACTION_EVENT_TYPE {
            return None;
        }
        self.content.get("redacts").and_then(Value::as_str)
    }

    /// Copy of this event with its content stripped.
    pub fn redacted_by(&self, redaction_id: &str) -> Self {
        Self {
            content: Value::Object(Default::default()),
            redacted_because: Some(redaction_id.to_owned()),
            ..self.clone()
        }
    }
}

/// Id-keyed event container. Inserting an existing id overwrites it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventStore {
    events: HashMap<String, Arc<Event>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `event`, replacing any event already stored under its id.
    pub fn insert(&mut self, event: Arc<Event>) {
        self.events.insert(event.event_id.clone(), event);
    }

    /// Value-style variant of [`EventStore::insert`].
    pub fn with_event(mut self, event: Arc<Event>) -> Self {
        self.insert(event);
        self
    }

    pub fn get(&self, event_id: &str) -> Option<&Arc<Event>> {
        self.events.get(event_id)
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.events.contains_key(event_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[cfg(test)]
pub(crate) fn test_event(event_id: &str, body: &str) -> Event {
    Event {
        event_id: event_id.to_owned(),
        event_type: "m.room.message".to_owned(),
        sender: "@alice:example.org".to_owned(),
        room_id: "!room:example.org".to_owned(),
        state_key: None,
        content: serde_json::json!({ "msgtype": "m.text", "body": body }),
        origin_server_ts: 1_731_000_000,
        redacted_because: None,
        shape: EventShape::Full,
    }
}

#[cfg(test)]
pub(crate) fn test_state_event(
    event_id: &str,
    event_type: &str,
    state_key: &str,
    value: &str,
) -> Event {
    Event {
        event_type: event_type.to_owned(),
        state_key: Some(state_key.to_owned()),
        content: serde_json::json!({ "value": value }),
        ..test_event(event_id, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overwrites_on_id_collision() {
        let store = EventStore::new()
            .with_event(Arc::new(test_event("$1", "first")))
            .with_event(Arc::new(test_event("$1", "second")));

        assert_eq!(store.len(), 1);
        let stored = store.get("$1").expect("event stored");
        assert_eq!(stored.content["body"], "second");
    }

    #[test]
    fn keeps_every_distinct_id() {
        let mut store = EventStore::new();
        for n in 0..25 {
            store.insert(Arc::new(test_event(&format!("${n}"), "x")));
        }

        assert_eq!(store.len(), 25);
        assert!((0..25).all(|n| store.contains(&format!("${n}"))));
        assert!(store.get("$missing").is_none());
    }

    #[test]
    fn reads_redaction_target_from_content() {
        let redaction = Event {
            event_type: REDACTION_EVENT_TYPE.to_owned(),
            content: serde_json::json!({ "redacts": "$target" }),
            ..test_event("$r", "")
        };
        assert_eq!(redaction.redacts(), Some("$target"));
        assert_eq!(test_event("$m", "hi").redacts(), None);
    }

    #[test]
    fn redacted_copy_drops_content_and_keeps_identity() {
        let original = test_event("$1", "secret");
        let redacted = original.redacted_by("$r");

        assert_eq!(redacted.event_id, "$1");
        assert_eq!(redacted.content, serde_json::json!({}));
        assert_eq!(redacted.redacted_because.as_deref(), Some("$r"));
        assert!(!original.is_redacted());
    }
}
