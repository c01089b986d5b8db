use std::{collections::HashMap, sync::Arc};

use crate::event::Event;

type StateKey = (String, String);

/// Current room state: latest event per `(event type, state key)`.
///
/// Always equal to folding the room's state events in arrival order with the
/// most recent event winning, except where a server state delta replaced a
/// key. Keys a delta does not list are kept as they were.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateManager {
    entries: HashMap<StateKey, Arc<Event>>,
}

impl StateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Derive state from scratch by folding `events` in order.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a Arc<Event>>) -> Self {
        let mut state = Self::new();
        state.apply_events(events);
        state
    }

    pub fn get_state_event(&self, event_type: &str, state_key: &str) -> Option<&Arc<Event>> {
        self.entries
            .get(&(event_type.to_owned(), state_key.to_owned()))
    }

    /// Fold timeline events in order; non-state events are skipped.
    ///
    /// Returns how many keys were written.
    pub fn apply_events<'a>(&mut self, events: impl IntoIterator<Item = &'a Arc<Event>>) -> usize {
        let mut written = 0;
        for event in events {
            if let Some(key) = event.state_key_pair() {
                self.entries.insert(key, Arc::clone(event));
                written += 1;
            }
        }
        written
    }

    /// Fold events that predate everything already known.
    ///
    /// Only keys without a current value are written, and within `events` the
    /// later event still wins.
    pub fn fill_from_older(&mut self, events: &[Arc<Event>]) {
        for event in events.iter().rev() {
            if let Some(key) = event.state_key_pair() {
                self.entries.entry(key).or_insert_with(|| Arc::clone(event));
            }
        }
    }

    /// Fold events into keys unless `keep_current` vouches for the holder.
    ///
    /// Used when events land in the middle of known history: a holder that
    /// sits later in the timeline stays, anything older is overwritten.
    pub fn apply_events_where(
        &mut self,
        events: &[Arc<Event>],
        keep_current: impl Fn(&Arc<Event>) -> bool,
    ) {
        for event in events {
            let Some(key) = event.state_key_pair() else {
                continue;
            };
            match self.entries.get(&key) {
                Some(current) if keep_current(current) => {}
                _ => {
                    self.entries.insert(key, Arc::clone(event));
                }
            }
        }
    }

    /// Replace every key listed by a server state delta.
    ///
    /// The replacement set is resolved before anything is written so the delta
    /// lands as a whole; within the delta the last event for a key wins.
    pub fn replace_with_delta(&mut self, delta: &[Arc<Event>]) {
        let replacement: HashMap<StateKey, Arc<Event>> = delta
            .iter()
            .filter_map(|event| event.state_key_pair().map(|key| (key, Arc::clone(event))))
            .collect();
        self.entries.extend(replacement);
    }

    /// Swap in the redacted copy wherever the original currently holds a key.
    pub fn apply_redaction(&mut self, redacted: &Arc<Event>) {
        for current in self.entries.values_mut() {
            if current.event_id == redacted.event_id {
                *current = Arc::clone(redacted);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Event>> {
        self.entries.values()
    }
}
