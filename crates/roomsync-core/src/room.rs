use std::{collections::BTreeMap, sync::Arc};

use serde_json::Value;
use tracing::debug;

use crate::{
    event::{Event, EventStore},
    normalization::normalize_room_event,
    timeline::{ChunkPlacement, Gap, Timeline, TimelineChunk, TimelineUpdate},
    wire::{JoinedRoom, TypedContent},
};

/// Local view of one room.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    room_id: String,
    account_data: BTreeMap<String, Value>,
    ephemeral: Vec<TypedContent>,
    store: EventStore,
    timeline: Timeline,
}

impl Room {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            account_data: BTreeMap::new(),
            ephemeral: Vec::new(),
            store: EventStore::new(),
            timeline: Timeline::new(),
        }
    }

    /// Seed a room from its first joined-room sync payload.
    ///
    /// The forward cursor starts at `next_batch`.
    pub fn from_joined(room_id: impl Into<String>, joined: JoinedRoom, next_batch: &str) -> Self {
        let mut room = Self::new(room_id);
        room.apply_joined(joined, None, next_batch);
        room
    }

    /// Merge a joined-room sync payload into an existing room.
    ///
    /// A missing `prev_batch` falls back to `default_prev_batch` so a limited
    /// update always anchors its gap.
    pub fn apply_joined(
        &mut self,
        joined: JoinedRoom,
        default_prev_batch: Option<&str>,
        next_batch: &str,
    ) {
        let room_id = self.room_id.clone();
        let state_delta = (!joined.state.events.is_empty()).then(|| {
            joined
                .state
                .events
                .into_iter()
                .map(|raw| normalize_room_event(&room_id, raw))
                .collect()
        });

        self.add_events(TimelineUpdate {
            events: joined
                .timeline
                .events
                .into_iter()
                .map(|raw| normalize_room_event(&room_id, raw))
                .collect(),
            limited: joined.timeline.limited,
            next_batch: Some(next_batch.to_owned()),
            prev_batch: joined
                .timeline
                .prev_batch
                .or_else(|| default_prev_batch.map(ToOwned::to_owned)),
            state_delta,
        });
        self.insert_account_data(
            joined
                .account_data
                .events
                .into_iter()
                .map(|data| (data.event_type, data.content)),
        );
        self.ephemeral = joined.ephemeral.events;
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Sync-path merge: append to the timeline, then record the events.
    pub fn add_events(&mut self, update: TimelineUpdate) {
        self.timeline.add_new_events(&update);
        self.record_events(&update.events, update.state_delta.as_deref());
        debug!(
            room_id = %self.room_id,
            appended = update.events.len(),
            limited = update.limited,
            "merged timeline update"
        );
    }

    /// Backfill-path merge.
    pub fn insert_events(&mut self, chunk: TimelineChunk) -> ChunkPlacement {
        let placement = self.timeline.insert_events(&chunk);
        self.record_events(&chunk.events, chunk.state_delta.as_deref());
        debug!(
            room_id = %self.room_id,
            inserted = chunk.events.len(),
            ?placement,
            "merged backfilled chunk"
        );
        placement
    }

    /// Right-biased union: incoming keys replace existing ones.
    pub fn insert_account_data(&mut self, data: impl IntoIterator<Item = (String, Value)>) {
        self.account_data.extend(data);
    }

    pub fn set_ephemeral(&mut self, events: Vec<TypedContent>) {
        self.ephemeral = events;
    }

    /// Forward-most contiguous events, newest first.
    pub fn most_recent_events(&self) -> Vec<&Arc<Event>> {
        self.timeline
            .most_recent_event_ids()
            .into_iter()
            .filter_map(|event_id| self.store.get(event_id))
            .collect()
    }

    pub fn latest_gap(&self) -> Option<&Gap> {
        self.timeline.latest_gap()
    }

    pub fn get_state_event(&self, event_type: &str, state_key: &str) -> Option<&Arc<Event>> {
        self.timeline.state().get_state_event(event_type, state_key)
    }

    pub fn account_data(&self) -> &BTreeMap<String, Value> {
        &self.account_data
    }

    pub fn ephemeral(&self) -> &[TypedContent] {
        &self.ephemeral
    }

    pub fn get_event_by_id(&self, event_id: &str) -> Option<&Arc<Event>> {
        self.store.get(event_id)
    }

    pub fn timeline(&self) -> &Timeline {
        &self.timeline
    }

    fn record_events(&mut self, events: &[Arc<Event>], state_delta: Option<&[Arc<Event>]>) {
        for event in state_delta.into_iter().flatten().chain(events) {
            self.store.insert(Arc::clone(event));
        }
        for event in events {
            if let Some(target) = event.redacts() {
                self.redact(target, &event.event_id);
            }
        }
    }

    fn redact(&mut self, target: &str, redaction_id: &str) {
        let Some(original) = self.store.get(target) else {
            return;
        };
        let redacted = Arc::new(original.redacted_by(redaction_id));
        self.timeline.state_mut().apply_redaction(&redacted);
        self.store.insert(redacted);
    }
}
