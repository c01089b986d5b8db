use std::{collections::HashMap, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{event::Event, state::StateManager};

/// History between two pagination tokens that is not known locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Gap {
    /// Token at the older edge of the missing range.
    pub prev_batch: String,
    /// Token at the newer edge; backward pagination starts here.
    pub next_batch: String,
}

/// One position in a room timeline, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineEntry {
    Event(String),
    Gap(Gap),
}

/// Newest segment reported by sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineUpdate {
    /// Events in chronological order.
    pub events: Vec<Arc<Event>>,
    /// Server could not guarantee continuity with the previous segment.
    pub limited: bool,
    /// New forward token; `None` keeps the current one.
    pub next_batch: Option<String>,
    /// Token at the start of `events`.
    pub prev_batch: Option<String>,
    /// Authoritative state at the start of `events`.
    pub state_delta: Option<Vec<Arc<Event>>>,
}

/// Older contiguous chunk obtained through backward pagination.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimelineChunk {
    /// Events in chronological order.
    pub events: Vec<Arc<Event>>,
    /// Token at the older edge; `None` once the start of the room is reached.
    pub prev_batch: Option<String>,
    /// Token at the newer edge.
    pub next_batch: Option<String>,
    pub state_delta: Option<Vec<Arc<Event>>>,
}

/// Where a backfilled chunk ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkPlacement {
    /// Both edges matched a gap, which is gone.
    ClosedGap,
    /// One edge matched a gap; the rest of the gap remains.
    NarrowedGap,
    /// No gap matched; the chunk went before the oldest known entry.
    Prepended,
}

/// Gap-aware ordered event log of one room.
///
/// Holds event ids only; the owning room keeps the events themselves. Within
/// a run without gaps entries are ordered by arrival.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Timeline {
    entries: Vec<TimelineEntry>,
    forward_cursor: Option<String>,
    backward_cursor: Option<String>,
    state: StateManager,
}

impl Timeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn forward_cursor(&self) -> Option<&str> {
        self.forward_cursor.as_deref()
    }

    pub fn backward_cursor(&self) -> Option<&str> {
        self.backward_cursor.as_deref()
    }

    pub fn state(&self) -> &StateManager {
        &self.state
    }

    pub fn entries(&self) -> &[TimelineEntry] {
        &self.entries
    }

    /// Nothing has been merged yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.forward_cursor.is_none()
    }

    /// Append the newest segment and advance the forward cursor.
    pub fn add_new_events(&mut self, update: &TimelineUpdate) {
        if let Some(delta) = &update.state_delta {
            self.state.replace_with_delta(delta);
        }

        if self.is_empty() {
            self.backward_cursor = update.prev_batch.clone();
        } else if update.limited
            && let Some(older) = self.forward_cursor.clone()
        {
            let newer = update.prev_batch.clone().unwrap_or_else(|| older.clone());
            self.entries.push(TimelineEntry::Gap(Gap {
                prev_batch: older,
                next_batch: newer,
            }));
        }

        for event in &update.events {
            self.forget_event(&event.event_id);
            self.entries
                .push(TimelineEntry::Event(event.event_id.clone()));
        }
        self.state.apply_events(&update.events);

        if let Some(next_batch) = &update.next_batch {
            self.forward_cursor = Some(next_batch.clone());
        }
    }

    /// Anchor an older chunk between its tokens.
    ///
    /// A chunk placed before all known history only fills keys that have no
    /// value yet. A chunk spliced into a gap overrides keys whose holder sits
    /// on the older side of it.
    pub fn insert_events(&mut self, chunk: &TimelineChunk) -> ChunkPlacement {
        let placement = self.splice_chunk(chunk);
        match placement {
            ChunkPlacement::Prepended => self.state.fill_from_older(&chunk.events),
            ChunkPlacement::ClosedGap | ChunkPlacement::NarrowedGap => {
                let positions: HashMap<&str, usize> = self
                    .entries
                    .iter()
                    .enumerate()
                    .filter_map(|(index, entry)| match entry {
                        TimelineEntry::Event(event_id) => Some((event_id.as_str(), index)),
                        TimelineEntry::Gap(_) => None,
                    })
                    .collect();
                let chunk_end = chunk
                    .events
                    .iter()
                    .filter_map(|event| positions.get(event.event_id.as_str()).copied())
                    .max();
                // Holders outside the timeline came from a sync delta and are newer.
                self.state.apply_events_where(&chunk.events, |current| {
                    match (positions.get(current.event_id.as_str()), chunk_end) {
                        (Some(&position), Some(end)) => position > end,
                        _ => true,
                    }
                });
            }
        }
        if let Some(delta) = &chunk.state_delta {
            self.state.fill_from_older(delta);
        }
        placement
    }

    fn splice_chunk(&mut self, chunk: &TimelineChunk) -> ChunkPlacement {
        for event in &chunk.events {
            self.forget_event(&event.event_id);
        }
        let chunk_entries = chunk
            .events
            .iter()
            .map(|event| TimelineEntry::Event(event.event_id.clone()));

        let newer_edge = self.gap_position(|gap| chunk.next_batch.as_ref() == Some(&gap.next_batch));
        if let Some(index) = newer_edge {
            let gap = self.gap_at(index);
            let mut replacement = Vec::new();
            let closed = match &chunk.prev_batch {
                Some(prev_batch) if *prev_batch != gap.prev_batch => {
                    replacement.push(TimelineEntry::Gap(Gap {
                        prev_batch: gap.prev_batch,
                        next_batch: prev_batch.clone(),
                    }));
                    false
                }
                _ => true,
            };
            replacement.extend(chunk_entries);
            self.entries.splice(index..=index, replacement);
            return if closed {
                ChunkPlacement::ClosedGap
            } else {
                ChunkPlacement::NarrowedGap
            };
        }

        let older_edge = self.gap_position(|gap| chunk.prev_batch.as_ref() == Some(&gap.prev_batch));
        if let Some(index) = older_edge {
            let gap = self.gap_at(index);
            let mut replacement: Vec<TimelineEntry> = chunk_entries.collect();
            let closed = match &chunk.next_batch {
                Some(next_batch) if *next_batch == gap.next_batch => true,
                Some(next_batch) => {
                    replacement.push(TimelineEntry::Gap(Gap {
                        prev_batch: next_batch.clone(),
                        next_batch: gap.next_batch,
                    }));
                    false
                }
                // Unknown newer edge: nothing shows the chunk reaches the far side.
                None => {
                    replacement.push(TimelineEntry::Gap(gap));
                    false
                }
            };
            self.entries.splice(index..=index, replacement);
            return if closed {
                ChunkPlacement::ClosedGap
            } else {
                ChunkPlacement::NarrowedGap
            };
        }

        let mut prefix: Vec<TimelineEntry> = chunk_entries.collect();
        if !self.entries.is_empty()
            && let (Some(chunk_next), Some(backward)) = (&chunk.next_batch, &self.backward_cursor)
            && chunk_next != backward
        {
            prefix.push(TimelineEntry::Gap(Gap {
                prev_batch: chunk_next.clone(),
                next_batch: backward.clone(),
            }));
        }
        self.entries.splice(0..0, prefix);
        self.backward_cursor = chunk.prev_batch.clone();
        if self.forward_cursor.is_none() {
            self.forward_cursor = chunk.next_batch.clone();
        }
        ChunkPlacement::Prepended
    }

    /// Ids of the forward-most contiguous segment, newest first.
    pub fn most_recent_event_ids(&self) -> Vec<&str> {
        self.entries
            .iter()
            .rev()
            .map_while(|entry| match entry {
                TimelineEntry::Event(event_id) => Some(event_id.as_str()),
                TimelineEntry::Gap(_) => None,
            })
            .collect()
    }

    /// Gap nearest the forward edge.
    pub fn latest_gap(&self) -> Option<&Gap> {
        self.gaps().next_back()
    }

    /// All gaps, oldest first.
    pub fn gaps(&self) -> impl DoubleEndedIterator<Item = &Gap> {
        self.entries.iter().filter_map(|entry| match entry {
            TimelineEntry::Gap(gap) => Some(gap),
            TimelineEntry::Event(_) => None,
        })
    }

    /// Clamp a requested pagination limit against safety and server caps.
    ///
    /// The result is always in `1..=100`.
    pub fn bounded_paginate_limit(requested: u16, server_cap: u16) -> u16 {
        let safe_requested = requested.max(1);
        let safe_cap = server_cap.max(1);
        safe_requested.min(safe_cap).min(100)
    }

    pub(crate) fn state_mut(&mut self) -> &mut StateManager {
        &mut self.state
    }

    fn forget_event(&mut self, event_id: &str) {
        self.entries
            .retain(|entry| !matches!(entry, TimelineEntry::Event(id) if id == event_id));
    }

    fn gap_position(&self, matches: impl Fn(&Gap) -> bool) -> Option<usize> {
        self.entries.iter().rposition(|entry| match entry {
            TimelineEntry::Gap(gap) => matches(gap),
            TimelineEntry::Event(_) => false,
        })
    }

    fn gap_at(&self, index: usize) -> Gap {
        match &self.entries[index] {
            TimelineEntry::Gap(gap) => gap.clone(),
            TimelineEntry::Event(_) => unreachable!("gap_position only yields gap indices"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{test_event, test_state_event};

    fn ev(event_id: &str) -> Arc<Event> {
        Arc::new(test_event(event_id, event_id))
    }

    fn update(events: &[&str], limited: bool, prev: Option<&str>, next: &str) -> TimelineUpdate {
        TimelineUpdate {
            events: events.iter().map(|id| ev(id)).collect(),
            limited,
            next_batch: Some(next.to_owned()),
            prev_batch: prev.map(ToOwned::to_owned),
            state_delta: None,
        }
    }

    fn chunk(events: &[&str], prev: Option<&str>, next: &str) -> TimelineChunk {
        TimelineChunk {
            events: events.iter().map(|id| ev(id)).collect(),
            prev_batch: prev.map(ToOwned::to_owned),
            next_batch: Some(next.to_owned()),
            state_delta: None,
        }
    }

    #[test]
    fn first_append_is_contiguous_and_newest_first() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1", "$e2"], false, Some("p0"), "n1"));

        assert_eq!(timeline.most_recent_event_ids(), vec!["$e2", "$e1"]);
        assert_eq!(timeline.latest_gap(), None);
        assert_eq!(timeline.forward_cursor(), Some("n1"));
        assert_eq!(timeline.backward_cursor(), Some("p0"));
    }

    #[test]
    fn limited_append_introduces_gap_even_after_contiguous_edge() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1", "$e2"], false, Some("p0"), "n1"));
        timeline.add_new_events(&update(&["$e3"], true, None, "n2"));

        assert_eq!(
            timeline.latest_gap(),
            Some(&Gap {
                prev_batch: "n1".into(),
                next_batch: "n1".into(),
            })
        );
        assert_eq!(timeline.most_recent_event_ids(), vec!["$e3"]);
        assert_eq!(timeline.forward_cursor(), Some("n2"));
    }

    #[test]
    fn limited_first_append_has_no_gap() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1"], true, Some("p0"), "n1"));

        assert_eq!(timeline.latest_gap(), None);
        assert_eq!(timeline.backward_cursor(), Some("p0"));
    }

    #[test]
    fn empty_append_still_advances_cursor() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1"], false, Some("p0"), "n1"));
        timeline.add_new_events(&update(&[], false, None, "n2"));

        assert_eq!(timeline.forward_cursor(), Some("n2"));
        assert_eq!(timeline.most_recent_event_ids(), vec!["$e1"]);
    }

    #[test]
    fn reappended_event_moves_to_new_position() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1", "$e2"], false, Some("p0"), "n1"));
        timeline.add_new_events(&update(&["$e1"], false, None, "n2"));

        assert_eq!(timeline.most_recent_event_ids(), vec!["$e1", "$e2"]);
    }

    #[test]
    fn backfill_matching_both_edges_closes_gap() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1"], false, Some("p0"), "n1"));
        timeline.add_new_events(&update(&["$e4"], true, Some("p3"), "n2"));

        let placement = timeline.insert_events(&chunk(&["$e2", "$e3"], Some("n1"), "p3"));

        assert_eq!(placement, ChunkPlacement::ClosedGap);
        assert_eq!(timeline.latest_gap(), None);
        assert_eq!(
            timeline.most_recent_event_ids(),
            vec!["$e4", "$e3", "$e2", "$e1"]
        );
    }

    #[test]
    fn backfill_matching_newer_edge_narrows_gap() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1"], false, Some("p0"), "n1"));
        timeline.add_new_events(&update(&["$e4"], true, Some("p3"), "n2"));

        let placement = timeline.insert_events(&chunk(&["$e3"], Some("p2"), "p3"));

        assert_eq!(placement, ChunkPlacement::NarrowedGap);
        assert_eq!(
            timeline.latest_gap(),
            Some(&Gap {
                prev_batch: "n1".into(),
                next_batch: "p2".into(),
            })
        );
        assert_eq!(timeline.most_recent_event_ids(), vec!["$e4", "$e3"]);
    }

    #[test]
    fn backfill_matching_older_edge_narrows_gap_from_below() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1"], false, Some("p0"), "n1"));
        timeline.add_new_events(&update(&["$e4"], true, Some("p3"), "n2"));

        let placement = timeline.insert_events(&chunk(&["$e2"], Some("n1"), "m2"));

        assert_eq!(placement, ChunkPlacement::NarrowedGap);
        assert_eq!(
            timeline.latest_gap(),
            Some(&Gap {
                prev_batch: "m2".into(),
                next_batch: "p3".into(),
            })
        );
    }

    #[test]
    fn backfill_at_backward_edge_prepends_and_moves_cursor() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e2"], false, Some("p1"), "n1"));

        let placement = timeline.insert_events(&chunk(&["$e1"], Some("p0"), "p1"));

        assert_eq!(placement, ChunkPlacement::Prepended);
        assert_eq!(timeline.backward_cursor(), Some("p0"));
        assert_eq!(timeline.latest_gap(), None);
        assert_eq!(timeline.most_recent_event_ids(), vec!["$e2", "$e1"]);
    }

    #[test]
    fn unanchored_backfill_keeps_gap_to_known_history() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e9"], false, Some("p5"), "n1"));

        timeline.insert_events(&chunk(&["$e1"], Some("p0"), "p1"));

        assert_eq!(
            timeline.latest_gap(),
            Some(&Gap {
                prev_batch: "p1".into(),
                next_batch: "p5".into(),
            })
        );
        assert_eq!(timeline.most_recent_event_ids(), vec!["$e9"]);
    }

    #[test]
    fn state_events_in_appends_update_state() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&TimelineUpdate {
            events: vec![
                Arc::new(test_state_event("$1", "m.room.name", "", "one")),
                Arc::new(test_state_event("$2", "m.room.name", "", "two")),
            ],
            next_batch: Some("n1".into()),
            ..Default::default()
        });

        let name = timeline
            .state()
            .get_state_event("m.room.name", "")
            .expect("name present");
        assert_eq!(name.event_id, "$2");
    }

    #[test]
    fn backfilled_state_does_not_override_newer_state() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&TimelineUpdate {
            events: vec![Arc::new(test_state_event("$new", "m.room.name", "", "new"))],
            prev_batch: Some("p1".into()),
            next_batch: Some("n1".into()),
            ..Default::default()
        });

        timeline.insert_events(&TimelineChunk {
            events: vec![
                Arc::new(test_state_event("$old", "m.room.name", "", "old")),
                Arc::new(test_state_event("$topic", "m.room.topic", "", "t")),
            ],
            prev_batch: Some("p0".into()),
            next_batch: Some("p1".into()),
            state_delta: None,
        });

        let state = timeline.state();
        assert_eq!(
            state.get_state_event("m.room.name", "").map(|e| e.event_id.as_str()),
            Some("$new")
        );
        assert_eq!(
            state.get_state_event("m.room.topic", "").map(|e| e.event_id.as_str()),
            Some("$topic")
        );
    }

    #[test]
    fn state_backfilled_into_a_gap_overrides_older_holders() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&TimelineUpdate {
            events: vec![Arc::new(test_state_event("$a", "m.room.topic", "", "a"))],
            prev_batch: Some("p0".into()),
            next_batch: Some("n1".into()),
            ..Default::default()
        });
        timeline.add_new_events(&update(&["$m"], true, Some("p2"), "n2"));

        let placement = timeline.insert_events(&TimelineChunk {
            events: vec![Arc::new(test_state_event("$b", "m.room.topic", "", "b"))],
            prev_batch: Some("n1".into()),
            next_batch: Some("p2".into()),
            state_delta: None,
        });

        assert_eq!(placement, ChunkPlacement::ClosedGap);
        assert_eq!(timeline.most_recent_event_ids(), vec!["$m", "$b", "$a"]);
        assert_eq!(
            timeline
                .state()
                .get_state_event("m.room.topic", "")
                .map(|e| e.event_id.as_str()),
            Some("$b")
        );
    }

    #[test]
    fn state_backfilled_into_a_gap_keeps_newer_holders() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1"], false, Some("p0"), "n1"));
        timeline.add_new_events(&TimelineUpdate {
            events: vec![Arc::new(test_state_event("$new", "m.room.topic", "", "new"))],
            limited: true,
            prev_batch: Some("p3".into()),
            next_batch: Some("n2".into()),
            ..Default::default()
        });

        let placement = timeline.insert_events(&TimelineChunk {
            events: vec![Arc::new(test_state_event("$mid", "m.room.topic", "", "mid"))],
            prev_batch: Some("p2".into()),
            next_batch: Some("p3".into()),
            state_delta: None,
        });

        assert_eq!(placement, ChunkPlacement::NarrowedGap);
        assert_eq!(
            timeline
                .state()
                .get_state_event("m.room.topic", "")
                .map(|e| e.event_id.as_str()),
            Some("$new")
        );
    }

    #[test]
    fn older_edge_match_without_newer_token_keeps_gap() {
        let mut timeline = Timeline::new();
        timeline.add_new_events(&update(&["$e1"], false, Some("p0"), "n1"));
        timeline.add_new_events(&update(&["$e4"], true, Some("p3"), "n2"));

        let placement = timeline.insert_events(&TimelineChunk {
            events: vec![ev("$e2")],
            prev_batch: Some("n1".into()),
            next_batch: None,
            state_delta: None,
        });

        assert_eq!(placement, ChunkPlacement::NarrowedGap);
        assert_eq!(
            timeline.latest_gap(),
            Some(&Gap {
                prev_batch: "n1".into(),
                next_batch: "p3".into(),
            })
        );
        assert_eq!(timeline.most_recent_event_ids(), vec!["$e4"]);
    }

    #[test]
    fn bounds_paginate_limit_for_safety() {
        assert_eq!(Timeline::bounded_paginate_limit(0, 200), 1);
        assert_eq!(Timeline::bounded_paginate_limit(25, 10), 10);
        assert_eq!(Timeline::bounded_paginate_limit(150, 500), 100);
    }
}
