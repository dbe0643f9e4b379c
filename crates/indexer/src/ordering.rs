//! Canonical event ordering.
//!
//! Sub-range fetches complete in any order; before anything is applied the
//! merged batch is sorted by `(block, tx, log)` and trimmed to what the
//! cursor has not yet covered.

use unisync_core::EventPosition;

use crate::listener::RawEvent;

/// Sort events by position and drop exact position duplicates.
///
/// Overlapping loads can deliver the same log twice; the first copy wins.
pub fn sort_canonical(events: &mut Vec<RawEvent>) {
    events.sort_by_key(RawEvent::position);
    events.dedup_by_key(|e| e.position());
}

/// Keep only events strictly after `cursor`.
pub fn filter_unprocessed(events: Vec<RawEvent>, cursor: Option<EventPosition>) -> Vec<RawEvent> {
    match cursor {
        None => events,
        Some(cursor) => events
            .into_iter()
            .filter(|e| e.position() > cursor)
            .collect(),
    }
}
