//! Deduplicating, monotonic follower over paged log event streams.
//!
//! Cloud log APIs page with overlap: asking for events after `t` re-delivers
//! events near `t`. The stitcher remembers recently seen event ids, drops the
//! duplicates, and advances a cursor the driver can pass back as the next
//! page's start-time filter so the overlap window shrinks over time.

use std::collections::HashMap;

/// How far behind the newest observed timestamp the cursor trails, so events
/// delivered slightly out of order are not skipped by the next page filter.
pub const DEFAULT_SAFETY_WINDOW_MS: i64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub event_id: String,
    pub timestamp: i64,
    pub message: String,
}

#[derive(Debug)]
pub struct LogStitcher {
    last_event_time: i64,
    safety_window: i64,
    // event id -> timestamp, pruned as the cursor advances
    seen: HashMap<String, i64>,
}

impl LogStitcher {
    pub fn new() -> Self {
        Self::with_safety_window(DEFAULT_SAFETY_WINDOW_MS)
    }

    pub fn with_safety_window(safety_window: i64) -> Self {
        Self { last_event_time: 0, safety_window, seen: HashMap::new() }
    }

    /// Start-time filter for the next page request.
    pub fn start_time(&self) -> i64 {
        self.last_event_time
    }

    /// Deduplicate one page of events, returning the fresh ones in timestamp
    /// order and advancing the cursor.
    pub fn ingest(&mut self, page: Vec<LogEvent>) -> Vec<LogEvent> {
        if page.is_empty() {
            return Vec::new();
        }

        let page_max = page.iter().map(|e| e.timestamp).max().unwrap_or(self.last_event_time);

        let mut fresh: Vec<LogEvent> = Vec::new();
        for event in page {
            if self.seen.contains_key(&event.event_id) {
                continue;
            }
            self.seen.insert(event.event_id.clone(), event.timestamp);
            fresh.push(event);
        }
        fresh.sort_by_key(|e| e.timestamp);

        // Cursor only moves forward.
        let candidate = page_max - self.safety_window;
        if candidate > self.last_event_time {
            self.last_event_time = candidate;
        }
        let cursor = self.last_event_time;
        self.seen.retain(|_, ts| *ts >= cursor);

        fresh
    }
}

impl Default for LogStitcher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(id: &str, timestamp: i64) -> LogEvent {
        LogEvent { event_id: id.to_owned(), timestamp, message: format!("msg {}", id) }
    }

    #[test]
    fn overlapping_pages_emit_each_event_once() {
        let mut stitcher = LogStitcher::with_safety_window(100);
        let out = stitcher.ingest(vec![event("a", 1_000), event("b", 1_050), event("c", 1_100)]);
        assert_eq!(out.len(), 3);

        // Overlap: b and c re-delivered alongside d.
        let out = stitcher.ingest(vec![event("b", 1_050), event("c", 1_100), event("d", 1_150)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].event_id, "d");
    }

    #[test]
    fn cursor_trails_page_max_by_safety_window() {
        let mut stitcher = LogStitcher::with_safety_window(100);
        stitcher.ingest(vec![event("a", 1_000), event("b", 2_000)]);
        assert_eq!(stitcher.start_time(), 1_900);
    }

    #[test]
    fn cursor_is_monotonic() {
        let mut stitcher = LogStitcher::with_safety_window(0);
        stitcher.ingest(vec![event("a", 2_000)]);
        assert_eq!(stitcher.start_time(), 2_000);
        // A page of only old events cannot move the cursor backwards.
        stitcher.ingest(vec![event("b", 500)]);
        assert_eq!(stitcher.start_time(), 2_000);
    }

    #[test]
    fn seen_set_is_pruned_behind_cursor() {
        let mut stitcher = LogStitcher::with_safety_window(0);
        stitcher.ingest(vec![event("a", 1_000)]);
        stitcher.ingest(vec![event("b", 5_000)]);
        assert!(!stitcher.seen.contains_key("a"), "entry behind cursor pruned");
        assert!(stitcher.seen.contains_key("b"));
    }

    #[test]
    fn fresh_events_sorted_by_timestamp() {
        let mut stitcher = LogStitcher::new();
        let out = stitcher.ingest(vec![event("late", 2_000), event("early", 1_000)]);
        assert_eq!(out[0].event_id, "early");
        assert_eq!(out[1].event_id, "late");
    }

    #[test]
    fn empty_page_is_a_noop() {
        let mut stitcher = LogStitcher::new();
        stitcher.ingest(vec![event("a", 1_000)]);
        let cursor = stitcher.start_time();
        assert!(stitcher.ingest(Vec::new()).is_empty());
        assert_eq!(stitcher.start_time(), cursor);
    }
}
