//! Named counters for cache behavior.
//!
//! Deliberately small: one monotonic counter per event name, cheap enough to
//! stay always-on, snapshot- and reset-able from tests.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

static CACHE_EVENTS: OnceLock<Mutex<HashMap<&'static str, u64>>> = OnceLock::new();

fn cache_events() -> &'static Mutex<HashMap<&'static str, u64>> {
    CACHE_EVENTS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Records one occurrence of a named cache event.
#[inline]
pub fn cache_event(name: &'static str) {
    let mut events = cache_events()
        .lock()
        .expect("cache event counters poisoned");
    let count = events.entry(name).or_insert(0);
    *count = count.saturating_add(1);
}

/// Returns the current count for one event name.
pub fn cache_event_count(name: &str) -> u64 {
    cache_events()
        .lock()
        .expect("cache event counters poisoned")
        .get(name)
        .copied()
        .unwrap_or(0)
}

/// Snapshots every counter recorded so far.
pub fn cache_event_counts() -> HashMap<&'static str, u64> {
    cache_events()
        .lock()
        .expect("cache event counters poisoned")
        .clone()
}

/// Clears all counters. Intended for tests asserting on event deltas.
pub fn reset_cache_events() {
    cache_events()
        .lock()
        .expect("cache event counters poisoned")
        .clear();
}
