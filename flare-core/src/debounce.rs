//! Coalescing of platform notifications: per event kind, only the last event of a burst is kept.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::platform::{EventKind, PlatformEvent};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(300);

/// The first event of a kind opens a window; events arriving before it closes replace the
/// held one without extending the window, so a steady stream of churn still makes progress.
pub struct Debouncer {
    window: Duration,
    slots: BTreeMap<EventKind, (PlatformEvent, Instant)>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            slots: BTreeMap::new(),
        }
    }

    pub fn offer(&mut self, event: PlatformEvent, now: Instant) {
        let deadline = now + self.window;
        match self.slots.get_mut(&event.kind()) {
            Some(slot) => slot.0 = event,
            None => {
                self.slots.insert(event.kind(), (event, deadline));
            }
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.slots.values().map(|(_, d)| *d).min()
    }

    /// Events whose window has closed, oldest deadline first.
    pub fn due(&mut self, now: Instant) -> Vec<PlatformEvent> {
        let ready: Vec<EventKind> = self
            .slots
            .iter()
            .filter(|(_, (_, d))| *d <= now)
            .map(|(k, _)| *k)
            .collect();
        let mut out: Vec<(Instant, PlatformEvent)> = ready
            .into_iter()
            .filter_map(|k| self.slots.remove(&k))
            .map(|(e, d)| (d, e))
            .collect();
        out.sort_by_key(|(d, _)| *d);
        out.into_iter().map(|(_, e)| e).collect()
    }

    /// Drop everything held; used on stop.
    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEFAULT_DEBOUNCE)
    }
}
