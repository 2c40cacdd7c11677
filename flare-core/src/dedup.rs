//! Duplicate suppression: (sender, content hash) seen within a time window, plus recent message ids.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::identity::DeviceId;
use crate::message::MessageEnvelope;

/// Window during which the same sender/content pair is suppressed.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_secs(5);

/// Message ids remembered regardless of the window.
pub const RECENT_ID_CAPACITY: usize = 1024;

pub struct DedupCache {
    window: Duration,
    seen: HashMap<(DeviceId, [u8; 32]), Instant>,
    recent_ids: HashSet<String>,
    recent_order: VecDeque<String>,
}

impl DedupCache {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
            recent_ids: HashSet::new(),
            recent_order: VecDeque::new(),
        }
    }

    /// Record the envelope and return true if it is new. Returns false for a repeat of the
    /// same message id, or of the same sender/content inside the window.
    pub fn check_and_record(&mut self, env: &MessageEnvelope, now: Instant) -> bool {
        self.prune(now);
        if self.recent_ids.contains(&env.message_id) {
            return false;
        }
        let key = (env.sender_id.clone(), env.content_hash());
        if let Some(&at) = self.seen.get(&key) {
            if now.saturating_duration_since(at) < self.window {
                return false;
            }
        }
        self.seen.insert(key, now);
        self.remember_id(&env.message_id);
        true
    }

    /// Mark our own outbound message so echoes from the mesh are not delivered back to us.
    pub fn record_outbound(&mut self, env: &MessageEnvelope, now: Instant) {
        self.seen
            .insert((env.sender_id.clone(), env.content_hash()), now);
        self.remember_id(&env.message_id);
    }

    /// Drop window entries older than the window.
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, at| now.saturating_duration_since(*at) < window);
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    fn remember_id(&mut self, id: &str) {
        if !self.recent_ids.insert(id.to_string()) {
            return;
        }
        self.recent_order.push_back(id.to_string());
        while self.recent_order.len() > RECENT_ID_CAPACITY {
            if let Some(old) = self.recent_order.pop_front() {
                self.recent_ids.remove(&old);
            }
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use crate::protocol::MessageType;

    fn env(text: &str) -> MessageEnvelope {
        let local = LocalIdentity::new("ana", "pixel").with_hardware_id("aa:aa:aa:aa:aa:01");
        MessageEnvelope::outbound(&local, None, MessageType::Text, text, 3)
    }

    #[test]
    fn same_content_within_window_is_dropped() {
        let mut cache = DedupCache::default();
        let t0 = Instant::now();
        assert!(cache.check_and_record(&env("water at the school"), t0));
        // Different message id, same sender and content.
        assert!(!cache.check_and_record(
            &env("water at the school"),
            t0 + Duration::from_secs(4)
        ));
    }

    #[test]
    fn same_content_after_window_is_delivered() {
        let mut cache = DedupCache::default();
        let t0 = Instant::now();
        assert!(cache.check_and_record(&env("ok"), t0));
        assert!(cache.check_and_record(&env("ok"), t0 + Duration::from_secs(6)));
    }

    #[test]
    fn repeated_message_id_is_dropped_after_window() {
        let mut cache = DedupCache::default();
        let t0 = Instant::now();
        let e = env("relay");
        assert!(cache.check_and_record(&e, t0));
        assert!(!cache.check_and_record(&e, t0 + Duration::from_secs(60)));
    }

    #[test]
    fn prune_removes_expired_entries() {
        let mut cache = DedupCache::default();
        let t0 = Instant::now();
        cache.check_and_record(&env("a"), t0);
        cache.check_and_record(&env("b"), t0);
        assert_eq!(cache.len(), 2);
        cache.prune(t0 + Duration::from_secs(5));
        assert!(cache.is_empty());
    }

    #[test]
    fn own_outbound_echo_is_dropped() {
        let mut cache = DedupCache::default();
        let t0 = Instant::now();
        let e = env("sos");
        cache.record_outbound(&e, t0);
        assert!(!cache.check_and_record(&e, t0 + Duration::from_millis(10)));
    }
}
