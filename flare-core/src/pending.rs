//! Pending queue: locally originated messages whose send failed, retried opportunistically.

use std::collections::VecDeque;

use crate::message::{MessageEnvelope, PendingMessage};

/// Entries kept before the oldest is evicted.
pub const DEFAULT_PENDING_CAPACITY: usize = 512;

#[derive(Debug)]
pub struct PendingQueue {
    entries: VecDeque<PendingMessage>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Queue a failed message. A message already queued keeps its place and gets its retry
    /// count bumped. Returns the evicted entry when the queue was full.
    pub fn push(&mut self, payload: MessageEnvelope, now: u64) -> Option<PendingMessage> {
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|p| p.payload.message_id == payload.message_id)
        {
            existing.retry_count = existing.retry_count.saturating_add(1);
            return None;
        }
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front()
        } else {
            None
        };
        self.entries.push_back(PendingMessage {
            payload,
            enqueued_at: now,
            retry_count: 0,
        });
        evicted
    }

    /// Take every entry for one flush pass. Failed entries go back via `requeue`.
    pub fn take_all(&mut self) -> Vec<PendingMessage> {
        self.entries.drain(..).collect()
    }

    /// Put back an entry whose retry failed, ahead of anything queued since the flush began.
    pub fn requeue(&mut self, mut entry: PendingMessage) {
        if self
            .entries
            .iter()
            .any(|p| p.payload.message_id == entry.payload.message_id)
        {
            return;
        }
        entry.retry_count = entry.retry_count.saturating_add(1);
        self.entries.push_front(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    pub fn remove(&mut self, message_id: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|p| p.payload.message_id != message_id);
        self.entries.len() != before
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.entries
            .iter()
            .any(|p| p.payload.message_id == message_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PendingQueue {
    fn default() -> Self {
        Self::new(DEFAULT_PENDING_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;
    use crate::protocol::MessageType;

    fn env(text: &str) -> MessageEnvelope {
        let local = LocalIdentity::new("ana", "pixel");
        MessageEnvelope::outbound(&local, None, MessageType::Text, text, 3)
    }

    #[test]
    fn push_same_message_bumps_retry() {
        let mut q = PendingQueue::default();
        let e = env("a");
        q.push(e.clone(), 1);
        q.push(e.clone(), 2);
        assert_eq!(q.len(), 1);
        let entries = q.take_all();
        assert_eq!(entries[0].retry_count, 1);
        assert_eq!(entries[0].enqueued_at, 1);
    }

    #[test]
    fn full_queue_evicts_oldest() {
        let mut q = PendingQueue::new(2);
        let first = env("1");
        q.push(first.clone(), 1);
        q.push(env("2"), 2);
        let evicted = q.push(env("3"), 3).unwrap();
        assert_eq!(evicted.payload.message_id, first.message_id);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn take_then_requeue_failed() {
        let mut q = PendingQueue::default();
        q.push(env("a"), 1);
        q.push(env("b"), 1);
        let mut taken = q.take_all();
        assert!(q.is_empty());
        let failed = taken.pop().unwrap();
        let id = failed.payload.message_id.clone();
        q.requeue(failed);
        assert!(q.contains(&id));
        assert_eq!(q.len(), 1);
        assert!(q.remove(&id));
        assert!(q.is_empty());
    }
}
