//! Message store interface and an in-memory implementation.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::message::{MessageEnvelope, MessageStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub envelope: MessageEnvelope,
    pub status: MessageStatus,
}

/// Persistence collaborator. Calls are short and synchronous; implementations must be
/// safe to call from any task.
pub trait MessageStore: Send + Sync {
    fn insert(&self, envelope: &MessageEnvelope, status: MessageStatus) -> Result<(), StoreError>;

    fn update_status(&self, message_id: &str, status: MessageStatus) -> Result<(), StoreError>;

    fn get(&self, message_id: &str) -> Result<Option<StoredMessage>, StoreError>;

    /// Locally originated messages that never left the device (pending or failed).
    fn undelivered(&self) -> Result<Vec<MessageEnvelope>, StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown message {0}")]
    UnknownMessage(String),
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("store encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("store lock poisoned")]
    Poisoned,
}

/// Process-lifetime store, used by tests and as a fallback when no data directory is usable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: Mutex<HashMap<String, StoredMessage>>,
    order: Mutex<Vec<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MessageStore for MemoryStore {
    fn insert(&self, envelope: &MessageEnvelope, status: MessageStatus) -> Result<(), StoreError> {
        let mut messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        if messages
            .insert(
                envelope.message_id.clone(),
                StoredMessage {
                    envelope: envelope.clone(),
                    status,
                },
            )
            .is_none()
        {
            self.order
                .lock()
                .map_err(|_| StoreError::Poisoned)?
                .push(envelope.message_id.clone());
        }
        Ok(())
    }

    fn update_status(&self, message_id: &str, status: MessageStatus) -> Result<(), StoreError> {
        let mut messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        match messages.get_mut(message_id) {
            Some(m) => {
                m.status = status;
                Ok(())
            }
            None => Err(StoreError::UnknownMessage(message_id.to_string())),
        }
    }

    fn get(&self, message_id: &str) -> Result<Option<StoredMessage>, StoreError> {
        let messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(messages.get(message_id).cloned())
    }

    fn undelivered(&self) -> Result<Vec<MessageEnvelope>, StoreError> {
        let messages = self.messages.lock().map_err(|_| StoreError::Poisoned)?;
        let order = self.order.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(order
            .iter()
            .filter_map(|id| messages.get(id))
            .filter(|m| matches!(m.status, MessageStatus::Pending | MessageStatus::Failed))
            .map(|m| m.envelope.clone())
            .collect())
    }
}
