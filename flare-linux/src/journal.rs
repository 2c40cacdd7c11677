//! Append-only JSON-lines message journal. The file is replayed on open, so the last
//! recorded status of each message survives a restart. Open also compacts: the file is
//! rewritten with one record per retained message.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use flare_core::{MessageEnvelope, MessageStatus, MessageStore, StoreError, StoredMessage};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const JOURNAL_FILE: &str = "messages.jsonl";

/// Delivered and received messages kept across restarts. Undelivered ones are always kept.
pub const DEFAULT_RETAINED: usize = 10_000;

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Record {
    Insert {
        message: MessageEnvelope,
        status: MessageStatus,
    },
    Status {
        message_id: String,
        status: MessageStatus,
    },
}

fn is_undelivered(status: MessageStatus) -> bool {
    matches!(status, MessageStatus::Pending | MessageStatus::Failed)
}

#[derive(Default)]
struct Index {
    messages: HashMap<String, StoredMessage>,
    order: Vec<String>,
}

impl Index {
    fn apply(&mut self, record: Record) {
        match record {
            Record::Insert { message, status } => {
                let id = message.message_id.clone();
                if self
                    .messages
                    .insert(
                        id.clone(),
                        StoredMessage {
                            envelope: message,
                            status,
                        },
                    )
                    .is_none()
                {
                    self.order.push(id);
                }
            }
            Record::Status { message_id, status } => {
                if let Some(m) = self.messages.get_mut(&message_id) {
                    m.status = status;
                }
            }
        }
    }

    /// Drop the oldest delivered messages until at most `retain` of them remain.
    fn trim(&mut self, retain: usize) -> usize {
        let delivered = self
            .order
            .iter()
            .filter(|id| {
                self.messages
                    .get(*id)
                    .map(|m| !is_undelivered(m.status))
                    .unwrap_or(false)
            })
            .count();
        let mut excess = delivered.saturating_sub(retain);
        if excess == 0 {
            return 0;
        }
        let dropped = excess;
        let messages = &mut self.messages;
        self.order.retain(|id| {
            if excess == 0 {
                return true;
            }
            match messages.get(id) {
                Some(m) if !is_undelivered(m.status) => {
                    messages.remove(id);
                    excess -= 1;
                    false
                }
                _ => true,
            }
        });
        dropped
    }

    /// Rewrite `path` as one insert record per message, via a temporary file and rename.
    fn write_compacted(&self, path: &Path) -> Result<(), StoreError> {
        let tmp = path.with_extension("jsonl.tmp");
        {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for m in self.order.iter().filter_map(|id| self.messages.get(id)) {
                let record = Record::Insert {
                    message: m.envelope.clone(),
                    status: m.status,
                };
                serde_json::to_writer(&mut out, &record)?;
                out.write_all(b"\n")?;
            }
            let file = out.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

struct Inner {
    file: File,
    index: Index,
}

impl Inner {
    fn append(&mut self, record: &Record) -> Result<(), StoreError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        self.file.write_all(line.as_bytes())?;
        self.file.flush()?;
        Ok(())
    }
}

pub struct JournalStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl JournalStore {
    /// Open (creating if needed) the journal in `dir`, replay and compact it.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Self::open_retaining(dir, DEFAULT_RETAINED)
    }

    pub fn open_retaining(dir: &Path, retain: usize) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(JOURNAL_FILE);
        let mut index = Index::default();
        let mut records = 0usize;
        let mut skipped = 0usize;
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Record>(&line) {
                    Ok(r) => {
                        records += 1;
                        index.apply(r);
                    }
                    Err(_) => skipped += 1,
                }
            }
        }
        if skipped > 0 {
            warn!(path = %path.display(), skipped, "journal had unreadable lines");
        }
        let dropped = index.trim(retain);
        if records != index.order.len() || skipped > 0 {
            index.write_compacted(&path)?;
            info!(
                path = %path.display(),
                records,
                kept = index.order.len(),
                dropped,
                "journal compacted"
            );
        }
        debug!(path = %path.display(), messages = index.order.len(), "journal replayed");
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(Inner { file, index }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl MessageStore for JournalStore {
    fn insert(&self, envelope: &MessageEnvelope, status: MessageStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        let record = Record::Insert {
            message: envelope.clone(),
            status,
        };
        inner.append(&record)?;
        inner.index.apply(record);
        Ok(())
    }

    fn update_status(&self, message_id: &str, status: MessageStatus) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        if !inner.index.messages.contains_key(message_id) {
            return Err(StoreError::UnknownMessage(message_id.to_string()));
        }
        let record = Record::Status {
            message_id: message_id.to_string(),
            status,
        };
        inner.append(&record)?;
        inner.index.apply(record);
        Ok(())
    }

    fn get(&self, message_id: &str) -> Result<Option<StoredMessage>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner.index.messages.get(message_id).cloned())
    }

    fn undelivered(&self) -> Result<Vec<MessageEnvelope>, StoreError> {
        let inner = self.inner.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(inner
            .index
            .order
            .iter()
            .filter_map(|id| inner.index.messages.get(id))
            .filter(|m| is_undelivered(m.status))
            .map(|m| m.envelope.clone())
            .collect())
    }
}
