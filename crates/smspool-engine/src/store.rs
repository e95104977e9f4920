//! Persistence contract for received messages.
//!
//! The receive scheduler hands every accepted message to a [`MessageStore`]
//! after the caller callback. The engine depends on nothing beyond the
//! fields of [`ReceivedMessage`]; schema and backend belong to the store.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use smspool_models::{Imei, ReceivedMessage};

use crate::error::StoreError;

/// Durable sink for received messages. Calls may block.
pub trait MessageStore: Send + Sync + 'static {
    fn store(&self, message: &ReceivedMessage, imei: &Imei) -> Result<(), StoreError>;
}

/// A stored message together with where and when it was received.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub imei: Imei,
    pub stored_at: DateTime<Utc>,
    pub message: ReceivedMessage,
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStore;

impl MessageStore for NullStore {
    fn store(&self, _message: &ReceivedMessage, _imei: &Imei) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    messages: Mutex<Vec<StoredMessage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<StoredMessage> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl MessageStore for MemoryStore {
    fn store(&self, message: &ReceivedMessage, imei: &Imei) -> Result<(), StoreError> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(StoredMessage {
                imei: imei.clone(),
                stored_at: Utc::now(),
                message: message.clone(),
            });
        Ok(())
    }
}

/// Appends one JSON object per message to a file.
#[derive(Debug)]
pub struct JsonLinesStore {
    file: Mutex<File>,
}

impl JsonLinesStore {
    /// Open (creating if needed) `path` for appending.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl MessageStore for JsonLinesStore {
    fn store(&self, message: &ReceivedMessage, imei: &Imei) -> Result<(), StoreError> {
        let record = StoredMessage {
            imei: imei.clone(),
            stored_at: Utc::now(),
            message: message.clone(),
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smspool_models::{MessageStatus, MessageType};

    fn message(index: u32) -> ReceivedMessage {
        ReceivedMessage {
            error_code: 0,
            index,
            date: "2026-10-17 09:00:00".into(),
            status: MessageStatus::Unread,
            source_number: "+34123456789".into(),
            text: format!("message {index}"),
            message_type: MessageType::Inbox,
        }
    }

    #[test]
    fn memory_store_keeps_order() {
        let store = MemoryStore::new();
        let imei = Imei::normalize("358719846826017");
        store.store(&message(0), &imei).unwrap();
        store.store(&message(1), &imei).unwrap();
        let stored = store.messages();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].message.index, 0);
        assert_eq!(stored[1].imei, imei);
    }

    #[test]
    fn json_lines_store_appends() {
        let path = std::env::temp_dir().join(format!(
            "smspool-store-{}-{}.jsonl",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let imei = Imei::normalize("358719846826017");
        {
            let store = JsonLinesStore::open(&path).unwrap();
            store.store(&message(0), &imei).unwrap();
            store.store(&message(1), &imei).unwrap();
        }
        let contents = std::fs::read_to_string(&path).unwrap();
        let records: Vec<StoredMessage> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].message.text, "message 1");
        std::fs::remove_file(&path).unwrap();
    }
}
