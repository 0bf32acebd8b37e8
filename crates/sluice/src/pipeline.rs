//! 🔌 The host pipeline's side of the contract: where error events and retry streams go.
//!
//! 🧠 Knowledge graph:
//! - [`ErrorEventSink`] is sync. Emitting an error event must never block the write path,
//!   and must never fail it either. Fire, forget, keep shipping.
//! - [`RetryStreamSink`] is async because re-queueing is buffer I/O in real hosts.
//!   `storable()` is asked first; a full buffer turns into `WriteError::RetryStreamOverflow`.
//! - The in-memory versions back the tests and the CLI's retry rounds.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::common::{Chunk, ChunkEntry, EventTime, Record};

/// 🚨 One out-of-band failure: which tag it belongs to, when, the payload, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    pub tag: String,
    pub time: EventTime,
    pub record: Record,
    pub error: String,
}

impl ErrorEvent {
    pub fn new(tag: impl Into<String>, time: EventTime, record: Record, error: impl ToString) -> Self {
        Self {
            tag: tag.into(),
            time,
            record,
            error: error.to_string(),
        }
    }

    /// ⏱️ Same, stamped with "now". For failures that are not about a specific record's time.
    pub fn now(tag: impl Into<String>, record: Record, error: impl ToString) -> Self {
        Self::new(tag, Utc::now(), record, error)
    }
}

/// 📮 Accepts error events without ever failing the caller.
pub trait ErrorEventSink: std::fmt::Debug + Send + Sync {
    fn emit(&self, event: ErrorEvent);
}

/// 🧪 Keeps every event in a Vec, for tests and the CLI summary.
#[derive(Debug, Clone, Default)]
pub struct InMemoryErrorSink {
    events: Arc<Mutex<Vec<ErrorEvent>>>,
}

impl InMemoryErrorSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ErrorEvent> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ErrorEventSink for InMemoryErrorSink {
    fn emit(&self, event: ErrorEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

/// 📝 Logs the event and moves on. The default when nobody is listening.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorSink;

impl ErrorEventSink for LogErrorSink {
    fn emit(&self, event: ErrorEvent) {
        let payload = serde_json::Value::Object(event.record);
        warn!(
            tag = %event.tag,
            time = %event.time,
            error = %event.error,
            "🚨 error event: {payload}"
        );
    }
}

/// 🔁 Takes a rebuilt sub-chunk back for a later flush attempt.
#[async_trait]
pub trait RetryStreamSink: std::fmt::Debug + Send + Sync {
    /// 🪣 Is there room in the buffer for another stream?
    async fn storable(&self) -> bool;
    /// 📨 Queue `entries` under `tag`.
    async fn emit_stream(&self, tag: &str, entries: Vec<ChunkEntry>) -> Result<()>;
}

/// 🧪 A bounded in-memory retry queue. Capacity counts entries, not streams.
#[derive(Debug, Clone)]
pub struct InMemoryRetrySink {
    capacity: usize,
    queue: Arc<tokio::sync::Mutex<VecDeque<(String, Vec<ChunkEntry>)>>>,
}

impl InMemoryRetrySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Arc::new(tokio::sync::Mutex::new(VecDeque::new())),
        }
    }

    async fn queued_entries(&self) -> usize {
        self.queue.lock().await.iter().map(|(_, entries)| entries.len()).sum()
    }

    /// 🚿 Turn every queued stream into a fresh chunk with a fresh id.
    pub async fn drain_chunks(&self) -> Vec<Chunk> {
        let mut queue = self.queue.lock().await;
        queue
            .drain(..)
            .map(|(tag, entries)| Chunk::new(tag, uuid::Uuid::new_v4().simple().to_string(), entries))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

#[async_trait]
impl RetryStreamSink for InMemoryRetrySink {
    async fn storable(&self) -> bool {
        self.queued_entries().await < self.capacity
    }

    async fn emit_stream(&self, tag: &str, entries: Vec<ChunkEntry>) -> Result<()> {
        let mut queue = self.queue.lock().await;
        let queued: usize = queue.iter().map(|(_, e)| e.len()).sum();
        if queued + entries.len() > self.capacity {
            bail!(
                "💀 retry buffer is full: {queued} queued + {} incoming > capacity {}",
                entries.len(),
                self.capacity
            );
        }
        queue.push_back((tag.to_string(), entries));
        Ok(())
    }
}
