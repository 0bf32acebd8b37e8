//! 📦 Common data structures, the building blocks of sluice.
//!
//! 🎬 A chunk arrives. It is a bag of timestamped records that the host
//! pipeline buffered, tagged, and handed over with a unique id stapled on.
//! None of the records know which index they will end up in. Relatable.
//!
//! These structs ferry log records from the host buffer through routing,
//! batching and submission. They do not ask questions. They carry data. 🦆

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// 📄 One log record: string keys to arbitrary JSON values. Mutated in place
/// by the router, owned by the write path for the duration of one chunk.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// ⏱️ The implicit event timestamp every record travels with.
pub type EventTime = DateTime<Utc>;

/// 🎯 A single `(time, record)` pair. The atomic unit of shipping.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkEntry {
    pub time: EventTime,
    pub record: Record,
}

impl ChunkEntry {
    pub fn new(time: EventTime, record: Record) -> Self {
        Self { time, record }
    }
}

/// 🪣 A `Chunk`: the host buffer's flush unit.
///
/// Ordered entries, a stable tag, a unique id (hex), plus whatever chunk-key
/// variables the host wants placeholders to see. Exposed once per flush.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Chunk {
    pub tag: String,
    pub unique_id: String,
    pub entries: Vec<ChunkEntry>,
    /// 🔧 Chunk-key variables for `${name}` placeholder expansion.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub variables: HashMap<String, String>,
}

impl Chunk {
    /// 🏗️ Assemble a chunk. Variables start empty; add them with [`Chunk::with_variable`].
    pub fn new(tag: impl Into<String>, unique_id: impl Into<String>, entries: Vec<ChunkEntry>) -> Self {
        Self {
            tag: tag.into(),
            unique_id: unique_id.into(),
            entries,
            variables: HashMap::new(),
        }
    }

    pub fn with_variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.variables.insert(key.into(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 📊 Rough byte count of the records, for progress accounting only.
    pub fn approximate_bytes(&self) -> usize {
        self.entries
            .iter()
            .map(|entry| serde_json::to_vec(&entry.record).map(|v| v.len()).unwrap_or(0))
            .sum()
    }
}
