//! 📜 ChunkReader: NDJSON file in, host-style chunks out.
//!
//! 🎬 The output never reads files. Something upstream buffers records, tags them,
//! and flushes a chunk. For the CLI, that something is this module.
//!
//! Each line is either an envelope or a bare record:
//!
//! ```text
//! {"time": 1704067200, "tag": "app.web", "record": {"msg": "hi"}}
//! {"time": "2024-01-01T00:00:00Z", "record": {"msg": "hi"}}
//! {"msg": "no envelope, time is now, tag is the default"}
//! ```
//!
//! Consecutive lines with the same tag share a chunk until `chunk_size` records.
//! A tag change closes the current chunk. Blank lines are skipped.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use memchr::memchr_iter;
use serde_json::Value;
use tracing::debug;

use crate::common::{Chunk, ChunkEntry, EventTime, Record};
use crate::output::time_parser::TimeParser;

#[derive(Debug, Clone)]
pub struct ChunkReader {
    default_tag: String,
    chunk_size: usize,
}

impl ChunkReader {
    pub fn new(default_tag: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            default_tag: default_tag.into(),
            chunk_size: chunk_size.max(1),
        }
    }

    /// 📖 Read and chunk a whole file.
    pub async fn read_file(&self, path: &Path) -> Result<Vec<Chunk>> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("💀 could not read input file '{}'", path.display()))?;
        let chunks = self
            .parse(&bytes)
            .with_context(|| format!("💀 input file '{}' is not valid NDJSON", path.display()))?;
        debug!(
            "📜 '{}' split into {} chunks ({} bytes)",
            path.display(),
            chunks.len(),
            bytes.len()
        );
        Ok(chunks)
    }

    /// ✂️ Split NDJSON bytes into chunks. Line numbers in errors are 1-based.
    pub fn parse(&self, bytes: &[u8]) -> Result<Vec<Chunk>> {
        let now = Utc::now();
        let mut chunks = Vec::new();
        let mut current: Option<Chunk> = None;

        let mut start = 0;
        let ends = memchr_iter(b'\n', bytes).chain(std::iter::once(bytes.len()));
        for (line_no, end) in ends.enumerate() {
            let line = bytes[start..end].trim_ascii();
            start = end + 1;
            if line.is_empty() {
                continue;
            }
            let (tag, entry) = self
                .parse_line(line, now)
                .with_context(|| format!("💀 line {} could not be parsed", line_no + 1))?;

            let full_or_other_tag = current
                .as_ref()
                .is_some_and(|chunk| chunk.tag != tag || chunk.len() >= self.chunk_size);
            if full_or_other_tag {
                chunks.extend(current.take());
            }
            current
                .get_or_insert_with(|| Chunk::new(tag, new_chunk_id(), Vec::new()))
                .entries
                .push(entry);
        }
        chunks.extend(current);
        Ok(chunks)
    }

    fn parse_line(&self, line: &[u8], now: EventTime) -> Result<(String, ChunkEntry)> {
        let value: Value = serde_json::from_slice(line)?;
        let mut object = match value {
            Value::Object(object) => object,
            other => bail!("expected a JSON object, got {other}"),
        };
        if !matches!(object.get("record"), Some(Value::Object(_))) {
            return Ok((self.default_tag.clone(), ChunkEntry::new(now, object)));
        }
        let tag = match object.get("tag") {
            Some(Value::String(tag)) => tag.clone(),
            Some(other) => bail!("'tag' must be a string, got {other}"),
            None => self.default_tag.clone(),
        };
        let time = match object.get("time") {
            Some(raw) => TimeParser::Auto.parse(raw)?,
            None => now,
        };
        let record: Record = match object.remove("record") {
            Some(Value::Object(record)) => record,
            _ => Record::new(),
        };
        Ok((tag, ChunkEntry::new(time, record)))
    }
}

fn new_chunk_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
