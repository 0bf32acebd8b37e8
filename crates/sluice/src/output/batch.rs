//! 📦 Bulk actions, destination keys, and the batch builder that groups them.
//!
//! 🧠 Knowledge graph:
//! - The router produces a `(DestinationKey, BulkAction)` per record.
//! - [`BatchBuilder::append`] serializes the action straight into the NDJSON buffer of
//!   that key's [`BulkBatch`]. The action object is not kept around afterwards.
//! - Each batch also keeps the chunk entries it accepted, in order, so the error
//!   handler can walk the response items in lock-step and rebuild a retry stream.
//! - [`SplitPolicy`] is chosen once from config. Threshold or unlimited. No third option,
//!   no per-call re-dispatch.
//!
//! ⚠️ Invariant: a batch that has grown past the threshold is flushed before anything
//! else is appended to it. An action is never split across two requests.

use std::collections::HashMap;

use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::{Map, Value};

use crate::common::{ChunkEntry, Record};
use crate::error::RoutingError;
use crate::output::config::WriteOperation;

/// 🎯 Which bulk request a record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationKey {
    pub host: String,
    /// 📌 Index taken from the record itself (`target_index_key`), when there was one.
    pub explicit_index: Option<String>,
    pub target_index: String,
    /// 🪞 Logstash alias (`prefix-app-date`), used by template installs in logstash mode.
    pub target_alias: Option<String>,
}

impl DestinationKey {
    /// 📍 The index to put in the bulk URL when `include_index_in_url` is on.
    pub fn url_index(&self) -> &str {
        self.explicit_index.as_deref().unwrap_or(&self.target_index)
    }
}

/// 🔧 How update/upsert bodies get shaped.
#[derive(Debug, Clone, Default)]
pub struct UpdateBodyOptions {
    pub suppress_doc_wrap: bool,
    pub remove_keys_on_update: Vec<String>,
    pub remove_keys_on_update_key: Option<String>,
}

/// 📨 One `(header, body)` pair in the bulk wire format.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkAction {
    pub operation: WriteOperation,
    pub meta: Map<String, Value>,
    pub body: Value,
}

impl BulkAction {
    /// 🏗️ Build the action, shaping the body for the operation.
    ///
    /// - `index`/`create`: the record as-is.
    /// - `update`: `{"doc": record}` minus the update-only removals.
    /// - `upsert`: like update, plus `doc_as_upsert: true` when nothing was removed,
    ///   or `upsert: <full record>` when the doc lost some keys along the way.
    /// - `suppress_doc_wrap`: the (trimmed) record, bare.
    pub fn new(
        operation: WriteOperation,
        meta: Map<String, Value>,
        record: Record,
        options: &UpdateBodyOptions,
    ) -> Self {
        let body = if operation.is_update_like() {
            update_body(operation, record, options)
        } else {
            Value::Object(record)
        };
        Self {
            operation,
            meta,
            body,
        }
    }

    pub fn has_id(&self) -> bool {
        self.meta.get("_id").is_some_and(|id| !id.is_null())
    }

    /// ✍️ Append `header\nbody\n` to `buf`.
    pub fn write_ndjson(&self, buf: &mut String) -> Result<(), serde_json::Error> {
        let header = serde_json::to_string(&ActionHeader(self.operation.header_key(), &self.meta))?;
        let body = serde_json::to_string(&self.body)?;
        buf.reserve(header.len() + body.len() + 2);
        buf.push_str(&header);
        buf.push('\n');
        buf.push_str(&body);
        buf.push('\n');
        Ok(())
    }
}

struct ActionHeader<'a>(&'a str, &'a Map<String, Value>);

impl Serialize for ActionHeader<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.0, self.1)?;
        map.end()
    }
}

fn update_body(operation: WriteOperation, mut record: Record, options: &UpdateBodyOptions) -> Value {
    // 🗝️ a per-record key list wins over the configured one, and never ships itself
    let per_record_keys = options
        .remove_keys_on_update_key
        .as_ref()
        .and_then(|key| record.remove(key));
    let keys: Vec<String> = match per_record_keys {
        Some(Value::Array(items)) => items
            .into_iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        Some(Value::String(single)) => vec![single],
        _ => options.remove_keys_on_update.clone(),
    };

    let mut doc = record.clone();
    let mut removed_any = false;
    for key in &keys {
        removed_any |= doc.remove(key).is_some();
    }

    if options.suppress_doc_wrap {
        return Value::Object(doc);
    }
    let mut body = Map::new();
    body.insert("doc".to_string(), Value::Object(doc));
    if operation == WriteOperation::Upsert {
        if removed_any {
            body.insert("upsert".to_string(), Value::Object(record));
        } else {
            body.insert("doc_as_upsert".to_string(), Value::Bool(true));
        }
    }
    Value::Object(body)
}

/// 🪣 The accumulated NDJSON for one destination, plus what went into it.
#[derive(Debug, Clone)]
pub struct BulkBatch {
    pub key: DestinationKey,
    pub payload: String,
    /// 📜 Accepted entries in append order, one per action in `payload`.
    pub entries: Vec<ChunkEntry>,
}

impl BulkBatch {
    fn new(key: DestinationKey) -> Self {
        Self {
            key,
            payload: String::new(),
            entries: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// ✂️ Decides whether a batch of a given size must be flushed before growing further.
pub trait SplitCheck {
    fn should_split(&self, batch_bytes: usize) -> bool;
}

/// 📏 Split once a batch is strictly larger than the threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeThreshold {
    pub threshold: usize,
}

impl SplitCheck for SizeThreshold {
    fn should_split(&self, batch_bytes: usize) -> bool {
        batch_bytes > self.threshold
    }
}

/// ♾️ Never split. One flush at end of chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoSplit;

impl SplitCheck for NoSplit {
    fn should_split(&self, _batch_bytes: usize) -> bool {
        false
    }
}

/// 🎭 The split strategy, picked once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitPolicy {
    Threshold(SizeThreshold),
    Unlimited(NoSplit),
}

impl SplitPolicy {
    /// Negative threshold means unlimited.
    pub fn from_threshold(threshold: i64) -> Self {
        match usize::try_from(threshold) {
            Ok(threshold) => SplitPolicy::Threshold(SizeThreshold { threshold }),
            Err(_) => SplitPolicy::Unlimited(NoSplit),
        }
    }
}

impl SplitCheck for SplitPolicy {
    fn should_split(&self, batch_bytes: usize) -> bool {
        match self {
            SplitPolicy::Threshold(policy) => policy.should_split(batch_bytes),
            SplitPolicy::Unlimited(policy) => policy.should_split(batch_bytes),
        }
    }
}

/// 🏗️ Per-chunk accumulator of bulk batches, keyed by destination.
#[derive(Debug)]
pub struct BatchBuilder {
    policy: SplitPolicy,
    positions: HashMap<DestinationKey, usize>,
    batches: Vec<BulkBatch>,
    accepted: usize,
}

impl BatchBuilder {
    pub fn new(policy: SplitPolicy) -> Self {
        Self {
            policy,
            positions: HashMap::new(),
            batches: Vec::new(),
            accepted: 0,
        }
    }

    /// 🚦 True when the batch for `key` already outgrew the budget. The caller must
    /// [`drain`](Self::drain) and submit everything before appending again.
    pub fn needs_split(&self, key: &DestinationKey) -> bool {
        self.positions
            .get(key)
            .and_then(|&pos| self.batches.get(pos))
            .is_some_and(|batch| self.policy.should_split(batch.bytes()))
    }

    /// ➕ Serialize `action` into the batch for `key`.
    ///
    /// Returns `Ok(false)` when the operation needs an `_id` and the action has none.
    /// Nothing is appended in that case.
    pub fn append(
        &mut self,
        key: DestinationKey,
        action: &BulkAction,
        original: ChunkEntry,
    ) -> Result<bool, RoutingError> {
        if action.operation.requires_id() && !action.has_id() {
            // 🪪 an update without an id is a letter without an address
            return Ok(false);
        }
        let mut line = String::new();
        action.write_ndjson(&mut line)?;

        // 🗂️ first time we see this destination? It gets the next slot, which is
        // also why drain() hands batches back in first-seen order.
        let pos = match self.positions.get(&key) {
            Some(&pos) => pos,
            None => {
                self.batches.push(BulkBatch::new(key.clone()));
                let pos = self.batches.len() - 1;
                self.positions.insert(key, pos);
                pos
            }
        };
        if let Some(batch) = self.batches.get_mut(pos) {
            batch.payload.push_str(&line);
            batch.entries.push(original);
            self.accepted += 1;
        }
        Ok(true)
    }

    /// 🚿 Hand over every non-empty batch, in first-seen order, and start fresh.
    pub fn drain(&mut self) -> Vec<BulkBatch> {
        self.positions.clear();
        std::mem::take(&mut self.batches)
            .into_iter()
            .filter(|batch| !batch.is_empty())
            .collect()
    }

    /// 🧮 Actions accepted since this builder was created. Draining does not reset it.
    pub fn accepted(&self) -> usize {
        self.accepted
    }

    pub fn is_empty(&self) -> bool {
        self.batches.iter().all(BulkBatch::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::test_support::{new_years_day, record};
    use serde_json::json;

    fn key(index: &str) -> DestinationKey {
        DestinationKey {
            host: "localhost:9200".into(),
            explicit_index: None,
            target_index: index.into(),
            target_alias: None,
        }
    }

    fn meta(value: Value) -> Map<String, Value> {
        record(value)
    }

    fn entry(value: Value) -> ChunkEntry {
        ChunkEntry::new(new_years_day(), record(value))
    }

    #[test]
    fn the_one_where_an_action_round_trips_through_ndjson() {
        let action = BulkAction::new(
            WriteOperation::Upsert,
            meta(json!({"_index": "logs", "_id": "abc"})),
            record(json!({"msg": "hi"})),
            &UpdateBodyOptions::default(),
        );
        let mut buf = String::new();
        action.write_ndjson(&mut buf).unwrap();
        let mut lines = buf.lines();
        let header: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        let body: Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert!(lines.next().is_none());
        let header = header.as_object().unwrap();
        assert_eq!(header.len(), 1);
        assert_eq!(header["update"], json!({"_index": "logs", "_id": "abc"}));
        assert_eq!(body, json!({"doc": {"msg": "hi"}, "doc_as_upsert": true}));
    }

    #[test]
    fn the_one_where_removed_keys_turn_doc_as_upsert_into_a_full_upsert() {
        let options = UpdateBodyOptions {
            remove_keys_on_update: vec!["created_at".into()],
            ..UpdateBodyOptions::default()
        };
        let action = BulkAction::new(
            WriteOperation::Upsert,
            meta(json!({"_id": 1})),
            record(json!({"msg": "hi", "created_at": "yesterday"})),
            &options,
        );
        assert_eq!(
            action.body,
            json!({
                "doc": {"msg": "hi"},
                "upsert": {"msg": "hi", "created_at": "yesterday"}
            })
        );
    }

    #[test]
    fn the_one_where_the_record_brings_its_own_removal_list() {
        let options = UpdateBodyOptions {
            remove_keys_on_update: vec!["ignored_because_record_wins".into()],
            remove_keys_on_update_key: Some("keys_to_skip".into()),
            suppress_doc_wrap: true,
        };
        let action = BulkAction::new(
            WriteOperation::Update,
            meta(json!({"_id": 1})),
            record(json!({"a": 1, "b": 2, "keys_to_skip": ["b"]})),
            &options,
        );
        assert_eq!(action.body, json!({"a": 1}));
    }

    #[test]
    fn the_one_where_create_without_an_id_is_turned_away() {
        let mut builder = BatchBuilder::new(SplitPolicy::from_threshold(-1));
        let action = BulkAction::new(
            WriteOperation::Create,
            meta(json!({"_index": "logs"})),
            record(json!({"msg": "no id"})),
            &UpdateBodyOptions::default(),
        );
        assert!(!builder.append(key("logs"), &action, entry(json!({}))).unwrap());
        assert_eq!(builder.accepted(), 0);
        assert!(builder.drain().is_empty());

        let index = BulkAction { operation: WriteOperation::Index, ..action };
        assert!(builder.append(key("logs"), &index, entry(json!({}))).unwrap());
        assert_eq!(builder.accepted(), 1);
    }

    #[test]
    fn the_one_where_exactly_at_the_threshold_is_still_fine() {
        let action = BulkAction::new(
            WriteOperation::Index,
            meta(json!({"_index": "logs"})),
            record(json!({"n": 1})),
            &UpdateBodyOptions::default(),
        );
        let mut line = String::new();
        action.write_ndjson(&mut line).unwrap();

        let mut builder = BatchBuilder::new(SplitPolicy::from_threshold(line.len() as i64));
        builder.append(key("logs"), &action, entry(json!({"n": 1}))).unwrap();
        assert!(!builder.needs_split(&key("logs")), "exactly T must not split");

        builder.append(key("logs"), &action, entry(json!({"n": 1}))).unwrap();
        assert!(builder.needs_split(&key("logs")), "past T must split before the next append");
        assert!(!builder.needs_split(&key("other")));
    }

    #[test]
    fn the_one_where_every_accepted_action_lands_in_exactly_one_batch() {
        let mut builder = BatchBuilder::new(SplitPolicy::from_threshold(1));
        let mut flushed = Vec::new();
        for i in 0..5 {
            let index = if i % 2 == 0 { "even" } else { "odd" };
            if builder.needs_split(&key(index)) {
                flushed.extend(builder.drain());
            }
            let action = BulkAction::new(
                WriteOperation::Index,
                meta(json!({"_index": index})),
                record(json!({"i": i})),
                &UpdateBodyOptions::default(),
            );
            builder.append(key(index), &action, entry(json!({"i": i}))).unwrap();
        }
        flushed.extend(builder.drain());

        let total: usize = flushed.iter().map(BulkBatch::count).sum();
        assert_eq!(total, builder.accepted());
        assert_eq!(total, 5);
        for batch in &flushed {
            assert_eq!(batch.payload.lines().count(), batch.count() * 2);
        }
    }

    #[test]
    fn the_one_where_negative_means_never() {
        assert_eq!(SplitPolicy::from_threshold(-1), SplitPolicy::Unlimited(NoSplit));
        assert!(!SplitPolicy::from_threshold(-1).should_split(usize::MAX));
        assert!(SplitPolicy::from_threshold(0).should_split(1));
    }
}
