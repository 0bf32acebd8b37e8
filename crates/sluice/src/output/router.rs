//! 🧭 Record router: one record in, one `(DestinationKey, BulkAction)` out.
//!
//! 🧠 Knowledge graph, in the order things happen to a record:
//! 1. flatten nested objects (optional, arrays untouched)
//! 2. timestamp: keep an existing `@timestamp`, else parse `time_key`, else stamp the event time
//! 3. target index: per-record override, else logstash date bucket (+ alias), else static name
//! 4. lower-case it, because the cluster will not have it any other way
//! 5. tag injection, affinity override
//! 6. metadata: `_index`, `_type` (old clusters only), `pipeline`, `_id`/`parent`/`routing`
//! 7. key removal, chunk-id injection
//!
//! 🔁 Routing an already-routed record again is a no-op on the injected fields:
//! `@timestamp` is only written when absent, `chunk_id` is overwritten with the same value.

use std::fmt::Write as _;

use anyhow::Result;
use chrono::{Local, Utc};
use serde_json::{Map, Value};
use tracing::trace;

use crate::common::{ChunkEntry, EventTime, Record};
use crate::error::RoutingError;
use crate::output::accessor::RecordAccessor;
use crate::output::affinity::AffinityMap;
use crate::output::batch::{BulkAction, DestinationKey, UpdateBodyOptions};
use crate::output::config::{OutputConfig, WriteOperation};
use crate::output::placeholders::PlaceholderContext;
use crate::output::time_parser::{TimeParser, format_timestamp};
use crate::pipeline::{ErrorEvent, ErrorEventSink};

pub const TIMESTAMP_FIELD: &str = "@timestamp";

/// 🔧 Config values with placeholders, expanded once per chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpandedValues {
    pub index_name: String,
    pub logstash_prefix: String,
    pub logstash_dateformat: String,
    pub application_name: String,
    pub pipeline: Option<String>,
}

impl ExpandedValues {
    pub fn expand(config: &OutputConfig, placeholders: &PlaceholderContext<'_>) -> Self {
        Self {
            index_name: placeholders.expand(&config.index_name),
            logstash_prefix: placeholders.expand(&config.logstash_prefix),
            logstash_dateformat: placeholders.expand(&config.logstash_dateformat),
            application_name: placeholders.expand(&config.application_name),
            pipeline: placeholders.expand_opt(config.pipeline.as_deref()),
        }
    }
}

/// 📋 Everything the router needs to know about the chunk being routed.
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub tag: &'a str,
    pub chunk_id: &'a str,
    pub host: &'a str,
    pub values: &'a ExpandedValues,
    pub affinity: &'a AffinityMap,
    /// 🦕 Emit `_type`? Only for major version < 2 without suppression.
    pub emit_type: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoutedRecord {
    pub key: DestinationKey,
    pub action: BulkAction,
}

/// 🦕 `_type` lives on only in clusters older than major version 2.
pub fn emits_type(config: &OutputConfig, major_version: u32) -> bool {
    !config.suppress_type_name && major_version < 2
}

/// 🗂️ Render an id-ish JSON value the way it appears in the affinity map.
pub fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// 🧭 Compiled routing rules. Built once at startup, shared by every worker.
#[derive(Debug, Clone)]
pub struct RecordRouter {
    write_operation: WriteOperation,
    logstash_format: bool,
    include_timestamp: bool,
    logstash_prefix_separator: String,
    utc_index: bool,
    time_key: Option<String>,
    time_key_exclude_timestamp: bool,
    time_precision: u8,
    time_parser: TimeParser,
    time_parse_error_tag: String,
    target_index: Option<RecordAccessor>,
    id: Option<RecordAccessor>,
    parent: Option<RecordAccessor>,
    routing: Option<RecordAccessor>,
    remove_keys: Vec<String>,
    flatten_separator: Option<String>,
    tag_key: Option<String>,
    chunk_id_key: Option<String>,
    type_name: String,
    include_index_in_url: bool,
    update_options: UpdateBodyOptions,
}

impl RecordRouter {
    pub fn new(config: &OutputConfig) -> Result<Self> {
        let compile = |path: &Option<String>| path.as_deref().map(RecordAccessor::parse).transpose();
        Ok(Self {
            write_operation: config.write_operation,
            logstash_format: config.logstash_format,
            include_timestamp: config.include_timestamp,
            logstash_prefix_separator: config.logstash_prefix_separator.clone(),
            utc_index: config.utc_index,
            time_key: config.time_key.clone(),
            time_key_exclude_timestamp: config.time_key_exclude_timestamp,
            time_precision: config.time_precision,
            time_parser: TimeParser::from_format(config.time_key_format.as_deref()),
            time_parse_error_tag: config.time_parse_error_tag.clone(),
            target_index: compile(&config.target_index_key)?,
            id: compile(&config.id_key)?,
            parent: compile(&config.parent_key)?,
            routing: compile(&config.routing_key)?,
            remove_keys: config.remove_keys.clone(),
            flatten_separator: config
                .flatten_hashes
                .then(|| config.flatten_hashes_separator.clone()),
            tag_key: config.include_tag_key.then(|| config.tag_key.clone()),
            chunk_id_key: config.include_chunk_id.then(|| config.chunk_id_key.clone()),
            type_name: config.type_name.clone(),
            include_index_in_url: config.include_index_in_url,
            update_options: UpdateBodyOptions {
                suppress_doc_wrap: config.suppress_doc_wrap,
                remove_keys_on_update: config.remove_keys_on_update.clone(),
                remove_keys_on_update_key: config.remove_keys_on_update_key.clone(),
            },
        })
    }

    pub fn write_operation(&self) -> WriteOperation {
        self.write_operation
    }

    /// 🪪 The record's document id, if an id key is configured and present.
    pub fn id_of(&self, record: &Record) -> Option<String> {
        self.id.as_ref()?.get(record).and_then(id_string)
    }

    /// 🪪 Same, but on the record as `route` will see it, flattening included.
    /// This is the id the affinity lookup has to ask about.
    pub fn routed_id_of(&self, record: &Record) -> Option<String> {
        match &self.flatten_separator {
            Some(separator) => self.id_of(&flatten(record, separator)),
            None => self.id_of(record),
        }
    }

    /// 🧭 Route one entry. Time-parse trouble is reported to `errors` and papered over
    /// with the event time; anything else comes back as a [`RoutingError`].
    pub fn route(
        &self,
        ctx: &RouteContext<'_>,
        entry: &ChunkEntry,
        errors: &dyn ErrorEventSink,
    ) -> Result<RoutedRecord, RoutingError> {
        let mut record = match &self.flatten_separator {
            Some(separator) => flatten(&entry.record, separator),
            None => entry.record.clone(),
        };

        let bucket_time = if self.logstash_format || self.include_timestamp {
            Some(self.stamp_time(ctx.tag, entry.time, &mut record, errors))
        } else {
            None
        };

        // 🗓️ the bucket follows the record's own clock when it has one, not the wall clock
        let (target_index, target_alias) = self.resolve_index(ctx.values, bucket_time, &mut record)?;
        let mut target_index = target_index.to_lowercase();
        let target_alias = target_alias.to_lowercase();

        if let Some(tag_key) = &self.tag_key {
            record.insert(tag_key.clone(), Value::String(ctx.tag.to_string()));
        }

        if !ctx.affinity.is_empty() {
            if let Some(existing) = self.id_of(&record).and_then(|id| ctx.affinity.get(&id)) {
                trace!("🧲 affinity keeps this document on '{existing}' instead of '{target_index}'");
                target_index = existing.clone();
            }
        }

        let mut meta = Map::new();
        meta.insert("_index".to_string(), Value::String(target_index.clone()));
        if ctx.emit_type {
            meta.insert("_type".to_string(), Value::String(self.type_name.clone()));
        }
        if let Some(pipeline) = &ctx.values.pipeline {
            meta.insert("pipeline".to_string(), Value::String(pipeline.clone()));
        }
        for (accessor, meta_key) in [
            (&self.id, "_id"),
            (&self.parent, "parent"),
            (&self.routing, "routing"),
        ] {
            if let Some(value) = accessor.as_ref().and_then(|a| a.get(&record)) {
                if !value.is_null() {
                    meta.insert(meta_key.to_string(), value.clone());
                }
            }
        }

        for key in &self.remove_keys {
            record.remove(key);
        }
        if let Some(chunk_id_key) = &self.chunk_id_key {
            record.insert(chunk_id_key.clone(), Value::String(ctx.chunk_id.to_string()));
        }

        let explicit_index = if self.include_index_in_url {
            // 📍 the index moves from the header into the URL. Saying it twice makes the cluster grumpy.
            meta.remove("_index");
            Some(target_index.clone())
        } else {
            None
        };
        let key = DestinationKey {
            host: ctx.host.to_string(),
            explicit_index,
            target_index,
            target_alias: Some(target_alias),
        };
        let action = BulkAction::new(self.write_operation, meta, record, &self.update_options);
        Ok(RoutedRecord { key, action })
    }

    fn stamp_time(
        &self,
        tag: &str,
        event_time: EventTime,
        record: &mut Record,
        errors: &dyn ErrorEventSink,
    ) -> EventTime {
        if let Some(existing) = record.get(TIMESTAMP_FIELD) {
            return self.parse_or_fallback(tag, event_time, existing, errors);
        }
        if let Some(raw) = self.time_key.as_ref().and_then(|key| record.get(key)) {
            let parsed = self.parse_or_fallback(tag, event_time, raw, errors);
            if !self.time_key_exclude_timestamp {
                record.insert(
                    TIMESTAMP_FIELD.to_string(),
                    Value::String(format_timestamp(&parsed, self.time_precision)),
                );
            }
            return parsed;
        }
        record.insert(
            TIMESTAMP_FIELD.to_string(),
            Value::String(format_timestamp(&event_time, self.time_precision)),
        );
        event_time
    }

    fn parse_or_fallback(
        &self,
        tag: &str,
        event_time: EventTime,
        raw: &Value,
        errors: &dyn ErrorEventSink,
    ) -> EventTime {
        match self.time_parser.parse(raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                let mut payload = Map::new();
                payload.insert("tag".to_string(), Value::String(tag.to_string()));
                payload.insert("time".to_string(), Value::String(event_time.to_rfc3339()));
                payload.insert(
                    "format".to_string(),
                    Value::String(self.time_parser.format_name().to_string()),
                );
                payload.insert("value".to_string(), raw.clone());
                errors.emit(ErrorEvent::now(self.time_parse_error_tag.clone(), payload, err));
                event_time
            }
        }
    }

    fn resolve_index(
        &self,
        values: &ExpandedValues,
        bucket_time: Option<EventTime>,
        record: &mut Record,
    ) -> Result<(String, String), RoutingError> {
        if let Some(explicit) = self.target_index.as_ref().and_then(|a| a.take(record)) {
            if let Some(name) = id_string(&explicit) {
                return Ok((name.clone(), name));
            }
        }
        if self.logstash_format {
            let time = bucket_time.unwrap_or_else(Utc::now);
            let date = self.format_date(&time, &values.logstash_dateformat)?;
            let sep = &self.logstash_prefix_separator;
            let index = format!("{}{sep}{date}", values.logstash_prefix);
            let alias = format!(
                "{}{sep}{}{sep}{date}",
                values.logstash_prefix, values.application_name
            );
            return Ok((index, alias));
        }
        Ok((values.index_name.clone(), values.index_name.clone()))
    }

    fn format_date(&self, time: &EventTime, format: &str) -> Result<String, RoutingError> {
        let mut out = String::new();
        let written = if self.utc_index {
            write!(out, "{}", time.format(format))
        } else {
            write!(out, "{}", time.with_timezone(&Local).format(format))
        };
        written.map_err(|_| RoutingError::DateFormat(format.to_string()))?;
        Ok(out)
    }
}

/// 🥞 Flatten nested objects into `a_b_c` keys. Arrays stay arrays. Empty objects vanish.
fn flatten(record: &Record, separator: &str) -> Record {
    fn walk(prefix: &str, value: &Value, separator: &str, out: &mut Record) {
        match value {
            Value::Object(map) => {
                for (key, inner) in map {
                    let joined = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{prefix}{separator}{key}")
                    };
                    walk(&joined, inner, separator, out);
                }
            }
            other => {
                out.insert(prefix.to_string(), other.clone());
            }
        }
    }
    let mut out = Map::new();
    for (key, value) in record {
        walk(key, value, separator, &mut out);
    }
    out
}
