//! 🩺 Bulk error handler: walk the per-item results next to what we sent, and sort
//! the wreckage into "fine", "tell someone", "try again later", and "stop everything".
//!
//! 🧠 Knowledge graph:
//! - Items are matched positionally against the batch's accepted entries. The batch
//!   kept those entries for exactly this reason.
//! - 200/201: success. 409 on `create`: a duplicate, also fine.
//! - 400: the cluster rejected the document. Error event, never retried.
//! - A plain-string `error`: error event, dropped.
//! - An error type in `unrecoverable_error_types`: the whole submission aborts.
//! - An error type in `unrecoverable_record_types`: error event, dropped.
//! - Any other typed error: onto the retry stream, original order preserved.
//! - No type at all: error event, dropped.
//! - Response without `items`, or with the wrong number of them: the whole batch is
//!   recoverable, because we cannot tell who succeeded.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::common::ChunkEntry;
use crate::output::config::{OutputConfig, WriteOperation};
use crate::pipeline::{ErrorEvent, ErrorEventSink};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    /// 🛑 A configured unrecoverable error type showed up.
    #[error("rejected by the cluster due to {0}")]
    Unrecoverable(String),
    /// 🧩 The response does not line up with what we sent.
    #[error("{0}")]
    Malformed(String),
}

/// 📊 What happened to one batch.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ItemReport {
    pub successes: usize,
    pub duplicates: usize,
    pub bad_arguments: usize,
    pub emitted: usize,
    pub skipped: usize,
    /// 🔁 Entries to re-deliver, in their original relative order.
    pub retry: Vec<ChunkEntry>,
    /// 🏷️ Counts per error type and per odd response shape.
    pub stats: BTreeMap<String, usize>,
}

impl ItemReport {
    fn bump(&mut self, stat: &str) {
        *self.stats.entry(stat.to_string()).or_default() += 1;
    }
}

#[derive(Debug, Clone)]
pub struct BulkErrorHandler {
    write_operation: WriteOperation,
    unrecoverable_error_types: HashSet<String>,
    unrecoverable_record_types: HashSet<String>,
    log_400_reason: bool,
}

impl BulkErrorHandler {
    pub fn new(config: &OutputConfig) -> Self {
        Self {
            write_operation: config.write_operation,
            unrecoverable_error_types: config.unrecoverable_error_types.iter().cloned().collect(),
            unrecoverable_record_types: config.unrecoverable_record_types.iter().cloned().collect(),
            log_400_reason: config.log_os_400_reason,
        }
    }

    /// 🔍 Which key an item result may be filed under for our write operation.
    fn item_result<'a>(&self, item: &'a Value) -> Option<(&'a Map<String, Value>, WriteOperation)> {
        let item = item.as_object()?;
        let candidates: &[(&str, WriteOperation)] = match self.write_operation {
            WriteOperation::Index => &[("index", WriteOperation::Index), ("create", WriteOperation::Create)],
            WriteOperation::Create => &[("create", WriteOperation::Create)],
            WriteOperation::Update => &[("update", WriteOperation::Update)],
            WriteOperation::Upsert => &[("upsert", WriteOperation::Upsert), ("update", WriteOperation::Update)],
        };
        candidates
            .iter()
            .find_map(|(key, op)| item.get(*key).and_then(Value::as_object).map(|result| (result, *op)))
    }

    /// 🩺 Reconcile one bulk response against the entries of the batch it answers.
    pub fn reconcile(
        &self,
        tag: &str,
        response: &Value,
        entries: &[ChunkEntry],
        errors: &dyn ErrorEventSink,
    ) -> Result<ItemReport, ReconcileError> {
        let items = response
            .get("items")
            .and_then(Value::as_array)
            .ok_or_else(|| ReconcileError::Malformed(format!("the response format was unrecognized: {response}")))?;
        if items.len() != entries.len() {
            return Err(ReconcileError::Malformed(format!(
                "the number of records submitted {} does not match the number returned {}",
                entries.len(),
                items.len()
            )));
        }

        let mut report = ItemReport::default();
        // 🧮 item N answers entry N. The cluster keeps the order, so we do too.
        for (item, entry) in items.iter().zip(entries) {
            if item.is_null() {
                // 👻 a null item. It happens. Nobody knows why. We count it and move on.
                report.skipped += 1;
                report.bump("errors_nil_resp");
                continue;
            }
            let Some((result, op)) = self.item_result(item) else {
                report.skipped += 1;
                report.bump("errors_bad_resp");
                continue;
            };
            let Some(status) = result.get("status").and_then(Value::as_u64) else {
                report.skipped += 1;
                report.bump("errors_bad_resp");
                continue;
            };
            let emit = |message: String| {
                errors.emit(ErrorEvent::new(tag, entry.time, entry.record.clone(), message));
            };

            match status {
                200 | 201 => report.successes += 1,
                // 🪞 "already exists" is the best kind of failure for a create
                409 if op == WriteOperation::Create => report.duplicates += 1,
                400 => {
                    report.bad_arguments += 1;
                    let reason = if self.log_400_reason {
                        describe_400(result.get("error"))
                    } else {
                        String::new()
                    };
                    emit(format!("400 - Rejected by the cluster{reason}"));
                    report.emitted += 1;
                }
                _ => match result.get("error") {
                    Some(Value::String(reason)) => {
                        report.bump("errors_block_resp");
                        emit(format!("{status} - {reason}"));
                        report.emitted += 1;
                    }
                    Some(error) => match error.get("type").and_then(Value::as_str) {
                        Some(kind) => {
                            report.bump(kind);
                            if self.unrecoverable_error_types.contains(kind) {
                                // 🛑 out of memory, queue rejection and friends. Retrying would
                                // just make the cluster sadder. Abort the whole submission.
                                return Err(ReconcileError::Unrecoverable(kind.to_string()));
                            }
                            if self.unrecoverable_record_types.contains(kind) {
                                let reason = error.get("reason").and_then(Value::as_str).unwrap_or_default();
                                emit(format!("{status} - {kind}: {reason}"));
                                report.emitted += 1;
                            } else {
                                // 🔁 the original entry, not the routed one. Routing runs again
                                // on the retry pass and must land in the same place.
                                report.retry.push(entry.clone());
                            }
                        }
                        None => {
                            report.bump("errors_bad_resp");
                            emit(format!("{status} - No error type provided in the response"));
                            report.emitted += 1;
                        }
                    },
                    None => {
                        report.bump("errors_bad_resp");
                        emit(format!("{status} - No error type provided in the response"));
                        report.emitted += 1;
                    }
                },
            }
        }

        debug!(
            "🩺 indexed (op = {}): {} successes, {} duplicates, {} bad_argument, {} retry, stats {:?}",
            self.write_operation,
            report.successes,
            report.duplicates,
            report.bad_arguments,
            report.retry.len(),
            report.stats
        );
        Ok(report)
    }
}

fn describe_400(error: Option<&Value>) -> String {
    let Some(error) = error else {
        return String::new();
    };
    let mut reason = String::new();
    if let Some(kind) = error.get("type").and_then(Value::as_str) {
        reason.push_str(&format!(" [error type]: {kind}"));
    }
    if let Some(text) = error.get("reason").and_then(Value::as_str) {
        reason.push_str(&format!(" [reason]: '{text}'"));
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::test_support::{new_years_day, record};
    use crate::pipeline::InMemoryErrorSink;
    use serde_json::json;

    fn entries(n: usize) -> Vec<ChunkEntry> {
        (0..n)
            .map(|i| ChunkEntry::new(new_years_day(), record(json!({"n": i}))))
            .collect()
    }

    fn handler(op: WriteOperation) -> BulkErrorHandler {
        BulkErrorHandler::new(&OutputConfig {
            write_operation: op,
            log_os_400_reason: true,
            ..OutputConfig::default()
        })
    }

    #[test]
    fn the_one_where_only_item_two_gets_a_second_chance() {
        let response = json!({"errors": true, "items": [
            {"index": {"status": 201}},
            {"index": {"status": 429, "error": {"type": "es_rejected_execution_exception", "reason": "queue full"}}},
            {"index": {"status": 200}}
        ]});
        let sent = entries(3);
        let sink = InMemoryErrorSink::new();
        let report = handler(WriteOperation::Index)
            .reconcile("app", &response, &sent, &sink)
            .unwrap();
        assert_eq!(report.successes, 2);
        assert_eq!(report.retry, vec![sent[1].clone()]);
        assert_eq!(report.stats["es_rejected_execution_exception"], 1);
        assert!(sink.is_empty());
    }

    #[test]
    fn the_one_where_the_bad_apples_get_reported_not_retried() {
        let response = json!({"items": [
            {"index": {"status": 400, "error": {"type": "mapper_parsing_exception", "reason": "field [x] is not an int"}}},
            {"index": {"status": 500, "error": {"type": "json_parse_exception"}}},
            {"index": {"status": 500, "error": "blocked by: [FORBIDDEN/12/index read-only]"}},
            {"index": {"status": 500, "error": {"reason": "who knows"}}},
            {"create": {"status": 409}},
            null,
            {"delete": {"status": 200}}
        ]});
        let sink = InMemoryErrorSink::new();
        let report = handler(WriteOperation::Index)
            .reconcile("app", &response, &entries(7), &sink)
            .unwrap();
        assert_eq!(report.bad_arguments, 1);
        assert_eq!(report.emitted, 4);
        assert!(report.retry.is_empty());
        assert_eq!(report.skipped, 2);
        assert_eq!(report.duplicates, 1, "index accepts a create-shaped item, and 409 there is a duplicate");
        let events = sink.events();
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0].error,
            "400 - Rejected by the cluster [error type]: mapper_parsing_exception [reason]: 'field [x] is not an int'"
        );
        assert_eq!(events[0].record, record(json!({"n": 0})));
        assert_eq!(events[2].error, "500 - blocked by: [FORBIDDEN/12/index read-only]");
    }

    #[test]
    fn the_one_where_create_shrugs_at_duplicates() {
        let response = json!({"items": [{"create": {"status": 409, "error": {"type": "version_conflict_engine_exception"}}}]});
        let report = handler(WriteOperation::Create)
            .reconcile("app", &response, &entries(1), &InMemoryErrorSink::new())
            .unwrap();
        assert_eq!(report.duplicates, 1);
        assert!(report.retry.is_empty());
    }

    #[test]
    fn the_one_where_running_out_of_memory_stops_the_show() {
        let response = json!({"items": [
            {"update": {"status": 500, "error": {"type": "some_retryable_thing"}}},
            {"update": {"status": 500, "error": {"type": "out_of_memory_error"}}}
        ]});
        let err = handler(WriteOperation::Upsert)
            .reconcile("app", &response, &entries(2), &InMemoryErrorSink::new())
            .expect_err("unrecoverable");
        assert_eq!(err, ReconcileError::Unrecoverable("out_of_memory_error".into()));
    }

    #[test]
    fn the_one_where_the_response_does_not_add_up() {
        let h = handler(WriteOperation::Index);
        let sink = InMemoryErrorSink::new();
        assert!(matches!(
            h.reconcile("app", &json!({"took": 3}), &entries(1), &sink),
            Err(ReconcileError::Malformed(_))
        ));
        assert!(matches!(
            h.reconcile("app", &json!({"items": []}), &entries(2), &sink),
            Err(ReconcileError::Malformed(_))
        ));
    }
}
