//! 🚰 The bulk output: the one thing the host pipeline calls, once per flush.
//!
//! ```text
//!  chunk ──▶ hosts + version ──▶ affinity ──▶ router ──▶ batch builder ──▶ submitter ──▶ cluster
//!                                                            │                 │
//!                                                   (split when too big)   error handler
//!                                                                              │
//!                                              error events ◀──────────────────┼──▶ retry stream
//! ```
//!
//! 🧠 Knowledge graph:
//! - [`BulkOutput::start`] validates config, fetches credentials, detects the cluster
//!   version, installs a static template, and spawns the background timers.
//! - [`BulkOutput::write`] processes one chunk to completion. Routing failures stay local;
//!   submission failures come back as a [`WriteError`] for the host to act on.
//! - Dropping the output stops its timers.

pub mod accessor;
pub mod affinity;
pub mod batch;
pub mod bulk_errors;
pub mod client;
pub mod config;
pub mod credentials;
pub mod placeholders;
pub mod retry;
pub mod router;
pub mod submit;
pub mod template;
pub mod time_parser;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::common::Chunk;
use crate::error::{RoutingError, WriteError};
use crate::output::affinity::AffinityMap;
use crate::output::batch::{BatchBuilder, BulkBatch, SplitPolicy};
use crate::output::bulk_errors::{BulkErrorHandler, ItemReport, ReconcileError};
use crate::output::client::{ClientManager, HostSpec, describe_hosts};
use crate::output::credentials::CredentialStore;
use crate::output::placeholders::PlaceholderContext;
use crate::output::router::{ExpandedValues, RecordRouter, RouteContext, emits_type};
use crate::output::submit::BulkSubmitter;
use crate::output::template::TemplateInstaller;
use crate::pipeline::{ErrorEvent, ErrorEventSink, LogErrorSink, RetryStreamSink};

pub use config::{CompressionLevel, OutputConfig, WriteOperation};

/// 📊 What one `write(chunk)` did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteSummary {
    pub records: usize,
    pub accepted: usize,
    pub dropped_missing_id: usize,
    pub routing_failures: usize,
    pub batches: usize,
    pub bytes: usize,
    pub successes: usize,
    pub duplicates: usize,
    pub bad_arguments: usize,
    pub emitted: usize,
    pub retried: usize,
}

impl WriteSummary {
    fn absorb(&mut self, report: &ItemReport) {
        self.successes += report.successes;
        self.duplicates += report.duplicates;
        self.bad_arguments += report.bad_arguments;
        self.emitted += report.emitted;
    }
}

/// 🚰 The write path, fully wired.
#[derive(Debug)]
pub struct BulkOutput {
    config: OutputConfig,
    router: RecordRouter,
    split_policy: SplitPolicy,
    submitter: BulkSubmitter,
    error_handler: BulkErrorHandler,
    client: Arc<ClientManager>,
    templates: Option<Arc<TemplateInstaller>>,
    errors: Arc<dyn ErrorEventSink>,
    retry_sink: Arc<dyn RetryStreamSink>,
    timers: Vec<JoinHandle<()>>,
}

impl BulkOutput {
    /// 🚀 Validate, connect, detect, install, and start the timers.
    pub async fn start(
        config: OutputConfig,
        errors: Arc<dyn ErrorEventSink>,
        retry_sink: Arc<dyn RetryStreamSink>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let credentials = match (&config.cloud_auth, config.credential_provider_kind()?) {
            (Some(cloud_auth), Some(kind)) => {
                let store = CredentialStore::from_config(cloud_auth, kind)?;
                store
                    .refresh()
                    .await
                    .context("💀 could not fetch the initial cloud credentials")?;
                Some(Arc::new(store))
            }
            _ => None,
        };
        let client = Arc::new(ClientManager::new(&config, credentials)?);
        let router = RecordRouter::new(&config)?;
        let submitter = BulkSubmitter::new(&config)?;
        let error_handler = BulkErrorHandler::new(&config);
        let templates = TemplateInstaller::load(&config).await?.map(Arc::new);
        let errors: Arc<dyn ErrorEventSink> = if config.emit_error_label_event {
            errors
        } else {
            Arc::new(LogErrorSink)
        };

        if client.has_static_hosts() {
            let vars = HashMap::new();
            let startup = PlaceholderContext::new("", &vars);
            let hosts = client.resolve_hosts(&startup)?;
            if config.should_detect_version() {
                client
                    .detect_version(&hosts)
                    .await
                    .context("💀 cluster version detection gave up")?;
            }
            if let Some(templates) = templates.as_ref().filter(|t| t.is_static()) {
                let name = config.template.name.clone().unwrap_or_default();
                templates
                    .ensure(&client, &hosts, &startup, &name)
                    .await
                    .context("💀 static template install gave up")?;
            }
        }

        let mut timers = Vec::new();
        timers.extend(client.spawn_credential_refresh());
        timers.extend(templates.as_ref().and_then(TemplateInstaller::spawn_cache_clear));

        let split_policy = SplitPolicy::from_threshold(config.bulk_message_request_threshold);
        info!(
            "🚰 bulk output ready: op={}, split={split_policy:?}, compression={:?}",
            config.write_operation, config.compression_level
        );
        Ok(Self {
            split_policy,
            config,
            router,
            submitter,
            error_handler,
            client,
            templates,
            errors,
            retry_sink,
            timers,
        })
    }

    pub fn client(&self) -> &Arc<ClientManager> {
        &self.client
    }

    pub fn config(&self) -> &OutputConfig {
        &self.config
    }

    /// 📦 Ship one chunk. Returns once every batch was submitted and reconciled.
    pub async fn write(&self, chunk: &Chunk) -> Result<WriteSummary, WriteError> {
        let mut summary = WriteSummary {
            records: chunk.len(),
            ..WriteSummary::default()
        };
        if chunk.is_empty() {
            return Ok(summary);
        }

        let placeholders = PlaceholderContext::for_chunk(chunk);
        let hosts = self
            .client
            .resolve_hosts(&placeholders)
            .map_err(|err| WriteError::Unrecoverable(format!("{err:#}")))?;
        let host_label = describe_hosts(&hosts);
        let major_version = self.client.ensure_version(&hosts).await?;
        let values = ExpandedValues::expand(&self.config, &placeholders);
        let affinity = self.affinity_for(chunk, &hosts, &values).await?;
        let ctx = RouteContext {
            tag: &chunk.tag,
            chunk_id: &chunk.unique_id,
            host: &host_label,
            values: &values,
            affinity: &affinity,
            emit_type: emits_type(&self.config, major_version),
        };

        let mut builder = BatchBuilder::new(self.split_policy);
        // 🧭 route, check the budget, append. Repeat until the chunk runs dry.
        for entry in &chunk.entries {
            let routed = match self.router.route(&ctx, entry, self.errors.as_ref()) {
                Ok(routed) => routed,
                Err(err) => {
                    summary.routing_failures += 1;
                    self.errors
                        .emit(ErrorEvent::new(&chunk.tag, entry.time, entry.record.clone(), err));
                    continue;
                }
            };
            if builder.needs_split(&routed.key) {
                // 📏 over budget. Everything pending goes out now, in first-seen order,
                // so the record we are holding starts a fresh request.
                for batch in builder.drain() {
                    self.send_batch(chunk, &hosts, &placeholders, batch, &mut summary)
                        .await?;
                }
            }
            match builder.append(routed.key, &routed.action, entry.clone()) {
                Ok(true) => {}
                Ok(false) if self.config.emit_error_for_missing_id => {
                    summary.routing_failures += 1;
                    let err = RoutingError::MissingId(self.config.write_operation);
                    self.errors
                        .emit(ErrorEvent::new(&chunk.tag, entry.time, entry.record.clone(), err));
                }
                Ok(false) => {
                    summary.dropped_missing_id += 1;
                    debug!(
                        "🗑️ dropping record without '_id', write operation is {}",
                        self.config.write_operation
                    );
                }
                Err(err) => {
                    summary.routing_failures += 1;
                    self.errors
                        .emit(ErrorEvent::new(&chunk.tag, entry.time, entry.record.clone(), err));
                }
            }
        }
        summary.accepted = builder.accepted();
        // 🚿 end of chunk. Whatever is left gets flushed, budget or not.
        for batch in builder.drain() {
            self.send_batch(chunk, &hosts, &placeholders, batch, &mut summary)
                .await?;
        }
        debug!("📦 chunk {} done: {summary:?}", chunk.unique_id);
        Ok(summary)
    }

    async fn affinity_for(
        &self,
        chunk: &Chunk,
        hosts: &[HostSpec],
        values: &ExpandedValues,
    ) -> Result<AffinityMap, WriteError> {
        if !self.config.affinity_enabled() {
            return Ok(AffinityMap::new());
        }
        let ids: BTreeSet<String> = chunk
            .entries
            .iter()
            .filter_map(|entry| self.router.routed_id_of(&entry.record))
            .collect();
        if ids.is_empty() {
            return Ok(AffinityMap::new());
        }
        let pattern = format!(
            "{}{}*",
            values.logstash_prefix, self.config.logstash_prefix_separator
        )
        .to_lowercase();
        let fail_on_error = self.config.affinity_fail_on_error;
        let handle = match self.client.connection(hosts) {
            Ok(handle) => handle,
            Err(err) if fail_on_error => {
                return Err(WriteError::Recoverable {
                    hosts: describe_hosts(hosts),
                    message: format!("{err:#}"),
                });
            }
            Err(err) => {
                warn!("⚠️ no connection for the affinity lookup, routing by date: {err:#}");
                return Ok(AffinityMap::new());
            }
        };
        affinity::resolve(&handle, &pattern, &ids, fail_on_error)
            .await
            .map_err(|failure| WriteError::Recoverable {
                hosts: handle.describe(),
                message: format!("affinity lookup failed: {failure}"),
            })
    }

    async fn send_batch(
        &self,
        chunk: &Chunk,
        hosts: &[HostSpec],
        placeholders: &PlaceholderContext<'_>,
        batch: BulkBatch,
        summary: &mut WriteSummary,
    ) -> Result<(), WriteError> {
        if let Some(templates) = &self.templates {
            let hint = batch
                .key
                .target_alias
                .as_deref()
                .unwrap_or(&batch.key.target_index);
            templates
                .ensure(&self.client, hosts, placeholders, hint)
                .await?;
        }
        let handle = self
            .client
            .connection(hosts)
            .map_err(|err| WriteError::Recoverable {
                hosts: describe_hosts(hosts),
                message: format!("{err:#}"),
            })?;

        summary.batches += 1;
        summary.bytes += batch.bytes();
        let response = match self.submitter.submit(&handle, &batch).await {
            Ok(response) => response,
            Err(failure) => {
                return Err(self
                    .submitter
                    .escalate(&self.client, &handle, chunk, failure)
                    .await);
            }
        };
        // 🎉 `errors: false` means every item made it. No need to read the fine print.
        if response.get("errors") == Some(&Value::Bool(false)) {
            summary.successes += batch.count();
            return Ok(());
        }

        let report = self
            .error_handler
            .reconcile(&chunk.tag, &response, &batch.entries, self.errors.as_ref())
            .map_err(|err| match err {
                ReconcileError::Unrecoverable(_) => {
                    error!("🛑 {err}, aborting chunk {}", chunk.unique_id);
                    WriteError::Unrecoverable(err.to_string())
                }
                ReconcileError::Malformed(message) => WriteError::Recoverable {
                    hosts: handle.describe(),
                    message,
                },
            })?;
        summary.absorb(&report);

        if !report.retry.is_empty() {
            let tag = self.config.retry_tag.as_deref().unwrap_or(&chunk.tag);
            // 🪣 the host buffer is full. Dropping records quietly is not an option,
            // so the whole submission fails loudly instead.
            if !self.retry_sink.storable().await {
                return Err(WriteError::RetryStreamOverflow);
            }
            let count = report.retry.len();
            self.retry_sink
                .emit_stream(tag, report.retry)
                .await
                .map_err(|err| {
                    warn!("⚠️ retry stream refused: {err:#}");
                    WriteError::RetryStreamOverflow
                })?;
            debug!("🔁 {count} records re-queued under '{tag}'");
            summary.retried += count;
        }
        Ok(())
    }
}

impl Drop for BulkOutput {
    fn drop(&mut self) {
        for timer in &self.timers {
            timer.abort();
        }
    }
}
