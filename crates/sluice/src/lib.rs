//! 🚰 sluice: the bulk-ingest write path to OpenSearch and Elasticsearch.
//!
//! Chunks of timestamped records go in. Routed, batched, size-bounded `_bulk`
//! requests come out. Partial failures are sorted into "fine", "error event",
//! "retry later" and "stop". The gate only opens one direction.
//!
//! The heart of the crate is [`output::BulkOutput`]. Everything else is the host
//! side the CLI needs to drive it: config loading, a chunk reader, a worker pool,
//! and a progress bar.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

pub mod app_config;
pub mod chunks;
pub mod common;
pub mod error;
pub mod output;
pub mod pipeline;
pub mod progress;
mod workers;

pub use app_config::{AppConfig, RuntimeConfig, load_config};
pub use common::{Chunk, ChunkEntry, EventTime, Record};
pub use error::{RoutingError, TransportErrorKind, WriteError};
pub use output::{BulkOutput, CompressionLevel, OutputConfig, WriteOperation, WriteSummary};
pub use pipeline::{ErrorEvent, ErrorEventSink, InMemoryErrorSink, LogErrorSink, RetryStreamSink};
pub use progress::IngestStats;

/// 📋 What a whole run did, and how long it took.
#[derive(Debug, Clone)]
pub struct IngestReport {
    pub stats: IngestStats,
    pub elapsed: Duration,
}

/// 🚀 Read `input`, chunk it, and push every chunk through the bulk output.
///
/// Records without a tag in their envelope get `default_tag`. Error events go to
/// `errors`. Retry streams land in an in-memory buffer sized by
/// `runtime.retry_queue_capacity` and are replayed in later rounds.
pub async fn run(
    app_config: AppConfig,
    input: &Path,
    default_tag: &str,
    errors: Arc<dyn ErrorEventSink>,
    show_progress: bool,
) -> Result<IngestReport> {
    let AppConfig { output, runtime } = app_config;

    let chunks = chunks::ChunkReader::new(default_tag, runtime.chunk_size_records)
        .read_file(input)
        .await?;
    let total_records: usize = chunks.iter().map(Chunk::len).sum();
    info!(
        "📜 {} chunks, {total_records} records from '{}'",
        chunks.len(),
        input.display()
    );

    let retry_sink = Arc::new(pipeline::InMemoryRetrySink::new(runtime.retry_queue_capacity));
    let bulk_output = BulkOutput::start(output, errors, retry_sink.clone())
        .await
        .context("💀 the bulk output could not start")?;

    let mut progress = progress::ProgressMetrics::new(
        input.display().to_string(),
        total_records as u64,
        show_progress,
    );
    let stats = workers::drain_chunks(
        Arc::new(bulk_output),
        &retry_sink,
        chunks,
        &runtime,
        &mut progress,
    )
    .await?;
    progress.finish();

    Ok(IngestReport {
        stats,
        elapsed: progress.elapsed(),
    })
}
