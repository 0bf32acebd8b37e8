//! 🧵 Workers: the host side of the write path.
//!
//! 🧠 Knowledge graph:
//! - A round pushes chunks through a bounded `async_channel` to `worker_count`
//!   [`ChunkWorker`]s. Each worker calls `write(chunk)` on the shared output, one
//!   chunk at a time.
//! - After a round: retryable failures plus whatever landed on the retry stream
//!   become the next round. Unrecoverable failures are counted and dropped.
//! - At most `max_retry_rounds` extra rounds. After that, leftovers are failures.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::try_join_all;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

mod chunk_worker;
use chunk_worker::{ChunkOutcome, ChunkWorker};

use crate::app_config::RuntimeConfig;
use crate::common::Chunk;
use crate::output::BulkOutput;
use crate::pipeline::InMemoryRetrySink;
use crate::progress::{IngestStats, ProgressMetrics};

/// 🏗️ A background worker, that does work. duh.
pub trait Worker {
    fn start(self) -> JoinHandle<Result<()>>;
}

/// ⏳ Pause between rounds, doubling each time, capped at 30s.
fn round_backoff(round: u32) -> Duration {
    Duration::from_millis(250u64.saturating_mul(1 << round.min(7))).min(Duration::from_secs(30))
}

/// 🧵 Drive `chunks` through the output until everything is written, failed, or out of rounds.
pub(crate) async fn drain_chunks(
    output: Arc<BulkOutput>,
    retry_sink: &InMemoryRetrySink,
    chunks: Vec<Chunk>,
    runtime: &RuntimeConfig,
    progress: &mut ProgressMetrics,
) -> Result<IngestStats> {
    let mut stats = IngestStats::default();
    let mut pending = chunks;
    let mut round = 0u32;

    loop {
        debug!("🔄 round {round}: {} chunks in flight", pending.len());
        let mut next = run_round(&output, pending, runtime, |outcome| match outcome {
            ChunkOutcome::Written(summary) => {
                stats.record_write(&summary);
                let settled = summary.records.saturating_sub(summary.retried);
                progress.update(settled as u64, summary.bytes as u64);
                None
            }
            ChunkOutcome::Failed { chunk, error } if error.is_retryable() => {
                stats.chunks_retried += 1;
                Some(chunk)
            }
            ChunkOutcome::Failed { chunk, error } => {
                error!("💀 chunk {} dropped: {error}", chunk.unique_id);
                stats.chunks_failed += 1;
                progress.update(chunk.len() as u64, 0);
                None
            }
        })
        .await?;

        let requeued = retry_sink.drain_chunks().await;
        if !requeued.is_empty() {
            debug!("🔁 {} retry streams picked up from the buffer", requeued.len());
        }
        next.extend(requeued);
        if next.is_empty() {
            break;
        }
        if round >= runtime.max_retry_rounds {
            let abandoned: usize = next.iter().map(Chunk::len).sum();
            error!(
                "💀 giving up on {} chunks ({abandoned} records) after {round} retry rounds",
                next.len()
            );
            stats.chunks_failed += next.len() as u64;
            progress.update(abandoned as u64, 0);
            break;
        }
        round += 1;
        stats.retry_rounds = round;
        let pause = round_backoff(round);
        warn!(
            "🔁 retry round {round} of {}: {} chunks, starting in {pause:?}",
            runtime.max_retry_rounds,
            next.len()
        );
        tokio::time::sleep(pause).await;
        pending = next;
    }

    info!("✅ ingest finished: {stats:?}");
    Ok(stats)
}

/// 🎬 One round: feed every chunk to the pool and collect what the `on_outcome`
/// callback hands back for the next round.
async fn run_round(
    output: &Arc<BulkOutput>,
    chunks: Vec<Chunk>,
    runtime: &RuntimeConfig,
    mut on_outcome: impl FnMut(ChunkOutcome) -> Option<Chunk>,
) -> Result<Vec<Chunk>> {
    let (tx, rx) = async_channel::bounded(runtime.queue_capacity.max(1));
    let (outcome_tx, outcome_rx) = async_channel::unbounded();

    let workers: Vec<JoinHandle<Result<()>>> = (0..runtime.worker_count.max(1))
        .map(|id| ChunkWorker::new(id, rx.clone(), outcome_tx.clone(), Arc::clone(output)).start())
        .collect();
    drop(rx);
    drop(outcome_tx);

    let feeder: JoinHandle<Result<()>> = tokio::spawn(async move {
        for chunk in chunks {
            tx.send(chunk)
                .await
                .context("💀 every ChunkWorker hung up before the input ran out")?;
        }
        Ok(())
    });

    let mut next = Vec::new();
    while let Ok(outcome) = outcome_rx.recv().await {
        next.extend(on_outcome(outcome));
    }

    feeder.await.context("💀 chunk feeder panicked")??;
    try_join_all(workers)
        .await
        .context("💀 a ChunkWorker panicked")?
        .into_iter()
        .collect::<Result<Vec<()>>>()?;
    Ok(next)
}
