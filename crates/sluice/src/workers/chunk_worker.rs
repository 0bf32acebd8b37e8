//! 🎬 *[a channel fills with chunks. somewhere, a cluster waits.]*
//!
//! 🚰 The ChunkWorker: pulls one chunk at a time off the channel, hands it to the
//! bulk output, and reports how it went. It never retries on its own. That is
//! the pool's call, once the whole round is done.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_channel::{Receiver, Sender};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::Worker;
use crate::common::Chunk;
use crate::error::WriteError;
use crate::output::{BulkOutput, WriteSummary};

/// 📬 What happened to one chunk.
#[derive(Debug)]
pub(crate) enum ChunkOutcome {
    Written(WriteSummary),
    Failed { chunk: Chunk, error: WriteError },
}

#[derive(Debug)]
pub(crate) struct ChunkWorker {
    id: usize,
    rx: Receiver<Chunk>,
    outcomes: Sender<ChunkOutcome>,
    output: Arc<BulkOutput>,
}

impl ChunkWorker {
    pub(crate) fn new(
        id: usize,
        rx: Receiver<Chunk>,
        outcomes: Sender<ChunkOutcome>,
        output: Arc<BulkOutput>,
    ) -> Self {
        Self {
            id,
            rx,
            outcomes,
            output,
        }
    }
}

impl Worker for ChunkWorker {
    fn start(self) -> JoinHandle<Result<()>> {
        tokio::spawn(async move {
            debug!("📥 ChunkWorker {} started draining the channel", self.id);
            while let Ok(chunk) = self.rx.recv().await {
                let outcome = match self.output.write(&chunk).await {
                    Ok(summary) => ChunkOutcome::Written(summary),
                    Err(error) => {
                        warn!(
                            "⚠️ ChunkWorker {}: chunk {} ({} records, tag '{}') failed: {error}",
                            self.id,
                            chunk.unique_id,
                            chunk.len(),
                            chunk.tag
                        );
                        ChunkOutcome::Failed { chunk, error }
                    }
                };
                self.outcomes
                    .send(outcome)
                    .await
                    .context("💀 ChunkWorker lost the outcome channel. Nobody is listening.")?;
            }
            debug!("🏁 ChunkWorker {}: channel closed. Shutting down.", self.id);
            Ok(())
        })
    }
}
