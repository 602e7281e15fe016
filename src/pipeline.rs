/// Fetch pipeline - bounded producer/consumer over the chain RPC
///
/// Walks a height range downward, keeps at most `FETCH_QUEUE` RPC requests
/// outstanding, detaches completed work in groups of `BULK_DB` and commits
/// each group in one database transaction, with at most `SAVE_QUEUE` such
/// transactions open at once.
///
/// Failures never leave the pipeline: a failed fetch drops its height from
/// the batch, a failed commit drops the batch. The gap-fill pass picks both
/// up on a later run.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::rpc::{ChainRpc, RpcError};
use crate::store::ChainStore;
use crate::telemetry::truncate_hash;
use crate::types::BlockInfo;

type FetchHandle = JoinHandle<(u64, Result<BlockInfo, RpcError>)>;

pub struct FetchPipeline<R, S> {
    rpc: Arc<R>,
    store: Arc<S>,
    fetch_slots: Arc<Semaphore>,
    save_slots: Arc<Semaphore>,
    fetch_queue_size: usize,
    bulk_size: usize,
}

impl<R: ChainRpc, S: ChainStore> FetchPipeline<R, S> {
    pub fn new(
        rpc: Arc<R>,
        store: Arc<S>,
        fetch_queue_size: usize,
        save_queue_size: usize,
        bulk_size: usize,
    ) -> Self {
        Self {
            rpc,
            store,
            fetch_slots: Arc::new(Semaphore::new(fetch_queue_size)),
            save_slots: Arc::new(Semaphore::new(save_queue_size)),
            fetch_queue_size,
            bulk_size,
        }
    }

    /// Fetch and persist every height in `[low, high]`, walking downward.
    /// A range with `high < low` is a no-op. Returns once every batch of the
    /// range has been committed or dropped.
    pub async fn run(&self, low: u64, high: u64) {
        if high < low {
            return;
        }
        let mut pending: VecDeque<FetchHandle> = VecDeque::new();
        let mut saves: Vec<JoinHandle<()>> = Vec::new();

        for height in (low..=high).rev() {
            pending.push_back(self.spawn_fetch(height));
            if pending.len() > self.fetch_queue_size {
                let take = self.bulk_size.min(pending.len());
                let batch: Vec<FetchHandle> = pending.drain(..take).collect();
                saves.push(self.submit_batch(batch).await);
            }
        }
        // Residual requests after the last height flush as one final batch
        if !pending.is_empty() {
            let batch: Vec<FetchHandle> = pending.drain(..).collect();
            saves.push(self.submit_batch(batch).await);
        }
        futures::future::join_all(saves).await;
    }

    fn spawn_fetch(&self, height: u64) -> FetchHandle {
        let rpc = Arc::clone(&self.rpc);
        let slots = Arc::clone(&self.fetch_slots);
        tokio::spawn(async move {
            // Permit held for the duration of the RPC call; this is the
            // FETCH_QUEUE concurrency bound
            let _permit = slots.acquire_owned().await.unwrap();
            metrics::FETCHES_IN_FLIGHT.inc();
            let result = rpc.block(height).await;
            metrics::FETCHES_IN_FLIGHT.dec();
            (height, result)
        })
    }

    /// Hand one detached batch to the sink. Awaiting a save slot here is the
    /// backpressure point: submission stalls while `SAVE_QUEUE` batches are
    /// still in flight.
    async fn submit_batch(&self, batch: Vec<FetchHandle>) -> JoinHandle<()> {
        let permit = Arc::clone(&self.save_slots).acquire_owned().await.unwrap();
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut blocks = Vec::with_capacity(batch.len());
            for handle in batch {
                match handle.await {
                    Ok((_, Ok(block))) => {
                        metrics::BLOCKS_FETCHED.inc();
                        blocks.push(block);
                    }
                    Ok((height, Err(err))) if err.is_system() => {
                        metrics::FETCH_FAILURES.with_label_values(&["system"]).inc();
                        info!(height, "dropping block fetch: {}", err);
                    }
                    Ok((height, Err(err))) => {
                        metrics::FETCH_FAILURES.with_label_values(&["node"]).inc();
                        warn!(height, "dropping block fetch: {}", err);
                    }
                    Err(join_err) => {
                        warn!("block fetch task failed: {}", join_err);
                    }
                }
            }
            if blocks.is_empty() {
                drop(permit);
                return;
            }

            metrics::SAVES_IN_FLIGHT.inc();
            let started = Instant::now();
            match store.save_blocks(&blocks).await {
                Ok(()) => {
                    metrics::BATCHES_COMMITTED.inc();
                    metrics::BLOCKS_SAVED.inc_by(blocks.len() as u64);
                    metrics::BATCH_COMMIT_DURATION.observe(started.elapsed().as_secs_f64());
                    debug!(
                        blocks = blocks.len(),
                        newest = %truncate_hash(&blocks[0].header.hash, 16),
                        "batch committed"
                    );
                }
                Err(err) => {
                    // The dropped heights become gaps for the next gap-fill
                    metrics::BATCH_FAILURES.inc();
                    warn!(
                        blocks = blocks.len(),
                        "dropping batch after database error: {}", err
                    );
                }
            }
            metrics::SAVES_IN_FLIGHT.dec();
            drop(permit);
        })
    }
}
