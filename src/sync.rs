/// Sync Service - Manages blockchain synchronization
///
/// Three passes share one fetch pipeline and one database:
/// 1. New-block sync: forward catch-up from the highest stored height to the
///    node's current tip
/// 2. Old-block sync: backfill from the lowest stored height down to genesis
/// 3. Missing-block sync: divide-and-conquer probe over the stored range,
///    refetching any heights dropped by earlier passes
///
/// Their height ranges are disjoint by construction (new works above the
/// max watermark, old below the min, missing strictly inside), so the passes
/// may overlap in time without contending on rows.
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{info, warn};

use crate::config::SyncSettings;
use crate::metrics;
use crate::pipeline::FetchPipeline;
use crate::rpc::ChainRpc;
use crate::store::{ChainStore, StoreError};

type PassResult = Result<(), Box<dyn Error + Send + Sync>>;

/// Range walked by the new-block pass: everything above the stored maximum
/// up to the reported tip.
pub fn new_block_range(last: Option<u64>, tip: u64) -> Option<(u64, u64)> {
    let low = last.unwrap_or(0) + 1;
    if tip >= low {
        Some((low, tip))
    } else {
        None
    }
}

/// Range walked by the old-block pass: everything below the stored minimum
/// down to height 1. An empty store has no history to walk.
pub fn old_block_range(oldest: Option<u64>) -> Option<(u64, u64)> {
    match oldest {
        Some(oldest) if oldest > 1 => Some((1, oldest - 1)),
        _ => None,
    }
}

/// Interior of the stored range probed by the missing-block pass. With
/// fewer than two stored rows there is no interior.
pub fn missing_block_bounds(min: Option<u64>, max: Option<u64>) -> Option<(u64, u64)> {
    match (min, max) {
        (Some(min), Some(max)) if max >= min + 2 => Some((min + 1, max - 1)),
        _ => None,
    }
}

pub struct SyncService<R, S> {
    rpc: Arc<R>,
    store: Arc<S>,
    pipeline: FetchPipeline<R, S>,
    settings: SyncSettings,
}

impl<R: ChainRpc, S: ChainStore> SyncService<R, S> {
    pub fn new(rpc: Arc<R>, store: Arc<S>, settings: SyncSettings) -> Self {
        let pipeline = FetchPipeline::new(
            Arc::clone(&rpc),
            Arc::clone(&store),
            settings.fetch_queue_size,
            settings.save_queue_size,
            settings.bulk_db_update_size,
        );
        Self {
            rpc,
            store,
            pipeline,
            settings,
        }
    }

    /// Catch up from the highest stored height to the node's reported tip.
    /// A failed `status` call abandons the pass; the next scheduled fire
    /// retries.
    pub async fn sync_new_blocks(&self) -> PassResult {
        let last = self.store.max_block_height().await?;
        let tip = self.rpc.status().await?.sync_info.latest_block_height;
        metrics::CHAIN_TIP_HEIGHT
            .with_label_values(&["rpc"])
            .set(tip as i64);
        if let Some(stored) = last {
            metrics::CHAIN_TIP_HEIGHT
                .with_label_values(&["db"])
                .set(stored as i64);
        }
        if let Some((low, high)) = new_block_range(last, tip) {
            info!(low, high, "syncing new blocks");
            self.pipeline.run(low, high).await;
        }
        Ok(())
    }

    /// Walk stored history downward to genesis. Terminates for good once
    /// height 1 is stored; re-running is then a no-op.
    pub async fn sync_old_blocks(&self) -> PassResult {
        let oldest = self.store.min_block_height().await?;
        if let Some((low, high)) = old_block_range(oldest) {
            info!(low, high, "syncing old blocks");
            self.pipeline.run(low, high).await;
        }
        Ok(())
    }

    /// Refetch heights missing from the stored range.
    pub async fn sync_missing_blocks(&self) -> PassResult {
        let min = self.store.min_block_height().await?;
        let max = self.store.max_block_height().await?;
        if let Some((low, high)) = missing_block_bounds(min, max) {
            self.fill_range(low, high).await?;
        }
        Ok(())
    }

    /// Divide and conquer over `[low, high]`: a fully covered range returns
    /// at the cost of one count query, a fully missing range small enough
    /// for the fetch queue is fetched directly, anything else splits in
    /// half. Keeps count queries off dense regions and never feeds the
    /// pipeline a range wider than the fetch queue.
    fn fill_range(&self, low: u64, high: u64) -> BoxFuture<'_, Result<(), StoreError>> {
        Box::pin(async move {
            let expected = high - low + 1;
            let present = self.store.count_blocks_in_range(low, high).await?;
            if present >= expected {
                return Ok(());
            }
            if high - low <= self.settings.fetch_queue_size as u64 && present == 0 {
                info!(low, high, "filling missing block range");
                self.pipeline.run(low, high).await;
                return Ok(());
            }
            let mid = low + (high - low) / 2;
            self.fill_range(low, mid).await?;
            self.fill_range(mid + 1, high).await?;
            Ok(())
        })
    }

    /// Startup sequence: new blocks, then missing ones, then old history.
    /// Each pass is guarded so one failure does not skip the others.
    pub async fn run_full_sync(&self) {
        let result = self.sync_new_blocks().await;
        record_pass("new", &result);
        let result = self.sync_missing_blocks().await;
        record_pass("missing", &result);
        let result = self.sync_old_blocks().await;
        record_pass("old", &result);
    }

    /// Self-rescheduling new-block timer. The first fire is delayed to let
    /// the startup full sync get ahead; each later fire waits for the pass
    /// to finish before sleeping again, so a slow pass never stacks up
    /// overlapping runs.
    pub async fn run_new_block_timer(&self) {
        let period = Duration::from_millis(self.settings.new_block_interval_ms);
        tokio::time::sleep(period * 10).await;
        loop {
            let result = self.sync_new_blocks().await;
            record_pass("new", &result);
            tokio::time::sleep(period).await;
        }
    }

    /// Self-rescheduling missing-block timer; first fire after one period.
    pub async fn run_missing_block_timer(&self) {
        let period = Duration::from_millis(self.settings.missing_block_interval_ms);
        loop {
            tokio::time::sleep(period).await;
            let result = self.sync_missing_blocks().await;
            record_pass("missing", &result);
        }
    }
}

fn record_pass(pass: &str, result: &PassResult) {
    match result {
        Ok(()) => {
            metrics::SYNC_PASSES
                .with_label_values(&[pass, "success"])
                .inc();
        }
        Err(err) => {
            metrics::SYNC_PASSES
                .with_label_values(&[pass, "failed"])
                .inc();
            warn!("{} block sync failed: {}", pass, err);
        }
    }
}
