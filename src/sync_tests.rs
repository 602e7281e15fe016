//! Scenario tests for the sync engine
//!
//! These drive the coordinator and pipeline end to end against a scripted
//! RPC node and an in-memory store, covering the catch-up, backfill and
//! gap-fill passes plus the pipeline's concurrency bounds.

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::config::SyncSettings;
    use crate::rpc::{ChainRpc, RpcError};
    use crate::store::{ChainStore, StoreError};
    use crate::sync::SyncService;
    use crate::types::{
        BlockHeaderInfo, BlockInfo, BlockRows, NodeRecord, StatusInfo, SyncInfo, TransactionInfo,
        WeightInfo,
    };

    /// Scripted chain: every height up to the tip resolves to a synthetic
    /// block, with optional one-shot failures and concurrency tracking.
    struct MockRpc {
        tip: u64,
        status_fail: AtomicBool,
        fail_once: Mutex<HashSet<u64>>,
        requested: Mutex<Vec<u64>>,
        in_flight: AtomicUsize,
        peak_in_flight: AtomicUsize,
    }

    impl MockRpc {
        fn new(tip: u64) -> Self {
            Self {
                tip,
                status_fail: AtomicBool::new(false),
                fail_once: Mutex::new(HashSet::new()),
                requested: Mutex::new(Vec::new()),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
            }
        }

        fn fail_height_once(&self, height: u64) {
            self.fail_once.lock().unwrap().insert(height);
        }

        fn requested_heights(&self) -> HashSet<u64> {
            self.requested.lock().unwrap().iter().copied().collect()
        }

        fn peak_concurrency(&self) -> usize {
            self.peak_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChainRpc for MockRpc {
        async fn status(&self) -> Result<StatusInfo, RpcError> {
            if self.status_fail.load(Ordering::SeqCst) {
                return Err(RpcError::Node {
                    message: "status unavailable".to_string(),
                });
            }
            Ok(StatusInfo {
                sync_info: SyncInfo {
                    latest_block_height: self.tip,
                },
            })
        }

        async fn block(&self, height: u64) -> Result<BlockInfo, RpcError> {
            self.requested.lock().unwrap().push(height);
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
            // Yield so overlapping fetches actually overlap
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail_once.lock().unwrap().remove(&height) {
                return Err(RpcError::MissingBlock {
                    height,
                    message: "injected failure".to_string(),
                });
            }
            if height == 0 || height > self.tip {
                return Err(RpcError::MissingBlock {
                    height,
                    message: "beyond tip".to_string(),
                });
            }
            Ok(block_at(height))
        }
    }

    /// In-memory store keyed by height, with one-shot batch failure
    /// injection and save-concurrency tracking.
    #[derive(Default)]
    struct MemoryStore {
        blocks: Mutex<BTreeMap<u64, BlockRows>>,
        nodes: Mutex<HashMap<String, NodeRecord>>,
        fail_batch_with: Mutex<HashSet<u64>>,
        saves_in_flight: AtomicUsize,
        peak_saves_in_flight: AtomicUsize,
    }

    impl MemoryStore {
        fn with_heights(heights: &[u64]) -> Self {
            let store = Self::default();
            {
                let mut blocks = store.blocks.lock().unwrap();
                for &height in heights {
                    blocks.insert(height, BlockRows::from(&block_at(height)));
                }
            }
            store
        }

        /// The next saved batch containing any of these heights fails once.
        fn fail_next_batch_containing(&self, heights: &[u64]) {
            let mut failers = self.fail_batch_with.lock().unwrap();
            failers.extend(heights.iter().copied());
        }

        fn heights(&self) -> Vec<u64> {
            self.blocks.lock().unwrap().keys().copied().collect()
        }

        fn block(&self, height: u64) -> Option<BlockRows> {
            self.blocks.lock().unwrap().get(&height).cloned()
        }

        fn peak_save_concurrency(&self) -> usize {
            self.peak_saves_in_flight.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChainStore for MemoryStore {
        async fn max_block_height(&self) -> Result<Option<u64>, StoreError> {
            Ok(self.blocks.lock().unwrap().keys().next_back().copied())
        }

        async fn min_block_height(&self) -> Result<Option<u64>, StoreError> {
            Ok(self.blocks.lock().unwrap().keys().next().copied())
        }

        async fn count_blocks_in_range(&self, low: u64, high: u64) -> Result<u64, StoreError> {
            Ok(self.blocks.lock().unwrap().range(low..=high).count() as u64)
        }

        async fn save_blocks(&self, blocks: &[BlockInfo]) -> Result<(), StoreError> {
            {
                let mut failers = self.fail_batch_with.lock().unwrap();
                if !failers.is_empty()
                    && blocks.iter().any(|b| failers.contains(&b.header.height))
                {
                    failers.clear();
                    return Err(StoreError::Database(sqlx::Error::Protocol(
                        "injected batch failure".to_string(),
                    )));
                }
            }
            let current = self.saves_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak_saves_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::task::yield_now().await;
            {
                let mut map = self.blocks.lock().unwrap();
                for block in blocks {
                    map.entry(block.header.height)
                        .or_insert_with(|| BlockRows::from(block));
                }
            }
            self.saves_in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        async fn upsert_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
            self.nodes
                .lock()
                .unwrap()
                .insert(node.node_id.clone(), node.clone());
            Ok(())
        }

        async fn node_count(&self) -> Result<u64, StoreError> {
            Ok(self.nodes.lock().unwrap().len() as u64)
        }
    }

    fn block_at(height: u64) -> BlockInfo {
        let prev_hash = if height > 1 {
            format!("block-hash-{}", height - 1)
        } else {
            "genesis".to_string()
        };
        let body = serde_json::json!({"SendMoney": {"amount": height}})
            .as_object()
            .unwrap()
            .clone();
        BlockInfo {
            header: BlockHeaderInfo {
                hash: format!("block-hash-{}", height),
                height,
                prev_hash,
                timestamp: 1_600_000_000_000_000_000 + height * 1_000_000,
                total_weight: WeightInfo { num: 2 * height },
            },
            transactions: vec![TransactionInfo {
                hash: format!("tx-{}", height),
                originator: "alice.near".to_string(),
                body,
            }],
        }
    }

    fn service(
        rpc: &Arc<MockRpc>,
        store: &Arc<MemoryStore>,
        fetch_queue: usize,
        save_queue: usize,
        bulk: usize,
    ) -> SyncService<MockRpc, MemoryStore> {
        SyncService::new(
            Arc::clone(rpc),
            Arc::clone(store),
            SyncSettings {
                fetch_queue_size: fetch_queue,
                save_queue_size: save_queue,
                bulk_db_update_size: bulk,
                new_block_interval_ms: 1000,
                missing_block_interval_ms: 60_000,
            },
        )
    }

    #[tokio::test]
    async fn test_empty_store_syncs_to_tip() {
        let rpc = Arc::new(MockRpc::new(5));
        let store = Arc::new(MemoryStore::default());
        let service = service(&rpc, &store, 1000, 10, 10);

        service.run_full_sync().await;

        assert_eq!(store.heights(), vec![1, 2, 3, 4, 5]);
        // Stored rows keep the wire data, with timestamps truncated to ms
        for height in 1..=5 {
            let row = store.block(height).unwrap();
            assert_eq!(row.hash, format!("block-hash-{}", height));
            assert_eq!(
                row.timestamp_ms,
                (1_600_000_000_000_000_000 + height * 1_000_000) / 1_000_000
            );
            assert_eq!(row.weight, 2 * height);
            assert_eq!(row.chunk.block_hash, row.hash);
            assert_eq!(row.transactions.len(), 1);
            assert_eq!(row.transactions[0].kind, "SendMoney");
        }
    }

    #[tokio::test]
    async fn test_island_store_fills_both_sides() {
        // Store holds only height 3; the catch-up pass covers [4,5] and the
        // backfill pass covers [1,2]. Height 3 is never requested again.
        let rpc = Arc::new(MockRpc::new(5));
        let store = Arc::new(MemoryStore::with_heights(&[3]));
        let service = service(&rpc, &store, 1000, 10, 10);

        service.run_full_sync().await;

        assert_eq!(store.heights(), vec![1, 2, 3, 4, 5]);
        let requested = rpc.requested_heights();
        assert_eq!(
            requested,
            HashSet::from([1, 2, 4, 5]),
            "stored heights must not be refetched"
        );
    }

    #[tokio::test]
    async fn test_synced_store_is_a_noop() {
        let rpc = Arc::new(MockRpc::new(5));
        let store = Arc::new(MemoryStore::with_heights(&[1, 2, 3, 4, 5]));
        let service = service(&rpc, &store, 1000, 10, 10);

        service.run_full_sync().await;

        assert_eq!(store.heights(), vec![1, 2, 3, 4, 5]);
        assert!(rpc.requested_heights().is_empty());
    }

    #[tokio::test]
    async fn test_gap_bisection_fetches_only_missing_heights() {
        // Store = {1,3,5} with a fetch queue of 2: [2,4] splits until the
        // single-height holes [2,2] and [4,4] are fetched directly.
        let rpc = Arc::new(MockRpc::new(5));
        let store = Arc::new(MemoryStore::with_heights(&[1, 3, 5]));
        let service = service(&rpc, &store, 2, 10, 10);

        service.sync_missing_blocks().await.unwrap();

        assert_eq!(store.heights(), vec![1, 2, 3, 4, 5]);
        assert_eq!(rpc.requested_heights(), HashSet::from([2, 4]));
    }

    #[tokio::test]
    async fn test_fetch_failure_dropped_then_refilled() {
        // A failed fetch drops its height but not its batch; the next
        // gap-fill pass retries it.
        let rpc = Arc::new(MockRpc::new(5));
        rpc.fail_height_once(2);
        let store = Arc::new(MemoryStore::default());
        let service = service(&rpc, &store, 1000, 10, 10);

        service.sync_new_blocks().await.unwrap();
        assert_eq!(store.heights(), vec![1, 3, 4, 5]);

        service.sync_missing_blocks().await.unwrap();
        assert_eq!(store.heights(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failed_batch_becomes_gap_and_converges() {
        // One database batch fails and is dropped; a follow-up catch-up plus
        // gap-fill round restores the full range.
        let rpc = Arc::new(MockRpc::new(6));
        let store = Arc::new(MemoryStore::default());
        store.fail_next_batch_containing(&[4, 5]);
        let service = service(&rpc, &store, 2, 10, 2);

        service.sync_new_blocks().await.unwrap();
        assert!(
            store.heights().len() < 6,
            "the dropped batch must leave holes"
        );

        service.sync_new_blocks().await.unwrap();
        service.sync_missing_blocks().await.unwrap();
        assert_eq!(store.heights(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[tokio::test]
    async fn test_status_failure_abandons_catch_up_pass() {
        let rpc = Arc::new(MockRpc::new(5));
        rpc.status_fail.store(true, Ordering::SeqCst);
        let store = Arc::new(MemoryStore::default());
        let service = service(&rpc, &store, 1000, 10, 10);

        assert!(service.sync_new_blocks().await.is_err());
        assert!(store.heights().is_empty());
        assert!(rpc.requested_heights().is_empty());

        // The next fire finds the node healthy again
        rpc.status_fail.store(false, Ordering::SeqCst);
        service.sync_new_blocks().await.unwrap();
        assert_eq!(store.heights(), vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_save_is_idempotent() {
        let store = MemoryStore::default();
        let batch: Vec<BlockInfo> = (1..=4).map(block_at).collect();

        store.save_blocks(&batch).await.unwrap();
        let first = store.heights();
        // Same batch again, then an overlapping one
        store.save_blocks(&batch).await.unwrap();
        store
            .save_blocks(&(3..=6).map(block_at).collect::<Vec<_>>())
            .await
            .unwrap();

        assert_eq!(first, vec![1, 2, 3, 4]);
        assert_eq!(store.heights(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(store.block(3).unwrap().hash, "block-hash-3");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_backpressure_bounds_hold_under_load() {
        // Deep catch-up with tight bounds: the fetch and save queues must
        // cap concurrency while every height still lands exactly once.
        let tip = 100_000;
        let rpc = Arc::new(MockRpc::new(tip));
        let store = Arc::new(MemoryStore::default());
        let service = service(&rpc, &store, 10, 2, 5);

        service.sync_new_blocks().await.unwrap();

        assert_eq!(store.heights().len() as u64, tip);
        assert!(
            rpc.peak_concurrency() <= 10,
            "fetch concurrency {} exceeded the queue bound",
            rpc.peak_concurrency()
        );
        assert!(
            store.peak_save_concurrency() <= 2,
            "save concurrency {} exceeded the queue bound",
            store.peak_save_concurrency()
        );
    }

    #[tokio::test]
    async fn test_node_upsert_overwrites_by_key() {
        let store = MemoryStore::default();
        let first = NodeRecord {
            node_id: "ed25519:abc".to_string(),
            moniker: "node-a".to_string(),
            account_id: "validator.near".to_string(),
            ip_address: "203.0.113.7".to_string(),
            last_seen_ms: 1_000,
            last_height: 10,
        };
        let mut second = first.clone();
        second.last_seen_ms = 2_000;
        second.last_height = 12;

        store.upsert_node(&first).await.unwrap();
        store.upsert_node(&second).await.unwrap();

        assert_eq!(store.node_count().await.unwrap(), 1);
        let stored = store.nodes.lock().unwrap()["ed25519:abc"].clone();
        assert_eq!(stored.last_seen_ms, 2_000);
        assert_eq!(stored.last_height, 12);
    }
}
