/// Persistence adapter - Postgres over sqlx
///
/// Blocks, chunks and transactions are write-once rows keyed by hash; a
/// whole fetched batch is committed inside one database transaction so a
/// crash never leaves partial rows visible. Node telemetry rows are
/// upsert-on-key and written many times.
use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;

use crate::types::{BlockInfo, BlockRows, NodeRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database failure: {0}")]
    Database(#[from] sqlx::Error),
}

#[async_trait]
pub trait ChainStore: Send + Sync + 'static {
    /// Highest persisted block height, `None` when the store is empty.
    async fn max_block_height(&self) -> Result<Option<u64>, StoreError>;
    /// Lowest persisted block height, `None` when the store is empty.
    async fn min_block_height(&self) -> Result<Option<u64>, StoreError>;
    /// Number of persisted blocks with height in `[low, high]`.
    async fn count_blocks_in_range(&self, low: u64, high: u64) -> Result<u64, StoreError>;
    /// Persist a batch of blocks with their chunks and transactions in one
    /// database transaction. Idempotent per primary key.
    async fn save_blocks(&self, blocks: &[BlockInfo]) -> Result<(), StoreError>;
    async fn upsert_node(&self, node: &NodeRecord) -> Result<(), StoreError>;
    async fn node_count(&self) -> Result<u64, StoreError>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bootstrap the schema. Migration tooling lives outside this process;
    /// the DDL here only guarantees a fresh database is usable.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                hash TEXT PRIMARY KEY,
                height BIGINT NOT NULL UNIQUE,
                prev_hash TEXT NOT NULL,
                timestamp BIGINT NOT NULL,
                weight BIGINT NOT NULL,
                author_id TEXT NOT NULL,
                list_of_approvals TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS chunks (
                hash TEXT PRIMARY KEY,
                block_hash TEXT NOT NULL REFERENCES blocks(hash),
                shard_id TEXT NOT NULL,
                author_id TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                hash TEXT PRIMARY KEY,
                originator TEXT NOT NULL,
                destination TEXT NOT NULL,
                kind TEXT NOT NULL,
                args JSONB,
                chunk_hash TEXT NOT NULL REFERENCES chunks(hash),
                status TEXT NOT NULL,
                logs TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS nodes (
                node_id TEXT PRIMARY KEY,
                moniker TEXT NOT NULL,
                account_id TEXT NOT NULL,
                ip_address TEXT NOT NULL,
                last_seen BIGINT NOT NULL,
                last_height BIGINT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ChainStore for PgStore {
    async fn max_block_height(&self) -> Result<Option<u64>, StoreError> {
        let height: Option<i64> = sqlx::query_scalar("SELECT MAX(height) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        Ok(height.map(|h| h as u64))
    }

    async fn min_block_height(&self) -> Result<Option<u64>, StoreError> {
        let height: Option<i64> = sqlx::query_scalar("SELECT MIN(height) FROM blocks")
            .fetch_one(&self.pool)
            .await?;
        Ok(height.map(|h| h as u64))
    }

    async fn count_blocks_in_range(&self, low: u64, high: u64) -> Result<u64, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM blocks WHERE height BETWEEN $1 AND $2")
                .bind(low as i64)
                .bind(high as i64)
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }

    async fn save_blocks(&self, blocks: &[BlockInfo]) -> Result<(), StoreError> {
        if blocks.is_empty() {
            return Ok(());
        }
        let rows: Vec<BlockRows> = blocks.iter().map(BlockRows::from).collect();

        let mut tx = self.pool.begin().await?;

        let mut block_qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO blocks (hash, height, prev_hash, timestamp, weight, \
             author_id, list_of_approvals) ",
        );
        block_qb.push_values(rows.iter(), |mut b, row| {
            b.push_bind(&row.hash)
                .push_bind(row.height as i64)
                .push_bind(&row.prev_hash)
                .push_bind(row.timestamp_ms as i64)
                .push_bind(row.weight as i64)
                .push_bind(&row.author_id)
                .push_bind(&row.list_of_approvals);
        });
        block_qb.push(" ON CONFLICT DO NOTHING");
        block_qb.build().execute(&mut *tx).await?;

        let mut chunk_qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO chunks (hash, block_hash, shard_id, author_id) ",
        );
        chunk_qb.push_values(rows.iter(), |mut b, row| {
            b.push_bind(&row.chunk.hash)
                .push_bind(&row.chunk.block_hash)
                .push_bind(&row.chunk.shard_id)
                .push_bind(&row.chunk.author_id);
        });
        chunk_qb.push(" ON CONFLICT DO NOTHING");
        chunk_qb.build().execute(&mut *tx).await?;

        let transactions: Vec<_> = rows.iter().flat_map(|row| row.transactions.iter()).collect();
        if !transactions.is_empty() {
            let mut tx_qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO transactions (hash, originator, destination, kind, args, \
                 chunk_hash, status, logs) ",
            );
            tx_qb.push_values(transactions.iter(), |mut b, row| {
                b.push_bind(&row.hash)
                    .push_bind(&row.originator)
                    .push_bind(&row.destination)
                    .push_bind(&row.kind)
                    .push_bind(&row.args)
                    .push_bind(&row.chunk_hash)
                    .push_bind(&row.status)
                    .push_bind(&row.logs);
            });
            tx_qb.push(" ON CONFLICT DO NOTHING");
            tx_qb.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn upsert_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO nodes (node_id, moniker, account_id, ip_address, last_seen, last_height)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (node_id) DO UPDATE
             SET moniker = EXCLUDED.moniker,
                 account_id = EXCLUDED.account_id,
                 ip_address = EXCLUDED.ip_address,
                 last_seen = EXCLUDED.last_seen,
                 last_height = EXCLUDED.last_height",
        )
        .bind(&node.node_id)
        .bind(&node.moniker)
        .bind(&node.account_id)
        .bind(&node.ip_address)
        .bind(node.last_seen_ms as i64)
        .bind(node.last_height as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn node_count(&self) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM nodes")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }
}
