mod config;
mod metrics;
mod pipeline;
mod rpc;
mod server;
mod store;
mod sync;
mod telemetry;
mod types;

#[cfg(test)]
mod sync_tests;

use crate::config::{global_config, SyncSettings};
use crate::rpc::NearRpcClient;
use crate::store::{ChainStore, PgStore};
use crate::sync::SyncService;
use crate::telemetry::TelemetryConfig;

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;

/// Pool headroom beyond the save queue, reserved for telemetry upserts and
/// status reads while every save slot is busy.
const POOL_RESERVE_CONNECTIONS: usize = 4;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    telemetry::init_tracing(TelemetryConfig::from_env())?;
    metrics::init_metrics()?;

    let config = global_config()?;
    let settings = SyncSettings::from_config(config)?;

    let database_url = config.get_string("database_url")?;
    let pool = PgPoolOptions::new()
        .max_connections((settings.save_queue_size + POOL_RESERVE_CONNECTIONS) as u32)
        .connect(&database_url)
        .await?;
    let store = Arc::new(PgStore::new(pool));
    store.init_schema().await?;

    let rpc_url = config.get_string("near_rpc_url")?;
    let rpc = Arc::new(NearRpcClient::new(rpc_url)?);

    // Spawn HTTP surface (telemetry ingestion, status, metrics) in background
    let http_addr: SocketAddr = config.get_string("nearscan_http_addr")?.parse()?;
    let api_store: Arc<dyn ChainStore> = Arc::clone(&store) as Arc<dyn ChainStore>;
    tokio::spawn(async move {
        server::serve(http_addr, api_store).await;
    });

    let service = Arc::new(SyncService::new(rpc, store, settings));

    // Startup full sync, then hand over to the periodic timers
    service.run_full_sync().await;

    let new_timer = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.run_new_block_timer().await })
    };
    let missing_timer = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.run_missing_block_timer().await })
    };
    let _ = tokio::join!(new_timer, missing_timer);

    Ok(())
}
