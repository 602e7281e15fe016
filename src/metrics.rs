/// Metrics Module - Prometheus Instrumentation
///
/// Registry and metric statics for the sync engine:
/// - pipeline throughput and in-flight gauges
/// - latency histograms
/// - error counters
/// - telemetry/HTTP counters
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

/// Standard latency buckets for histograms (seconds)
const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ========================================================================
    // 1. PIPELINE PROGRESS & THROUGHPUT
    // ========================================================================

    /// Blocks fetched successfully from the chain RPC
    pub static ref BLOCKS_FETCHED: IntCounter = IntCounter::new(
        "nearscan_blocks_fetched_total",
        "Blocks fetched successfully from the chain RPC"
    ).unwrap();

    /// Blocks committed to the database
    pub static ref BLOCKS_SAVED: IntCounter = IntCounter::new(
        "nearscan_blocks_saved_total",
        "Blocks committed to the database"
    ).unwrap();

    /// Batches committed to the database
    pub static ref BATCHES_COMMITTED: IntCounter = IntCounter::new(
        "nearscan_batches_committed_total",
        "Database batch transactions committed"
    ).unwrap();

    /// Chain tip height
    /// Labels: source (rpc, db)
    pub static ref CHAIN_TIP_HEIGHT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("nearscan_chain_tip_height", "Chain tip height by source"),
        &["source"]
    ).unwrap();

    /// RPC block requests currently outstanding
    pub static ref FETCHES_IN_FLIGHT: IntGauge = IntGauge::new(
        "nearscan_fetches_in_flight",
        "RPC block requests currently outstanding"
    ).unwrap();

    /// Database save transactions currently open
    pub static ref SAVES_IN_FLIGHT: IntGauge = IntGauge::new(
        "nearscan_saves_in_flight",
        "Database save transactions currently open"
    ).unwrap();

    /// Sync pass outcomes
    /// Labels: pass (new, old, missing), outcome (success, failed)
    pub static ref SYNC_PASSES: IntCounterVec = IntCounterVec::new(
        Opts::new("nearscan_sync_passes_total", "Sync pass outcomes by pass and result"),
        &["pass", "outcome"]
    ).unwrap();

    // ========================================================================
    // 2. LATENCY HISTOGRAMS
    // ========================================================================

    /// Database batch commit duration
    pub static ref BATCH_COMMIT_DURATION: Histogram = Histogram::with_opts(
        HistogramOpts::new("nearscan_batch_commit_duration_seconds", "Database batch commit latency")
            .buckets(LATENCY_BUCKETS.to_vec())
    ).unwrap();

    // ========================================================================
    // 3. ERROR COUNTERS
    // ========================================================================

    /// Block fetch failures
    /// Labels: kind (system, node)
    pub static ref FETCH_FAILURES: IntCounterVec = IntCounterVec::new(
        Opts::new("nearscan_fetch_failures_total", "Block fetch failures by error class"),
        &["kind"]
    ).unwrap();

    /// Dropped database batches
    pub static ref BATCH_FAILURES: IntCounter = IntCounter::new(
        "nearscan_batch_failures_total",
        "Database batch transactions dropped after an error"
    ).unwrap();

    // ========================================================================
    // 4. OPERATIONAL METRICS
    // ========================================================================

    /// Service start timestamp
    pub static ref SERVICE_START_TIMESTAMP: IntGauge = IntGauge::new(
        "nearscan_service_start_timestamp_seconds",
        "Unix timestamp when service started"
    ).unwrap();

    /// Telemetry reports received
    pub static ref TELEMETRY_REPORTS: IntCounter = IntCounter::new(
        "nearscan_telemetry_reports_total",
        "Node telemetry reports received over HTTP"
    ).unwrap();
}

/// Initialize metrics registry
///
/// Registers all metrics with the global registry. Call once at startup.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    REGISTRY.register(Box::new(BLOCKS_FETCHED.clone()))?;
    REGISTRY.register(Box::new(BLOCKS_SAVED.clone()))?;
    REGISTRY.register(Box::new(BATCHES_COMMITTED.clone()))?;
    REGISTRY.register(Box::new(CHAIN_TIP_HEIGHT.clone()))?;
    REGISTRY.register(Box::new(FETCHES_IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(SAVES_IN_FLIGHT.clone()))?;
    REGISTRY.register(Box::new(SYNC_PASSES.clone()))?;
    REGISTRY.register(Box::new(BATCH_COMMIT_DURATION.clone()))?;
    REGISTRY.register(Box::new(FETCH_FAILURES.clone()))?;
    REGISTRY.register(Box::new(BATCH_FAILURES.clone()))?;
    REGISTRY.register(Box::new(SERVICE_START_TIMESTAMP.clone()))?;
    REGISTRY.register(Box::new(TELEMETRY_REPORTS.clone()))?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs();
    SERVICE_START_TIMESTAMP.set(now as i64);

    Ok(())
}

/// Gather metrics in Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap_or(());
    String::from_utf8(buffer).unwrap_or_default()
}
