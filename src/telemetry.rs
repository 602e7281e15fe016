/// Telemetry Module - Structured Logging with Tracing
///
/// - RUST_LOG env filter
/// - JSON or pretty output, selected by NEARSCAN_LOG_FORMAT
/// - optional rolling log file via NEARSCAN_LOG_FILE / NEARSCAN_LOG_ROTATION
use tracing_appender::non_blocking::NonBlocking;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Logging configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter directive when RUST_LOG is unset at subscriber build time
    pub log_level: String,
    pub format: LogFormat,
    /// Log file path; `None` logs to the console only
    pub log_file: Option<String>,
    /// File rotation: "daily", "hourly" or "never"
    pub rotation: String,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self {
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            format: LogFormat::parse(&std::env::var("NEARSCAN_LOG_FORMAT").unwrap_or_default()),
            log_file: std::env::var("NEARSCAN_LOG_FILE").ok(),
            rotation: std::env::var("NEARSCAN_LOG_ROTATION")
                .unwrap_or_else(|_| "daily".to_string()),
        }
    }
}

/// Install the global tracing subscriber: one fmt layer in the configured
/// format, writing to a rolling file when one is configured and to the
/// console otherwise.
pub fn init_tracing(
    config: TelemetryConfig,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let writer = config
        .log_file
        .as_deref()
        .map(|path| rolling_writer(path, &config.rotation))
        .transpose()?;

    let layer = match config.format {
        LogFormat::Json => {
            let layer = fmt::layer()
                .json()
                .with_current_span(true)
                .with_span_list(true);
            match writer {
                Some(writer) => layer.with_writer(writer).boxed(),
                None => layer.boxed(),
            }
        }
        LogFormat::Pretty => {
            let layer = fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_file(true)
                .with_line_number(true);
            match writer {
                Some(writer) => layer.with_writer(writer).boxed(),
                None => layer.boxed(),
            }
        }
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .init();
    Ok(())
}

fn rolling_writer(
    path: &str,
    rotation: &str,
) -> Result<NonBlocking, Box<dyn std::error::Error + Send + Sync>> {
    let path = std::path::Path::new(path);
    let directory = path
        .parent()
        .ok_or("log file path has no parent directory")?;
    let prefix = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or("log file path has no file name")?;
    let appender = match rotation {
        "hourly" => rolling::hourly(directory, prefix),
        "never" => rolling::never(directory, prefix),
        _ => rolling::daily(directory, prefix),
    };
    let (writer, guard) = tracing_appender::non_blocking(appender);
    // The guard flushes on drop; the writer stays live for the whole process
    std::mem::forget(guard);
    Ok(writer)
}

/// Truncate a base58 hash for logging
///
/// Example: "9mdG2cRcV8Dsb1EoSjtya81NddjRB2stYCTVukZh7zzw" → "9mdG2cRcV8Dsb1Eo..."
pub fn truncate_hash(hash: &str, len: usize) -> String {
    if hash.len() <= len {
        hash.to_string()
    } else {
        format!("{}...", &hash[..len])
    }
}
