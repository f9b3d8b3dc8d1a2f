//! Structured logging for the distribution subsystem
//!
//! This module installs a `tracing` subscriber and provides helpers that emit
//! one structured span per rehash step.

use crate::config::{LogFormat, LogLevel, LoggingConfig};
use std::sync::Once;
use std::time::Duration;
use tracing::Level;
use tracing_subscriber::fmt::{format::FmtSpan, time::UtcTime};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Initialize the logging system based on configuration.
///
/// Only the first call installs a subscriber; later calls are no-ops. The
/// `RUST_LOG` environment variable overrides the configured level.
pub fn init_logging(config: &LoggingConfig) {
    INIT.call_once(|| {
        if !config.console {
            return;
        }
        let level = convert_log_level(config.level);
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(config.structured)
            .with_thread_ids(true)
            .with_thread_names(true)
            .with_span_events(FmtSpan::CLOSE)
            .with_timer(UtcTime::rfc_3339());

        let installed = match config.format {
            LogFormat::Json => builder.json().try_init(),
            LogFormat::Pretty => builder.pretty().try_init(),
            LogFormat::Simple => builder.try_init(),
        };

        if installed.is_ok() {
            tracing::info!("Logging system initialized with level: {:?}", config.level);
        }
    });
}

/// Convert our log level to tracing level
fn convert_log_level(level: LogLevel) -> Level {
    match level {
        LogLevel::Error => Level::ERROR,
        LogLevel::Warn => Level::WARN,
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
        LogLevel::Trace => Level::TRACE,
    }
}

/// Log a rehash step with structured fields
pub fn log_rehash_operation(
    operation: &str,
    node: &str,
    success: bool,
    duration: Duration,
    additional_fields: Option<Vec<(&str, String)>>,
) {
    let details = additional_fields
        .unwrap_or_default()
        .into_iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(" ");

    let span = tracing::info_span!(
        "rehash_operation",
        operation = operation,
        node = node,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    if success {
        tracing::info!(details = %details, "Rehash operation completed successfully");
    } else {
        tracing::error!(details = %details, "Rehash operation failed");
    }
}

/// Log a state transfer exchange with one peer
pub fn log_state_transfer(
    direction: &str,
    local: &str,
    peer: &str,
    keys: usize,
    success: bool,
    duration: Duration,
) {
    let span = tracing::debug_span!(
        "state_transfer",
        direction = direction,
        local = local,
        peer = peer,
        keys = keys as u64,
        success = success,
        duration_ms = duration.as_millis() as u64,
    );
    let _enter = span.enter();

    if success {
        tracing::debug!("State transfer completed");
    } else {
        tracing::warn!("State transfer failed");
    }
}
