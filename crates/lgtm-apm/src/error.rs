//! Error types for the bootstrapper and the logger.
//!
//! Misconfiguration never shows up here: missing options fall back to
//! defaults, and a metrics or logs exporter that cannot be built only disables
//! that signal. What remains is the trace pipeline failing to start, shutdown
//! failures, and log records that cannot be encoded or written.

use thiserror::Error;

/// Errors produced while starting or stopping the telemetry pipeline.
#[derive(Debug, Error)]
pub enum ApmError {
    /// The OTLP span exporter could not be constructed.
    #[error("trace exporter unavailable: {0}")]
    TraceExporter(#[from] opentelemetry::trace::TraceError),

    /// A provider failed to flush, or the blocking shutdown task panicked.
    ///
    /// Carries text so that every caller waiting on the same shutdown gets it.
    #[error("telemetry shutdown failed: {0}")]
    Shutdown(String),
}

/// Errors produced by [`Logger`](crate::Logger) emission.
#[derive(Debug, Error)]
pub enum LogError {
    /// Caller data could not be encoded as JSON.
    #[error("failed to serialise log record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The output channel rejected the record.
    #[error("failed to write log record: {0}")]
    Write(#[from] std::io::Error),
}
