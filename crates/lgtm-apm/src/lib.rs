//! One-call OpenTelemetry setup for LGTM stacks (Grafana Alloy / Tempo / Mimir / Loki).
//!
//! [`init_apm`] resolves options against `OTEL_*` environment variables,
//! exports traces, and optionally metrics and logs, over OTLP/HTTP with an
//! `X-Scope-OrgID` tenant header, and bridges `tracing` spans into the trace
//! pipeline. The returned [`ApmHandle`] flushes everything on shutdown.
//!
//! [`create_logger`] builds a JSON logger whose records carry the trace and
//! span id of the active span.
//!
//! ```no_run
//! use lgtm_apm::{init_apm, ApmConfig};
//! use serde_json::json;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let apm = init_apm(
//!     ApmConfig::new()
//!         .collector_url("http://alloy:4318")
//!         .service_name("checkout")
//!         .create_default_logger(true),
//! )
//! .await?;
//!
//! let logger = lgtm_apm::get_logger().expect("installed by init_apm");
//! logger.info("order placed", json!({ "order_id": 42 }))?;
//!
//! apm.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod exporters;
pub mod logger;
mod subscriber;

pub use bootstrap::{init_apm, init_apm_with, init_from_env, shutdown, ApmHandle, Capabilities};
pub use config::{ApmConfig, EnvSettings, ResolvedConfig};
pub use error::{ApmError, LogError};
pub use exporters::{OtlpHttp, SignalExporters};
pub use logger::{
    create_logger, get_logger, set_logger, AmbientSpan, ErrorDetail, Fields, Level, LogSink,
    Logger, LoggerConfig, TraceContextSource, TraceIds,
};
