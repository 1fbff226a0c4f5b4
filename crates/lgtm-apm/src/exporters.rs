//! Per-signal provider construction.
//!
//! [`SignalExporters`] is the seam between bootstrap and the OpenTelemetry SDK.
//! Bootstrap treats a failing metrics or logs constructor as "signal
//! unavailable"; only the trace provider is mandatory.

use std::time::Duration;

use opentelemetry::logs::LogError;
use opentelemetry::metrics::MetricsError;
use opentelemetry::trace::TraceError;
use opentelemetry_otlp::{HttpExporterBuilder, WithExportConfig};
use opentelemetry_sdk::logs::{self as sdklogs, LoggerProvider};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::trace::{self as sdktrace, TracerProvider};
use opentelemetry_sdk::{runtime, Resource};

use crate::endpoint::ExportTarget;

/// How often the periodic reader pushes metrics.
pub const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Builds the SDK provider for each signal.
#[cfg_attr(test, mockall::automock)]
pub trait SignalExporters: Send + Sync {
    fn tracer_provider(
        &self,
        target: &ExportTarget,
        resource: Resource,
    ) -> Result<TracerProvider, TraceError>;

    fn meter_provider(
        &self,
        target: &ExportTarget,
        resource: Resource,
    ) -> Result<SdkMeterProvider, MetricsError>;

    fn logger_provider(
        &self,
        target: &ExportTarget,
        resource: Resource,
    ) -> Result<LoggerProvider, LogError>;
}

/// OTLP over HTTP with protobuf payloads, batched on the Tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct OtlpHttp;

impl OtlpHttp {
    fn exporter(target: &ExportTarget) -> HttpExporterBuilder {
        opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(target.endpoint.clone())
            .with_headers(target.headers.clone())
    }
}

impl SignalExporters for OtlpHttp {
    fn tracer_provider(
        &self,
        target: &ExportTarget,
        resource: Resource,
    ) -> Result<TracerProvider, TraceError> {
        let exporter = Self::exporter(target).build_span_exporter()?;
        Ok(TracerProvider::builder()
            .with_batch_exporter(exporter, runtime::Tokio)
            .with_config(sdktrace::Config::default().with_resource(resource))
            .build())
    }

    fn meter_provider(
        &self,
        target: &ExportTarget,
        resource: Resource,
    ) -> Result<SdkMeterProvider, MetricsError> {
        opentelemetry_otlp::new_pipeline()
            .metrics(runtime::Tokio)
            .with_exporter(Self::exporter(target))
            .with_resource(resource)
            .with_period(METRIC_EXPORT_INTERVAL)
            .build()
    }

    fn logger_provider(
        &self,
        target: &ExportTarget,
        resource: Resource,
    ) -> Result<LoggerProvider, LogError> {
        opentelemetry_otlp::new_pipeline()
            .logging()
            .with_log_config(sdklogs::Config::default().with_resource(resource))
            .with_exporter(Self::exporter(target))
            .install_batch(runtime::Tokio)
    }
}
