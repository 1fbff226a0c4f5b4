//! Pipeline startup and shutdown.
//!
//! Startup sequence:
//! 1. Resolve [`ApmConfig`] against the environment.
//! 2. Shut down the previously started pipeline, if any.
//! 3. Install the W3C propagator and, once per process, the `tracing` subscriber.
//! 4. Build the trace provider (mandatory), then metrics and logs (optional).
//! 5. Install the default logger when requested.
//! 6. Register the pipeline as the active one and hook SIGTERM.
//!
//! # Lifecycle invariants
//!
//! - At most one pipeline is active per process.
//! - Shutdown is idempotent: providers are taken out exactly once, and every
//!   caller waits for that one flush to finish.
//! - Globals and `tracing` layers are only reset while no other pipeline is active.
//! - A failing metrics or logs exporter disables that signal and nothing else.

use std::sync::{Arc, Mutex, Once, PoisonError};

use opentelemetry::global;
use opentelemetry::metrics::noop::NoopMeterProvider;
use opentelemetry::trace::noop::NoopTracerProvider;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::logs::LoggerProvider;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::{ApmConfig, EnvSettings, ResolvedConfig};
use crate::endpoint::Signal;
use crate::error::ApmError;
use crate::exporters::{OtlpHttp, SignalExporters};
use crate::logger::{self, LoggerConfig};
use crate::subscriber::{self, INSTRUMENTATION_NAME};

static ACTIVE: Mutex<Option<Arc<Pipeline>>> = Mutex::new(None);
static TERMINATION_HOOK: Once = Once::new();

/// Signals exported by a running pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    pub traces: bool,
    pub metrics: bool,
    pub logs: bool,
}

struct Providers {
    tracer: TracerProvider,
    meter: Option<SdkMeterProvider>,
    logger: Option<LoggerProvider>,
}

impl Providers {
    /// Flush and release every provider. Blocks until batch exports finish.
    fn shutdown(self) -> Result<(), String> {
        let mut failures = Vec::new();

        if let Some(meter) = self.meter {
            if let Err(e) = meter.shutdown() {
                failures.push(format!("metrics: {e}"));
            }
        }
        if let Some(logger) = self.logger {
            failures.extend(
                logger
                    .force_flush()
                    .into_iter()
                    .filter_map(Result::err)
                    .map(|e| format!("logs: {e}")),
            );
            drop(logger);
        }
        failures.extend(
            self.tracer
                .force_flush()
                .into_iter()
                .filter_map(Result::err)
                .map(|e| format!("traces: {e}")),
        );
        drop(self.tracer);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(failures.join("; "))
        }
    }
}

struct Pipeline {
    resolved: ResolvedConfig,
    capabilities: Capabilities,
    providers: Mutex<Option<Providers>>,
    closed: OnceCell<Result<(), String>>,
}

impl Pipeline {
    fn new(resolved: ResolvedConfig, capabilities: Capabilities, providers: Providers) -> Self {
        Self {
            resolved,
            capabilities,
            providers: Mutex::new(Some(providers)),
            closed: OnceCell::new(),
        }
    }

    /// Concurrent callers share one flush and see the same outcome.
    async fn close(&self) -> Result<(), ApmError> {
        self.closed
            .get_or_init(|| self.flush_and_release())
            .await
            .clone()
            .map_err(ApmError::Shutdown)
    }

    async fn flush_and_release(&self) -> Result<(), String> {
        let Some(providers) = self
            .providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        while_inactive(|| {
            if let Some(layers) = subscriber::installed() {
                layers.detach();
            }
        });

        let flushed = tokio::task::spawn_blocking(move || providers.shutdown())
            .await
            .unwrap_or_else(|e| Err(format!("shutdown task: {e}")));

        let released = while_inactive(|| {
            global::set_meter_provider(NoopMeterProvider::new());
            global::set_tracer_provider(NoopTracerProvider::new())
        });
        if let Some(released) = released {
            // The global held the last reference; dropping it stops the batch processor.
            if let Err(e) = tokio::task::spawn_blocking(move || drop(released)).await {
                debug!(error = %e, "releasing the global tracer provider failed");
            }
        }
        flushed
    }
}

/// Run `f` under the active-pipeline lock if no pipeline is active.
fn while_inactive<T>(f: impl FnOnce() -> T) -> Option<T> {
    let active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
    active.is_none().then(f)
}

/// Handle to a started pipeline.
#[derive(Clone)]
pub struct ApmHandle {
    pipeline: Arc<Pipeline>,
}

impl ApmHandle {
    pub fn capabilities(&self) -> Capabilities {
        self.pipeline.capabilities
    }

    /// Settings the pipeline was started with.
    pub fn resolved(&self) -> &ResolvedConfig {
        &self.pipeline.resolved
    }

    /// Flush in-flight exports and stop the pipeline.
    ///
    /// Safe to call any number of times; only the first call does work.
    ///
    /// # Errors
    ///
    /// Returns an error if a provider fails to flush or shut down.
    pub async fn shutdown(&self) -> Result<(), ApmError> {
        {
            let mut active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner);
            if active
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, &self.pipeline))
            {
                *active = None;
            }
        }
        self.pipeline.close().await
    }
}

impl std::fmt::Debug for ApmHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApmHandle")
            .field("service_name", &self.pipeline.resolved.service_name)
            .field("collector_url", &self.pipeline.resolved.collector_url)
            .field("capabilities", &self.pipeline.capabilities)
            .finish()
    }
}

/// Start exporting traces (and optionally metrics and logs) over OTLP/HTTP.
///
/// Must be called from within a Tokio runtime.
///
/// # Errors
///
/// Returns [`ApmError::TraceExporter`] if the span exporter cannot be built.
pub async fn init_apm(config: ApmConfig) -> Result<ApmHandle, ApmError> {
    init_apm_with(config, Arc::new(OtlpHttp)).await
}

/// [`init_apm`] with every option taken from the environment.
pub async fn init_from_env() -> Result<ApmHandle, ApmError> {
    init_apm(ApmConfig::default()).await
}

/// [`init_apm`] with caller-supplied provider construction.
pub async fn init_apm_with(
    config: ApmConfig,
    exporters: Arc<dyn SignalExporters>,
) -> Result<ApmHandle, ApmError> {
    let env = EnvSettings::from_env().unwrap_or_else(|e| {
        warn!(error = %e, "ignoring unreadable telemetry environment");
        EnvSettings::default()
    });
    let resolved = config.resolve(&env);

    let previous = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(previous) = previous {
        if let Err(e) = previous.close().await {
            debug!(error = %e, "previous telemetry pipeline did not shut down cleanly");
        }
    }

    global::set_text_map_propagator(TraceContextPropagator::new());
    let layers = if config.install_subscriber {
        subscriber::install(&resolved.log_level)
    } else {
        None
    };
    let resource = resolved.resource();

    let tracer_provider =
        exporters.tracer_provider(&resolved.target(Signal::Traces), resource.clone())?;
    global::set_tracer_provider(tracer_provider.clone());

    let meter_provider = if resolved.enable_metrics {
        match exporters.meter_provider(&resolved.target(Signal::Metrics), resource.clone()) {
            Ok(provider) => {
                global::set_meter_provider(provider.clone());
                Some(provider)
            }
            Err(e) => {
                warn!(error = %e, "metrics exporter unavailable; continuing without metrics");
                None
            }
        }
    } else {
        None
    };

    let logger_provider = if resolved.enable_logs {
        match exporters.logger_provider(&resolved.target(Signal::Logs), resource) {
            Ok(provider) => Some(provider),
            Err(e) => {
                warn!(error = %e, "logs exporter unavailable; continuing without logs");
                None
            }
        }
    } else {
        None
    };

    if let Some(layers) = layers {
        layers.attach(
            tracer_provider.tracer(INSTRUMENTATION_NAME),
            logger_provider.as_ref(),
        );
    }

    if resolved.create_default_logger {
        logger::set_logger(logger::create_logger(
            LoggerConfig::new(resolved.service_name.clone())
                .environment(resolved.environment.clone()),
        ));
    }

    let capabilities = Capabilities {
        traces: true,
        metrics: meter_provider.is_some(),
        logs: logger_provider.is_some(),
    };
    let pipeline = Arc::new(Pipeline::new(
        resolved,
        capabilities,
        Providers {
            tracer: tracer_provider,
            meter: meter_provider,
            logger: logger_provider,
        },
    ));
    *ACTIVE.lock().unwrap_or_else(PoisonError::into_inner) = Some(pipeline.clone());

    if config.handle_termination {
        install_termination_hook();
    }

    info!(
        service = %pipeline.resolved.service_name,
        collector = %pipeline.resolved.collector_url,
        metrics = capabilities.metrics,
        logs = capabilities.logs,
        "telemetry pipeline started"
    );
    Ok(ApmHandle { pipeline })
}

/// Shut down the active pipeline. No-op when none is running.
///
/// # Errors
///
/// Returns an error if a provider fails to flush or shut down.
pub async fn shutdown() -> Result<(), ApmError> {
    let active = ACTIVE.lock().unwrap_or_else(PoisonError::into_inner).take();
    match active {
        Some(pipeline) => pipeline.close().await,
        None => Ok(()),
    }
}

/// On SIGTERM: shut down the active pipeline, then exit with status 0.
fn install_termination_hook() {
    TERMINATION_HOOK.call_once(|| {
        #[cfg(unix)]
        tokio::spawn(async {
            use tokio::signal::unix::{signal, SignalKind};

            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "could not install SIGTERM handler");
                    return;
                }
            };
            if terminate.recv().await.is_some() {
                info!("SIGTERM received; flushing telemetry");
                if let Err(e) = shutdown().await {
                    warn!(error = %e, "telemetry shutdown failed");
                }
                std::process::exit(0);
            }
        });
    });
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use opentelemetry::metrics::MetricsError;
    use opentelemetry::trace::{TraceError, Tracer as _};
    use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
    use opentelemetry_sdk::runtime;
    use opentelemetry_sdk::testing::trace::InMemorySpanExporter;

    use super::*;
    use crate::exporters::MockSignalExporters;

    // Pipelines are process-wide; lifecycle tests must not interleave.
    static SERIAL: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

    fn quiet_config() -> ApmConfig {
        ApmConfig::new()
            .collector_url("http://collector:4318/")
            .service_name("checkout")
            .environment("test")
            .org_id("acme")
            .install_subscriber(false)
            .handle_termination(false)
    }

    fn recording_tracer_provider() -> (InMemorySpanExporter, TracerProvider) {
        let exporter = InMemorySpanExporter::default();
        let provider = TracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (exporter, provider)
    }

    /// Takes a while to export each batch, then raises `exported`.
    #[derive(Debug)]
    struct SlowExporter {
        exported: Arc<AtomicBool>,
    }

    impl SpanExporter for SlowExporter {
        fn export(
            &mut self,
            _batch: Vec<SpanData>,
        ) -> Pin<Box<dyn Future<Output = ExportResult> + Send + 'static>> {
            let exported = self.exported.clone();
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                exported.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    fn slow_tracer_provider() -> (Arc<AtomicBool>, TracerProvider) {
        let exported = Arc::new(AtomicBool::new(false));
        let provider = TracerProvider::builder()
            .with_batch_exporter(
                SlowExporter {
                    exported: exported.clone(),
                },
                runtime::Tokio,
            )
            .build();
        (exported, provider)
    }

    #[tokio::test]
    async fn trace_target_is_normalised_with_tenant_header() {
        let _serial = SERIAL.lock().await;
        let (_, provider) = recording_tracer_provider();
        let mut exporters = MockSignalExporters::new();
        exporters
            .expect_tracer_provider()
            .withf(|target, _| {
                target.endpoint == "http://collector:4318/v1/traces"
                    && target.headers.get("X-Scope-OrgID").map(String::as_str) == Some("acme")
            })
            .times(1)
            .return_once(move |_, _| Ok(provider));
        exporters
            .expect_meter_provider()
            .withf(|target, _| target.endpoint == "http://collector:4318/v1/metrics")
            .times(1)
            .returning(|_, _| Ok(SdkMeterProvider::builder().build()));
        exporters.expect_logger_provider().never();

        let handle = init_apm_with(quiet_config(), Arc::new(exporters)).await.unwrap();
        assert_eq!(
            handle.capabilities(),
            Capabilities {
                traces: true,
                metrics: true,
                logs: false
            }
        );
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn metrics_failure_degrades_without_failing_init() {
        let _serial = SERIAL.lock().await;
        let (_, provider) = recording_tracer_provider();
        let mut exporters = MockSignalExporters::new();
        exporters
            .expect_tracer_provider()
            .return_once(move |_, _| Ok(provider));
        exporters
            .expect_meter_provider()
            .returning(|_, _| Err(MetricsError::Other("exporter not available".into())));
        exporters
            .expect_logger_provider()
            .times(1)
            .returning(|_, _| Ok(LoggerProvider::builder().build()));

        let handle = init_apm_with(quiet_config().enable_logs(true), Arc::new(exporters))
            .await
            .unwrap();
        assert!(handle.capabilities().traces);
        assert!(!handle.capabilities().metrics);
        assert!(handle.capabilities().logs);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn metrics_can_be_switched_off() {
        let _serial = SERIAL.lock().await;
        let (_, provider) = recording_tracer_provider();
        let mut exporters = MockSignalExporters::new();
        exporters
            .expect_tracer_provider()
            .return_once(move |_, _| Ok(provider));
        exporters.expect_meter_provider().never();

        let handle = init_apm_with(quiet_config().enable_metrics(false), Arc::new(exporters))
            .await
            .unwrap();
        assert!(!handle.capabilities().metrics);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn trace_exporter_failure_is_reported() {
        let _serial = SERIAL.lock().await;
        let mut exporters = MockSignalExporters::new();
        exporters
            .expect_tracer_provider()
            .returning(|_, _| Err(TraceError::from("invalid collector url")));
        exporters.expect_meter_provider().never();

        let err = init_apm_with(quiet_config(), Arc::new(exporters))
            .await
            .unwrap_err();
        assert!(matches!(err, ApmError::TraceExporter(_)));
        assert!(shutdown().await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_twice_is_harmless() {
        let _serial = SERIAL.lock().await;
        let (spans, provider) = recording_tracer_provider();
        let mut exporters = MockSignalExporters::new();
        exporters
            .expect_tracer_provider()
            .times(1)
            .return_once(move |_, _| Ok(provider));

        let handle = init_apm_with(quiet_config().enable_metrics(false), Arc::new(exporters))
            .await
            .unwrap();
        global::tracer("shutdown-test").in_span("work", |_| {});
        assert_eq!(spans.get_finished_spans().unwrap().len(), 1);

        handle.shutdown().await.unwrap();
        handle.shutdown().await.unwrap();
        assert!(shutdown().await.is_ok());
        assert_eq!(spans.get_finished_spans().unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_shutdowns_all_wait_for_the_flush() {
        let _serial = SERIAL.lock().await;
        let (exported, provider) = slow_tracer_provider();
        let mut exporters = MockSignalExporters::new();
        exporters
            .expect_tracer_provider()
            .return_once(move |_, _| Ok(provider));

        let handle = init_apm_with(quiet_config().enable_metrics(false), Arc::new(exporters))
            .await
            .unwrap();
        global::tracer("flush-test").in_span("work", |_| {});

        let first = tokio::spawn({
            let handle = handle.clone();
            async move { handle.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown().await.unwrap();
        assert!(exported.load(Ordering::SeqCst));
        first.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn slow_shutdown_leaves_a_newer_pipeline_in_place() {
        let _serial = SERIAL.lock().await;
        let (_, old_provider) = slow_tracer_provider();
        let (new_spans, new_provider) = recording_tracer_provider();
        let mut old = MockSignalExporters::new();
        old.expect_tracer_provider()
            .return_once(move |_, _| Ok(old_provider));
        let mut new = MockSignalExporters::new();
        new.expect_tracer_provider()
            .return_once(move |_, _| Ok(new_provider));

        let config = quiet_config().enable_metrics(false);
        let old_handle = init_apm_with(config.clone(), Arc::new(old)).await.unwrap();
        global::tracer("race-test").in_span("old work", |_| {});

        let closing = tokio::spawn({
            let handle = old_handle.clone();
            async move { handle.shutdown().await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let new_handle = init_apm_with(config, Arc::new(new)).await.unwrap();
        closing.await.unwrap().unwrap();

        global::tracer("race-test").in_span("new work", |_| {});
        let finished = new_spans.get_finished_spans().unwrap();
        assert_eq!(finished.len(), 1);
        assert_eq!(finished[0].name, "new work");
        new_handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn new_pipeline_replaces_the_active_one() {
        let _serial = SERIAL.lock().await;
        let (_, first_provider) = recording_tracer_provider();
        let (second_spans, second_provider) = recording_tracer_provider();
        let mut first = MockSignalExporters::new();
        first
            .expect_tracer_provider()
            .return_once(move |_, _| Ok(first_provider));
        let mut second = MockSignalExporters::new();
        second
            .expect_tracer_provider()
            .return_once(move |_, _| Ok(second_provider));

        let config = quiet_config().enable_metrics(false);
        let first_handle = init_apm_with(config.clone(), Arc::new(first)).await.unwrap();
        let second_handle = init_apm_with(config, Arc::new(second)).await.unwrap();

        // The first pipeline was closed by the second init.
        first_handle.shutdown().await.unwrap();
        global::tracer("replace-test").in_span("work", |_| {});
        assert_eq!(second_spans.get_finished_spans().unwrap().len(), 1);

        shutdown().await.unwrap();
        second_handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn default_logger_is_installed_on_request() {
        let _serial = SERIAL.lock().await;
        let (_, provider) = recording_tracer_provider();
        let mut exporters = MockSignalExporters::new();
        exporters
            .expect_tracer_provider()
            .return_once(move |_, _| Ok(provider));

        let handle = init_apm_with(
            quiet_config()
                .enable_metrics(false)
                .create_default_logger(true),
            Arc::new(exporters),
        )
        .await
        .unwrap();

        let logger = logger::get_logger().expect("default logger");
        assert_eq!(logger.service_name(), "checkout");
        assert_eq!(logger.environment(), "test");
        handle.shutdown().await.unwrap();
    }
}
