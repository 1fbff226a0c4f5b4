//! Global `tracing` subscriber carrying the OpenTelemetry layers.
//!
//! The subscriber is installed once per process, but pipelines come and go:
//! the span layer exports through a [`SwappableTracer`] and the log bridge sits
//! behind a [`reload`] handle, so each pipeline attaches its own providers and
//! detaches them on shutdown.

use std::sync::{Arc, OnceLock};

use arc_swap::ArcSwap;
use opentelemetry::trace::{SpanBuilder, SpanId, TraceId, Tracer as _, TracerProvider as _};
use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_sdk::logs::{Logger, LoggerProvider};
use opentelemetry_sdk::trace::{Span, Tracer, TracerProvider};
use tracing::debug;
use tracing_opentelemetry::{OpenTelemetryLayer, OtelData, PreSampledTracer};
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Instrumentation scope of the tracer behind `tracing` spans.
pub(crate) const INSTRUMENTATION_NAME: &str = env!("CARGO_PKG_NAME");

type SpanLayer = OpenTelemetryLayer<Registry, SwappableTracer>;
type WithSpans = Layered<SpanLayer, Registry>;
type LogBridge = Option<OpenTelemetryTracingBridge<LoggerProvider, Logger>>;

static LAYERS: OnceLock<Option<TelemetryLayers>> = OnceLock::new();

/// Tracer whose target pipeline can be replaced after the layer is installed.
///
/// Between pipelines it delegates to a tracer whose provider has no
/// processors, so spans are created but never exported.
#[derive(Clone)]
pub(crate) struct SwappableTracer {
    current: Arc<ArcSwap<Tracer>>,
    idle: Arc<Tracer>,
    _idle_provider: TracerProvider,
}

impl SwappableTracer {
    fn new() -> Self {
        let idle_provider = TracerProvider::builder().build();
        let idle = Arc::new(idle_provider.tracer(INSTRUMENTATION_NAME));
        Self {
            current: Arc::new(ArcSwap::new(idle.clone())),
            idle,
            _idle_provider: idle_provider,
        }
    }

    fn swap(&self, tracer: Tracer) {
        self.current.store(Arc::new(tracer));
    }

    fn reset(&self) {
        self.current.store(self.idle.clone());
    }
}

impl opentelemetry::trace::Tracer for SwappableTracer {
    type Span = Span;

    fn build_with_context(&self, builder: SpanBuilder, parent_cx: &opentelemetry::Context) -> Span {
        self.current.load().build_with_context(builder, parent_cx)
    }
}

impl PreSampledTracer for SwappableTracer {
    fn sampled_context(&self, data: &mut OtelData) -> opentelemetry::Context {
        self.current.load().sampled_context(data)
    }

    fn new_trace_id(&self) -> TraceId {
        self.current.load().new_trace_id()
    }

    fn new_span_id(&self) -> SpanId {
        self.current.load().new_span_id()
    }
}

/// Handles into the installed subscriber.
pub(crate) struct TelemetryLayers {
    tracer: SwappableTracer,
    logs: reload::Handle<LogBridge, WithSpans>,
}

impl TelemetryLayers {
    /// Route `tracing` spans (and events, when `logs` is set) to a pipeline.
    pub(crate) fn attach(&self, tracer: Tracer, logs: Option<&LoggerProvider>) {
        self.tracer.swap(tracer);
        if let Err(e) = self.logs.reload(logs.map(OpenTelemetryTracingBridge::new)) {
            debug!(error = %e, "could not attach the OpenTelemetry log bridge");
        }
    }

    /// Stop exporting until the next [`attach`](Self::attach).
    pub(crate) fn detach(&self) {
        self.tracer.reset();
        if let Err(e) = self.logs.reload(None) {
            debug!(error = %e, "could not detach the OpenTelemetry log bridge");
        }
    }
}

/// Install the global subscriber on first use.
///
/// Layers: OpenTelemetry spans, OpenTelemetry log bridge, [`EnvFilter`]
/// (`RUST_LOG` wins over `log_level`) and JSON output on stdout. Returns
/// `None` when another subscriber was installed first.
pub(crate) fn install(log_level: &str) -> Option<&'static TelemetryLayers> {
    LAYERS
        .get_or_init(|| {
            let tracer = SwappableTracer::new();
            let spans: SpanLayer = tracing_opentelemetry::layer().with_tracer(tracer.clone());
            let (logs, logs_handle) = reload::Layer::<LogBridge, WithSpans>::new(None);
            let filter = EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(log_level));

            match tracing_subscriber::registry()
                .with(spans)
                .with(logs)
                .with(filter)
                .with(fmt::layer().json())
                .try_init()
            {
                Ok(()) => Some(TelemetryLayers {
                    tracer,
                    logs: logs_handle,
                }),
                Err(e) => {
                    debug!(
                        error = %e,
                        "tracing subscriber already installed; tracing spans will not be exported"
                    );
                    None
                }
            }
        })
        .as_ref()
}

/// Layers installed by an earlier [`install`], if any.
pub(crate) fn installed() -> Option<&'static TelemetryLayers> {
    LAYERS.get().and_then(Option::as_ref)
}
