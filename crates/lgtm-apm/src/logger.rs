//! Trace-aware structured logger.
//!
//! Every record carries `service` and `env`, the ids of the span active at the
//! call site when there is one, and the caller's fields. Later sources win on
//! key collisions, so callers can override anything.
//!
//! Records go to a [`LogSink`] when one is configured. Otherwise each record is
//! written as a single JSON line: `error` to stderr, everything else to stdout.

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use opentelemetry::trace::{SpanId, TraceContextExt, TraceId};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::config::{EnvSettings, DEFAULT_ENVIRONMENT};
use crate::error::LogError;

/// Structured fields of one record.
pub type Fields = Map<String, Value>;

/// Service name used when the configured one is empty.
pub const FALLBACK_SERVICE_NAME: &str = "service";

static DEFAULT_LOGGER: ArcSwapOption<Logger> = ArcSwapOption::const_empty();

/// Severity of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    pub fn as_str(self) -> &'static str {
        match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Trace context
// ---------------------------------------------------------------------------

/// Identifiers of the span active at a log call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceIds {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl TraceIds {
    /// Ids of the span in `cx`, or `None` when it carries no valid span.
    pub fn from_context(cx: &opentelemetry::Context) -> Option<Self> {
        let span = cx.span();
        let span_context = span.span_context();
        span_context.is_valid().then(|| Self {
            trace_id: span_context.trace_id(),
            span_id: span_context.span_id(),
        })
    }
}

/// Read-only view of the span active for the calling task.
#[cfg_attr(test, mockall::automock)]
pub trait TraceContextSource: Send + Sync {
    fn current(&self) -> Option<TraceIds>;
}

/// Reads the current `tracing` span's OpenTelemetry context, falling back to
/// the attached [`opentelemetry::Context`].
#[derive(Debug, Clone, Copy, Default)]
pub struct AmbientSpan;

impl TraceContextSource for AmbientSpan {
    fn current(&self) -> Option<TraceIds> {
        TraceIds::from_context(&tracing::Span::current().context())
            .or_else(|| TraceIds::from_context(&opentelemetry::Context::current()))
    }
}

// ---------------------------------------------------------------------------
// Sinks and output channels
// ---------------------------------------------------------------------------

/// Receives fully formed records instead of stdout/stderr.
pub trait LogSink: Send + Sync {
    fn log(&self, level: Level, message: &str, fields: &Fields);
}

impl<F> LogSink for F
where
    F: Fn(Level, &str, &Fields) + Send + Sync,
{
    fn log(&self, level: Level, message: &str, fields: &Fields) {
        self(level, message, fields)
    }
}

/// Line-oriented output used when no sink is configured.
trait Channels: Send + Sync {
    /// Write one complete record, newline included, in a single call.
    fn write_record(&self, level: Level, line: &[u8]) -> io::Result<()>;
}

struct ProcessStdio;

impl Channels for ProcessStdio {
    fn write_record(&self, level: Level, line: &[u8]) -> io::Result<()> {
        if level == Level::Error {
            io::stderr().lock().write_all(line)
        } else {
            let mut out = io::stdout().lock();
            out.write_all(line)?;
            out.flush()
        }
    }
}

enum Destination {
    Sink(Arc<dyn LogSink>),
    Channels(Arc<dyn Channels>),
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings captured when a [`Logger`] is created.
#[derive(Clone, Default)]
pub struct LoggerConfig {
    pub service_name: String,
    /// Falls back to `OTEL_DEPLOYMENT_ENVIRONMENT`, `APP_ENV`, then `"development"`.
    pub environment: Option<String>,
    sink: Option<Arc<dyn LogSink>>,
    trace_source: Option<Arc<dyn TraceContextSource>>,
}

impl LoggerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Route records to `sink`; nothing is written to stdout/stderr.
    pub fn sink<F>(self, sink: F) -> Self
    where
        F: Fn(Level, &str, &Fields) + Send + Sync + 'static,
    {
        self.with_sink(Arc::new(sink))
    }

    pub fn with_sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Replace [`AmbientSpan`] as the source of trace ids.
    pub fn trace_source(mut self, source: Arc<dyn TraceContextSource>) -> Self {
        self.trace_source = Some(source);
        self
    }
}

impl fmt::Debug for LoggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerConfig")
            .field("service_name", &self.service_name)
            .field("environment", &self.environment)
            .field("sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Error argument
// ---------------------------------------------------------------------------

/// Second argument of [`Logger::error`].
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDetail {
    /// An error value, logged as `err` and `stack`.
    Error {
        message: String,
        stack: Option<String>,
    },
    /// Plain fields, merged like any other level's data.
    Data(Value),
}

impl ErrorDetail {
    /// Capture any error: its message plus the rendered cause chain.
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        Self::Error {
            message: err.to_string(),
            stack: Some(cause_report(err)),
        }
    }

    /// Plain fields from any serialisable value, as the other levels accept.
    pub fn data(data: impl Serialize) -> Result<Self, serde_json::Error> {
        serde_json::to_value(data).map(Self::Data)
    }

    fn into_fields(self) -> Fields {
        match self {
            ErrorDetail::Error { message, stack } => {
                let mut fields = Fields::new();
                fields.insert("err".into(), Value::String(message));
                if let Some(stack) = stack {
                    fields.insert("stack".into(), Value::String(stack));
                }
                fields
            }
            ErrorDetail::Data(Value::Object(fields)) => fields,
            ErrorDetail::Data(_) => Fields::new(),
        }
    }
}

impl From<&anyhow::Error> for ErrorDetail {
    fn from(err: &anyhow::Error) -> Self {
        // `{:?}` renders the context chain and, when captured, the backtrace.
        Self::Error {
            message: err.to_string(),
            stack: Some(format!("{err:?}")),
        }
    }
}

impl From<anyhow::Error> for ErrorDetail {
    fn from(err: anyhow::Error) -> Self {
        Self::from(&err)
    }
}

impl From<Value> for ErrorDetail {
    fn from(value: Value) -> Self {
        Self::Data(value)
    }
}

impl From<Fields> for ErrorDetail {
    fn from(fields: Fields) -> Self {
        Self::Data(Value::Object(fields))
    }
}

impl From<()> for ErrorDetail {
    fn from((): ()) -> Self {
        Self::Data(Value::Null)
    }
}

fn cause_report<E>(err: &E) -> String
where
    E: std::error::Error + ?Sized,
{
    let mut report = err.to_string();
    let mut source = err.source();
    if source.is_some() {
        report.push_str("\n\nCaused by:");
    }
    let mut depth = 0;
    while let Some(cause) = source {
        report.push_str(&format!("\n    {depth}: {cause}"));
        depth += 1;
        source = cause.source();
    }
    report
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Leveled logger that tags every record with the active trace.
///
/// Cheap to clone; all clones share the configuration captured at creation.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<Inner>,
}

struct Inner {
    service_name: String,
    environment: String,
    destination: Destination,
    trace_source: Arc<dyn TraceContextSource>,
}

/// Build a [`Logger`]. Never fails: an empty service name becomes `"service"`.
pub fn create_logger(config: LoggerConfig) -> Logger {
    Logger::new(config)
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_channels(config, Arc::new(ProcessStdio))
    }

    fn with_channels(config: LoggerConfig, channels: Arc<dyn Channels>) -> Self {
        let service_name = if config.service_name.is_empty() {
            FALLBACK_SERVICE_NAME.to_owned()
        } else {
            config.service_name
        };
        let environment = config
            .environment
            .filter(|env| !env.is_empty())
            .unwrap_or_else(ambient_environment);
        let destination = match config.sink {
            Some(sink) => Destination::Sink(sink),
            None => Destination::Channels(channels),
        };
        Self {
            inner: Arc::new(Inner {
                service_name,
                environment,
                destination,
                trace_source: config.trace_source.unwrap_or_else(|| Arc::new(AmbientSpan)),
            }),
        }
    }

    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    pub fn environment(&self) -> &str {
        &self.inner.environment
    }

    /// Alias for [`Logger::info`].
    pub fn log(&self, message: &str, data: impl Serialize) -> Result<(), LogError> {
        self.info(message, data)
    }

    pub fn debug(&self, message: &str, data: impl Serialize) -> Result<(), LogError> {
        self.emit(Level::Debug, message, to_fields(data)?)
    }

    pub fn info(&self, message: &str, data: impl Serialize) -> Result<(), LogError> {
        self.emit(Level::Info, message, to_fields(data)?)
    }

    pub fn warn(&self, message: &str, data: impl Serialize) -> Result<(), LogError> {
        self.emit(Level::Warn, message, to_fields(data)?)
    }

    /// Log at `error`. Error values become `{err, stack}`; anything else is
    /// merged as plain fields.
    ///
    /// Accepts `anyhow::Error`, JSON values, [`Fields`] and `()` directly. Wrap
    /// a `std::error::Error` with [`ErrorDetail::from_error`] and a typed
    /// struct with [`ErrorDetail::data`].
    pub fn error(&self, message: &str, detail: impl Into<ErrorDetail>) -> Result<(), LogError> {
        self.emit(Level::Error, message, detail.into().into_fields())
    }

    /// Emit one record with already structured fields.
    pub fn emit(&self, level: Level, message: &str, meta: Fields) -> Result<(), LogError> {
        let fields = self.record_fields(meta);
        match &self.inner.destination {
            Destination::Sink(sink) => {
                sink.log(level, message, &fields);
                Ok(())
            }
            Destination::Channels(channels) => {
                let line = render_line(level, message, fields)?;
                channels.write_record(level, &line)?;
                Ok(())
            }
        }
    }

    fn record_fields(&self, meta: Fields) -> Fields {
        let mut fields = Fields::new();
        fields.insert(
            "service".into(),
            Value::String(self.inner.service_name.clone()),
        );
        fields.insert("env".into(), Value::String(self.inner.environment.clone()));
        if let Some(ids) = self.inner.trace_source.current() {
            fields.insert("trace_id".into(), Value::String(ids.trace_id.to_string()));
            fields.insert("span_id".into(), Value::String(ids.span_id.to_string()));
        }
        fields.extend(meta);
        fields
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("service_name", &self.inner.service_name)
            .field("environment", &self.inner.environment)
            .finish_non_exhaustive()
    }
}

fn ambient_environment() -> String {
    EnvSettings::from_env()
        .ok()
        .and_then(|env| env.environment().map(str::to_owned))
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_owned())
}

/// Non-object data (including `()` and `null`) contributes no fields.
fn to_fields(data: impl Serialize) -> Result<Fields, serde_json::Error> {
    match serde_json::to_value(data)? {
        Value::Object(fields) => Ok(fields),
        _ => Ok(Fields::new()),
    }
}

fn render_line(level: Level, message: &str, fields: Fields) -> Result<Vec<u8>, serde_json::Error> {
    let mut record = Fields::new();
    record.insert("level".into(), Value::String(level.as_str().to_owned()));
    record.insert("message".into(), Value::String(message.to_owned()));
    record.extend(fields);
    let mut line = serde_json::to_vec(&record)?;
    line.push(b'\n');
    Ok(line)
}

// ---------------------------------------------------------------------------
// Process-wide default
// ---------------------------------------------------------------------------

/// Install the process-wide default logger.
pub fn set_logger(logger: Logger) {
    DEFAULT_LOGGER.store(Some(Arc::new(logger)));
}

/// The logger installed by [`set_logger`] or by bootstrap, if any.
pub fn get_logger() -> Option<Logger> {
    DEFAULT_LOGGER.load_full().map(|logger| (*logger).clone())
}
