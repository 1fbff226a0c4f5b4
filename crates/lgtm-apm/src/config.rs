//! Bootstrap configuration: explicit options, environment fallbacks, defaults.
//!
//! Every option resolves in the same order: a value set on [`ApmConfig`], then
//! the matching environment variable, then a hardcoded default. Nothing here
//! fails; missing input is always replaced by a default.

use std::collections::HashMap;

use anyhow::{Context, Result};
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource::{
    DEPLOYMENT_ENVIRONMENT, SERVICE_NAME, SERVICE_VERSION,
};
use serde::Deserialize;

use crate::endpoint::{self, ExportTarget, Signal};

pub const DEFAULT_COLLECTOR_URL: &str = "http://localhost:4318";
pub const DEFAULT_SERVICE_NAME: &str = "unknown-service";
pub const DEFAULT_SERVICE_VERSION: &str = "1.0.0";
pub const DEFAULT_ENVIRONMENT: &str = "development";
pub const DEFAULT_ORG_ID: &str = "tenant1";
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variables consulted during resolution.
///
/// Loaded through [`config::Environment`]; variable names are matched
/// case-insensitively and empty values count as unset.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EnvSettings {
    pub otel_exporter_otlp_endpoint: Option<String>,
    pub otel_service_name: Option<String>,
    pub otel_service_version: Option<String>,
    pub otel_deployment_environment: Option<String>,
    pub otel_org_id: Option<String>,
    pub otel_metrics_enabled: Option<String>,
    /// Deployment environment when `OTEL_DEPLOYMENT_ENVIRONMENT` is unset.
    pub app_env: Option<String>,
    /// Set by `cargo run`; used when no service name is configured.
    pub cargo_pkg_name: Option<String>,
    /// Set by `cargo run`; used when no service version is configured.
    pub cargo_pkg_version: Option<String>,
    pub log_level: Option<String>,
}

impl EnvSettings {
    /// Read the process environment. Variables whose name or value is not
    /// valid UTF-8 are skipped.
    pub fn from_env() -> Result<Self> {
        Self::from_map(
            std::env::vars_os()
                .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?))),
        )
    }

    /// Read from a fixed set of variables instead of the process environment.
    pub fn from_map<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::load(config::Environment::default().source(Some(map)))
    }

    fn load(source: config::Environment) -> Result<Self> {
        config::Config::builder()
            .add_source(source.ignore_empty(true))
            .build()
            .context("failed to read telemetry settings from environment")?
            .try_deserialize()
            .context("failed to deserialise telemetry settings")
    }

    /// Deployment environment signalled by the environment, if any.
    pub fn environment(&self) -> Option<&str> {
        self.otel_deployment_environment
            .as_deref()
            .or(self.app_env.as_deref())
    }

    /// `OTEL_METRICS_ENABLED`: anything but the literal `"false"` enables metrics.
    pub fn metrics_enabled(&self) -> bool {
        self.otel_metrics_enabled.as_deref() != Some("false")
    }
}

/// Options accepted by [`init_apm`](crate::init_apm).
///
/// Unset options are filled from the environment or defaults by
/// [`ApmConfig::resolve`].
#[derive(Debug, Clone)]
pub struct ApmConfig {
    pub collector_url: Option<String>,
    pub service_name: Option<String>,
    pub service_version: Option<String>,
    pub environment: Option<String>,
    /// Tenant id sent as `X-Scope-OrgID`. An empty string suppresses the header.
    pub org_id: Option<String>,
    pub additional_headers: HashMap<String, String>,
    pub enable_metrics: Option<bool>,
    pub enable_logs: bool,
    /// Install a process-wide [`Logger`](crate::Logger) reachable through
    /// [`get_logger`](crate::get_logger).
    pub create_default_logger: bool,
    /// Extra resource attributes; these win over the service attributes.
    pub attributes: Vec<KeyValue>,
    pub log_level: Option<String>,
    /// Install the global `tracing` subscriber carrying the OpenTelemetry layers.
    pub install_subscriber: bool,
    /// Shut down and exit on SIGTERM.
    pub handle_termination: bool,
}

impl Default for ApmConfig {
    fn default() -> Self {
        Self {
            collector_url: None,
            service_name: None,
            service_version: None,
            environment: None,
            org_id: None,
            additional_headers: HashMap::new(),
            enable_metrics: None,
            enable_logs: false,
            create_default_logger: false,
            attributes: Vec::new(),
            log_level: None,
            install_subscriber: true,
            handle_termination: true,
        }
    }
}

impl ApmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn collector_url(mut self, url: impl Into<String>) -> Self {
        self.collector_url = Some(url.into());
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    pub fn org_id(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.additional_headers.insert(name.into(), value.into());
        self
    }

    pub fn enable_metrics(mut self, enabled: bool) -> Self {
        self.enable_metrics = Some(enabled);
        self
    }

    pub fn enable_logs(mut self, enabled: bool) -> Self {
        self.enable_logs = enabled;
        self
    }

    pub fn create_default_logger(mut self, enabled: bool) -> Self {
        self.create_default_logger = enabled;
        self
    }

    pub fn attribute(mut self, attribute: KeyValue) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = Some(level.into());
        self
    }

    pub fn install_subscriber(mut self, enabled: bool) -> Self {
        self.install_subscriber = enabled;
        self
    }

    pub fn handle_termination(mut self, enabled: bool) -> Self {
        self.handle_termination = enabled;
        self
    }

    /// Fill every unset option from `env`, then from the defaults.
    pub fn resolve(&self, env: &EnvSettings) -> ResolvedConfig {
        let collector_url = pick(
            &self.collector_url,
            [env.otel_exporter_otlp_endpoint.as_deref()],
            DEFAULT_COLLECTOR_URL,
        );
        let service_name = pick(
            &self.service_name,
            [env.otel_service_name.as_deref(), env.cargo_pkg_name.as_deref()],
            DEFAULT_SERVICE_NAME,
        );
        let service_version = pick(
            &self.service_version,
            [env.otel_service_version.as_deref(), env.cargo_pkg_version.as_deref()],
            DEFAULT_SERVICE_VERSION,
        );
        let environment = pick(&self.environment, [env.environment()], DEFAULT_ENVIRONMENT);
        let org_id = pick(&self.org_id, [env.otel_org_id.as_deref()], DEFAULT_ORG_ID);
        let log_level = pick(&self.log_level, [env.log_level.as_deref()], DEFAULT_LOG_LEVEL);

        ResolvedConfig {
            collector_url: endpoint::base_url(&collector_url).to_owned(),
            headers: endpoint::tenant_headers(&self.additional_headers, &org_id),
            service_name,
            service_version,
            environment,
            org_id,
            enable_metrics: self.enable_metrics.unwrap_or_else(|| env.metrics_enabled()),
            enable_logs: self.enable_logs,
            create_default_logger: self.create_default_logger,
            attributes: self.attributes.clone(),
            log_level,
        }
    }
}

fn pick<const N: usize>(explicit: &Option<String>, fallbacks: [Option<&str>; N], default: &str) -> String {
    explicit
        .as_deref()
        .or_else(|| fallbacks.into_iter().flatten().next())
        .unwrap_or(default)
        .to_owned()
}

/// Fully resolved bootstrap settings.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Collector base URL with one trailing slash removed.
    pub collector_url: String,
    pub service_name: String,
    pub service_version: String,
    pub environment: String,
    pub org_id: String,
    /// Export headers, tenant header included.
    pub headers: HashMap<String, String>,
    pub enable_metrics: bool,
    pub enable_logs: bool,
    pub create_default_logger: bool,
    pub attributes: Vec<KeyValue>,
    pub log_level: String,
}

impl ResolvedConfig {
    /// Export target for one signal.
    pub fn target(&self, signal: Signal) -> ExportTarget {
        ExportTarget::new(&self.collector_url, signal, self.headers.clone())
    }

    /// SDK default resource overlaid with the service identity and caller attributes.
    pub fn resource(&self) -> Resource {
        let mut attributes = vec![
            KeyValue::new(SERVICE_NAME, self.service_name.clone()),
            KeyValue::new(SERVICE_VERSION, self.service_version.clone()),
            KeyValue::new(DEPLOYMENT_ENVIRONMENT, self.environment.clone()),
        ];
        attributes.extend(self.attributes.iter().cloned());
        Resource::default().merge(&Resource::new(attributes))
    }
}
