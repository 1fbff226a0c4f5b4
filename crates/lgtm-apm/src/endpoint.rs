//! Collector URL normalisation and tenant headers.
//!
//! The configured collector URL is a base such as `http://alloy:4318`. Each
//! signal is exported to `<base>/v1/<signal>` unless the base already ends with
//! that signal's path.

use std::collections::HashMap;

/// Header carrying the tenant id for multi-tenant Grafana backends.
pub const TENANT_HEADER: &str = "X-Scope-OrgID";

/// Telemetry signal exported over OTLP/HTTP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Traces,
    Metrics,
    Logs,
}

impl Signal {
    /// OTLP/HTTP path for this signal.
    pub fn path(self) -> &'static str {
        match self {
            Signal::Traces => "/v1/traces",
            Signal::Metrics => "/v1/metrics",
            Signal::Logs => "/v1/logs",
        }
    }
}

/// Strip one trailing slash from `url`.
pub fn base_url(url: &str) -> &str {
    url.strip_suffix('/').unwrap_or(url)
}

/// Full export URL for `signal` under an already normalised `base`.
pub fn signal_endpoint(base: &str, signal: Signal) -> String {
    let path = signal.path();
    if base.ends_with(path) {
        base.to_owned()
    } else {
        format!("{base}{path}")
    }
}

/// Caller headers plus the tenant header.
///
/// The tenant header is omitted when `org_id` is empty and otherwise replaces
/// any caller header of the same name, compared case-insensitively.
pub fn tenant_headers(additional: &HashMap<String, String>, org_id: &str) -> HashMap<String, String> {
    let mut headers = additional.clone();
    if !org_id.is_empty() {
        headers.retain(|name, _| !name.eq_ignore_ascii_case(TENANT_HEADER));
        headers.insert(TENANT_HEADER.to_owned(), org_id.to_owned());
    }
    headers
}

/// Where and how one signal is exported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportTarget {
    /// Full OTLP/HTTP URL, e.g. `http://alloy:4318/v1/traces`.
    pub endpoint: String,
    /// Headers sent with every export request.
    pub headers: HashMap<String, String>,
}

impl ExportTarget {
    pub fn new(collector_url: &str, signal: Signal, headers: HashMap<String, String>) -> Self {
        Self {
            endpoint: signal_endpoint(base_url(collector_url), signal),
            headers,
        }
    }
}
