//! Configuration loading and validation for the smoke runner.
//!
//! Telemetry settings (`OTEL_*`) are resolved by `lgtm-apm` itself; only the
//! shape of the generated workload is read here.

use anyhow::{Context, Result};
use serde::Deserialize;

/// Validated smoke-run configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Number of traced iterations to run.
    #[serde(default = "default_iterations")]
    pub smoke_iterations: u32,

    /// Pause between iterations, in milliseconds.
    #[serde(default = "default_interval_ms")]
    pub smoke_interval_ms: u64,

    /// Also export logs over OTLP.
    #[serde(default)]
    pub smoke_enable_logs: bool,
}

fn default_iterations() -> u32 {
    3
}
fn default_interval_ms() -> u64 {
    500
}

impl Config {
    /// Load and validate configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Variables that are not valid UTF-8 cannot configure anything here.
        let vars = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        let cfg = config::Config::builder()
            .add_source(config::Environment::default().source(Some(vars)))
            .build()
            .context("failed to build smoke configuration")?;

        let c: Config = cfg
            .try_deserialize()
            .context("failed to deserialise smoke configuration")?;

        c.validate()?;
        Ok(c)
    }

    fn validate(&self) -> Result<()> {
        if self.smoke_iterations == 0 {
            anyhow::bail!("SMOKE_ITERATIONS must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        assert_eq!(default_iterations(), 3);
        assert_eq!(default_interval_ms(), 500);
    }

    #[test]
    fn validate_rejects_zero_iterations() {
        let cfg = Config {
            smoke_iterations: 0,
            smoke_interval_ms: 10,
            smoke_enable_logs: false,
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_accepts_valid_config() {
        let cfg = Config {
            smoke_iterations: 5,
            smoke_interval_ms: 0,
            smoke_enable_logs: true,
        };
        assert!(cfg.validate().is_ok());
    }
}
