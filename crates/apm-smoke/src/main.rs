//! `apm-smoke` — checks a collector end to end.
//!
//! Startup sequence:
//! 1. Load the workload [`config::Config`] from environment variables.
//! 2. Start `lgtm-apm` from `OTEL_*` variables, with the default logger.
//! 3. Run traced iterations that bump a counter and log with trace ids.
//! 4. Flush and shut the pipeline down.

mod config;

use std::time::Duration;

use anyhow::{Context, Result};
use lgtm_apm::ApmConfig;
use serde_json::json;
use tracing::{info, info_span, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------------------------------------------------
    // 1. Configuration
    // -----------------------------------------------------------------------
    let cfg = config::Config::from_env().map_err(|e| {
        // Telemetry is not yet up; write to stderr directly.
        eprintln!("ERROR: apm-smoke configuration invalid: {e}");
        e
    })?;

    // -----------------------------------------------------------------------
    // 2. Telemetry
    // -----------------------------------------------------------------------
    let apm = lgtm_apm::init_apm(
        ApmConfig::new()
            .create_default_logger(true)
            .enable_logs(cfg.smoke_enable_logs),
    )
    .await
    .context("failed to start telemetry pipeline")?;
    info!(
        collector = %apm.resolved().collector_url,
        capabilities = ?apm.capabilities(),
        "apm-smoke starting"
    );

    // -----------------------------------------------------------------------
    // 3. Workload
    // -----------------------------------------------------------------------
    let logger = lgtm_apm::get_logger().context("default logger was not installed")?;
    let iterations = opentelemetry::global::meter("apm-smoke")
        .u64_counter("apm_smoke.iterations")
        .with_description("Smoke iterations completed")
        .init();
    let interval = Duration::from_millis(cfg.smoke_interval_ms);

    for iteration in 0..cfg.smoke_iterations {
        let span = info_span!("smoke.iteration", iteration);
        async {
            logger.info("iteration started", json!({ "iteration": iteration }))?;
            tokio::time::sleep(interval).await;
            iterations.add(1, &[]);
            Ok::<_, anyhow::Error>(())
        }
        .instrument(span)
        .await?;
    }
    logger.error(
        "synthetic failure for error-path checks",
        anyhow::anyhow!("smoke check error"),
    )?;

    // -----------------------------------------------------------------------
    // 4. Shutdown
    // -----------------------------------------------------------------------
    apm.shutdown().await.context("telemetry shutdown failed")?;
    Ok(())
}
