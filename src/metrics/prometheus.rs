//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by evalforge and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all evalforge metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Generation calls, labeled by model and outcome (succeeded, failed_empty, failed_error).
pub static GENERATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Judge calls, labeled by kind (score, compare) and outcome.
pub static JUDGE_CALLS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// External call latency in seconds, labeled by kind (generate, score, compare, merge).
pub static CALL_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Total spend in dollars, labeled by phase.
pub static COST_DOLLARS: OnceLock<CounterVec> = OnceLock::new();

/// Runs that reached a terminal status, labeled by status.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Runs currently executing.
pub static ACTIVE_RUNS: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Calling again is harmless: the first registry wins.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric construction or registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let generations_total = CounterVec::new(
        Opts::new("evalforge_generations_total", "Total generation calls"),
        &["model", "outcome"],
    )?;

    let judge_calls_total = CounterVec::new(
        Opts::new("evalforge_judge_calls_total", "Total judge calls"),
        &["kind", "outcome"],
    )?;

    let call_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "evalforge_call_latency_seconds",
            "External call latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 180.0, 600.0]),
        &["kind"],
    )?;

    let cost_dollars = CounterVec::new(
        Opts::new("evalforge_cost_dollars_total", "Total spend in dollars"),
        &["phase"],
    )?;

    let runs_total = CounterVec::new(
        Opts::new("evalforge_runs_total", "Runs by terminal status"),
        &["status"],
    )?;

    let active_runs = Gauge::new("evalforge_active_runs", "Runs currently executing")?;

    registry.register(Box::new(generations_total.clone()))?;
    registry.register(Box::new(judge_calls_total.clone()))?;
    registry.register(Box::new(call_latency.clone()))?;
    registry.register(Box::new(cost_dollars.clone()))?;
    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(active_runs.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = GENERATIONS_TOTAL.set(generations_total);
    let _ = JUDGE_CALLS_TOTAL.set(judge_calls_total);
    let _ = CALL_LATENCY.set(call_latency);
    let _ = COST_DOLLARS.set(cost_dollars);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = ACTIVE_RUNS.set(active_runs);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of failing when the registry is not initialized.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
