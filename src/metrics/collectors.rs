//! Recording helpers over the raw Prometheus metrics.
//!
//! Every method is a no-op until [`super::init_metrics`] has run, so library
//! code can record unconditionally.

use super::prometheus::{
    ACTIVE_RUNS, CALL_LATENCY, COST_DOLLARS, GENERATIONS_TOTAL, JUDGE_CALLS_TOTAL, RUNS_TOTAL,
};

/// Metrics collector for evalforge operations.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Records one resolved generation task.
    ///
    /// `outcome` is the generation outcome label (`succeeded`, `failed_empty`, `failed_error`).
    pub fn record_generation(&self, model: &str, outcome: &str, latency_secs: f64, cost: f64) {
        if let Some(total) = GENERATIONS_TOTAL.get() {
            total.with_label_values(&[model, outcome]).inc();
        }
        self.observe_latency("generate", latency_secs);
        self.record_cost("generation", cost);

        tracing::trace!(model, outcome, latency_secs, cost, "Recorded generation metric");
    }

    /// Records one judge call (`kind` is `score` or `compare`).
    pub fn record_judge_call(&self, kind: &str, success: bool, latency_secs: f64, cost: f64) {
        let outcome = if success { "success" } else { "failure" };
        if let Some(total) = JUDGE_CALLS_TOTAL.get() {
            total.with_label_values(&[kind, outcome]).inc();
        }
        self.observe_latency(kind, latency_secs);
        self.record_cost("evaluation", cost);
    }

    /// Records a model-driven merge call.
    pub fn record_merge(&self, latency_secs: f64, cost: f64) {
        self.observe_latency("merge", latency_secs);
        self.record_cost("combine", cost);
    }

    fn observe_latency(&self, kind: &str, latency_secs: f64) {
        if let Some(latency) = CALL_LATENCY.get() {
            latency.with_label_values(&[kind]).observe(latency_secs);
        }
    }

    fn record_cost(&self, phase: &str, cost: f64) {
        if cost > 0.0 {
            if let Some(total) = COST_DOLLARS.get() {
                total.with_label_values(&[phase]).inc_by(cost);
            }
        }
    }

    pub fn run_started(&self) {
        if let Some(active) = ACTIVE_RUNS.get() {
            active.inc();
        }
    }

    /// Records a run reaching `status` and leaving the active set.
    pub fn run_finished(&self, status: &str) {
        if let Some(total) = RUNS_TOTAL.get() {
            total.with_label_values(&[status]).inc();
        }
        if let Some(active) = ACTIVE_RUNS.get() {
            active.dec();
        }
    }
}
