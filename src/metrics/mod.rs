//! Metrics module for Prometheus-based monitoring.
//!
//! Counts generation and judge calls, observes call latency, tracks spend,
//! and counts runs by terminal status.
//!
//! # Example
//!
//! ```ignore
//! use evalforge::metrics::{export_metrics, init_metrics, MetricsCollector};
//!
//! init_metrics()?;
//! MetricsCollector::new().record_generation("openai/gpt-4o", "succeeded", 12.5, 0.03);
//! let text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_RUNS, CALL_LATENCY, COST_DOLLARS, GENERATIONS_TOTAL, JUDGE_CALLS_TOTAL, REGISTRY,
    RUNS_TOTAL,
};
