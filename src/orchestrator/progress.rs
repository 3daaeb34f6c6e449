//! Background progress monitor for a running run.
//!
//! Workers bump shared atomic counters as tasks resolve; the monitor wakes
//! periodically and logs a per-phase summary so operators can follow a
//! long run without reading individual task lines.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;

use crate::run::{PhaseProgress, RunId, RunPhase};

/// Shared atomic counters for the phase currently executing.
///
/// Cloned into task futures and incremented via `fetch_add`.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounters {
    phase: Arc<std::sync::Mutex<Option<RunPhase>>>,
    total: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    failed: Arc<AtomicUsize>,
    skipped: Arc<AtomicUsize>,
}

impl ProgressCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resets the counters for a new phase with `total` planned tasks.
    pub fn begin_phase(&self, phase: RunPhase, total: usize) {
        if let Ok(mut current) = self.phase.lock() {
            *current = Some(phase);
        }
        self.total.store(total, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn phase(&self) -> Option<RunPhase> {
        self.phase.lock().ok().and_then(|p| *p)
    }

    /// Current counters of the active phase.
    pub fn snapshot(&self) -> PhaseProgress {
        PhaseProgress {
            total: self.total.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// A background task that periodically logs run progress.
///
/// Call [`ProgressMonitor::stop`] to cancel; dropping also stops it at the next tick.
pub struct ProgressMonitor {
    stop_flag: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ProgressMonitor {
    /// Starts logging `counters` for `run_id` every `interval`.
    pub fn start(run_id: RunId, counters: ProgressCounters, interval: Duration) -> Self {
        let stop_flag = Arc::new(AtomicBool::new(false));
        let flag = stop_flag.clone();
        let start = Instant::now();

        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.tick().await; // skip the immediate first tick

            loop {
                tick.tick().await;
                if flag.load(Ordering::Relaxed) {
                    break;
                }

                let snap = counters.snapshot();
                let pct = if snap.total > 0 {
                    (snap.resolved() as f64 / snap.total as f64 * 100.0).min(100.0)
                } else {
                    0.0
                };
                let phase = counters
                    .phase()
                    .map(|p| p.as_str())
                    .unwrap_or("starting");

                tracing::info!(
                    run_id = %run_id,
                    phase,
                    total = snap.total,
                    completed = snap.completed,
                    failed = snap.failed,
                    skipped = snap.skipped,
                    progress_pct = format!("{:.1}%", pct),
                    elapsed_secs = start.elapsed().as_secs(),
                    "Run progress"
                );
            }
        });

        Self {
            stop_flag,
            handle: Some(handle),
        }
    }

    /// Signals the monitor to stop and waits for it to finish.
    pub async fn stop(mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }
}

impl Drop for ProgressMonitor {
    fn drop(&mut self) {
        self.stop_flag.store(true, Ordering::Relaxed);
    }
}
