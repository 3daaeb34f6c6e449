//! Startup recovery of runs left `running` by a previous process.
//!
//! A run is only executed by the process that started it, so any run still
//! marked `running` at startup has no owner. Each one is moved to `failed`
//! with an explanatory summary; runs that cannot be recovered are reported
//! and left for the next attempt.

use std::sync::Arc;

use thiserror::Error;

use crate::run::{RunId, RunStatus};
use crate::storage::{RunStore, StoreError};
use crate::timeline::{TimelineEvent, TimelineEventType};

/// Summary written on recovered runs.
pub const INTERRUPTED_SUMMARY: &str = "interrupted by restart";

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// The store could not be scanned for running runs.
    #[error("Failed to scan for interrupted runs: {0}")]
    Scan(#[from] StoreError),
}

/// What a recovery pass did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub recovered: Vec<RunId>,
    /// Runs that could not be moved to `failed`.
    pub failures: Vec<(RunId, StoreError)>,
}

pub struct RecoveryManager {
    store: Arc<dyn RunStore>,
}

impl RecoveryManager {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Marks every `running` run as failed.
    pub async fn recover(&self) -> Result<RecoveryReport, RecoveryError> {
        let zombies = self.store.list_runs_by_status(RunStatus::Running).await?;
        let mut report = RecoveryReport::default();

        for mut run in zombies {
            let phase = run.phase;
            if run.mark_failed(INTERRUPTED_SUMMARY).is_err() {
                continue;
            }

            let persisted = async {
                self.store.update_run(&run).await?;
                self.store
                    .append_timeline_event(
                        &TimelineEvent::run_event(
                            run.id,
                            TimelineEventType::RunRecovered,
                            INTERRUPTED_SUMMARY,
                        )
                        .failed(INTERRUPTED_SUMMARY)
                        .with_details(serde_json::json!({
                            "phase": phase.map(|p| p.as_str()),
                        })),
                    )
                    .await
            }
            .await;

            match persisted {
                Ok(()) => {
                    tracing::warn!(
                        run_id = %run.id,
                        phase = ?phase,
                        "Recovered interrupted run as failed"
                    );
                    report.recovered.push(run.id);
                }
                Err(err) => {
                    tracing::error!(run_id = %run.id, error = %err, "Failed to recover run");
                    report.failures.push((run.id, err));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{Criterion, JudgeSpec, ModelSpec, Run, RunConfig, RunPhase, SourceDocument};
    use crate::storage::InMemoryRunStore;

    fn run() -> Run {
        Run::new(RunConfig::new(
            vec![SourceDocument::new("doc", "text")],
            vec![ModelSpec::new("p", "m")],
            vec![JudgeSpec::new("j", ModelSpec::new("p", "j"))],
            vec![Criterion::new("clarity")],
        ))
    }

    #[tokio::test]
    async fn test_only_running_runs_are_recovered() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());

        let mut running = run();
        running.mark_running().unwrap();
        running.set_phase(RunPhase::EvaluatingPairwise);
        store.insert_run(&running).await.unwrap();

        let pending = run();
        store.insert_run(&pending).await.unwrap();

        let mut done = run();
        done.mark_running().unwrap();
        done.mark_completed(None, "done").unwrap();
        store.insert_run(&done).await.unwrap();

        let report = RecoveryManager::new(store.clone()).recover().await.unwrap();
        assert_eq!(report.recovered, vec![running.id]);
        assert!(report.failures.is_empty());

        let recovered = store.get_run(running.id).await.unwrap();
        assert_eq!(recovered.status, RunStatus::Failed);
        assert_eq!(recovered.summary.as_deref(), Some(INTERRUPTED_SUMMARY));
        assert_eq!(store.get_run(pending.id).await.unwrap().status, RunStatus::Pending);
        assert_eq!(store.get_run(done.id).await.unwrap().status, RunStatus::Completed);

        let timeline = store.list_timeline(running.id).await.unwrap();
        assert_eq!(timeline.len(), 1);
        assert_eq!(timeline[0].event_type, TimelineEventType::RunRecovered);

        // a second pass finds nothing
        let again = RecoveryManager::new(store).recover().await.unwrap();
        assert!(again.recovered.is_empty());
    }
}
