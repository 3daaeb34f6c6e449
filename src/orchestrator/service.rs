//! Run service: the surface the rest of the system talks to.
//!
//! Creates runs, starts each one on its own task, serves read views and
//! timelines, and routes cancellation to the task that owns a run. Startup
//! recovery runs once when the service is built and never blocks it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::cancel::CancelHandle;
use super::orchestrator::{OrchestratorError, RunOrchestrator};
use super::recovery::RecoveryManager;
use crate::run::{CandidateId, Run, RunConfig, RunId, RunPhase, RunProgress, RunStatus};
use crate::storage::RunStore;
use crate::timeline::TimelineEvent;

/// Read model of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunView {
    pub id: RunId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub status: RunStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<RunPhase>,
    pub progress: RunProgress,
    pub winner: Option<CandidateId>,
    pub pre_combine_winner: Option<CandidateId>,
    pub total_cost: f64,
    pub summary: Option<String>,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Run> for RunView {
    fn from(run: &Run) -> Self {
        Self {
            id: run.id,
            name: run.config.name.clone(),
            status: run.status,
            phase: run.phase,
            progress: run.progress.clone(),
            winner: run.winner.clone(),
            pre_combine_winner: run.pre_combine_winner.clone(),
            total_cost: run.total_cost,
            summary: run.summary.clone(),
            cancel_reason: run.cancel_reason.clone(),
            created_at: run.created_at,
            started_at: run.started_at,
            completed_at: run.completed_at,
        }
    }
}

struct ActiveRun {
    cancel: CancelHandle,
    /// Taken by the first caller of [`RunService::wait`].
    handle: Option<JoinHandle<Result<RunStatus, OrchestratorError>>>,
}

impl ActiveRun {
    fn is_live(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| !h.is_finished())
    }
}

/// Owns the runs executing in this process.
pub struct RunService {
    store: Arc<dyn RunStore>,
    orchestrator: Arc<RunOrchestrator>,
    active: Mutex<HashMap<RunId, ActiveRun>>,
}

impl RunService {
    /// Builds the service after recovering runs interrupted by a previous process.
    ///
    /// Recovery problems are logged; the service starts regardless.
    pub async fn startup(orchestrator: RunOrchestrator) -> Self {
        let store = orchestrator.store().clone();
        match RecoveryManager::new(store.clone()).recover().await {
            Ok(report) => {
                if !report.recovered.is_empty() {
                    tracing::warn!(count = report.recovered.len(), "Recovered interrupted runs");
                }
                for (run_id, err) in &report.failures {
                    tracing::error!(run_id = %run_id, error = %err, "Run left in running state");
                }
            }
            Err(err) => tracing::error!(error = %err, "Startup recovery failed"),
        }

        Self {
            store,
            orchestrator: Arc::new(orchestrator),
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Validates `config` and persists a pending run.
    pub async fn create_run(&self, config: RunConfig) -> Result<RunId, OrchestratorError> {
        let run = Run::new(config);
        self.orchestrator.create(&run).await?;
        Ok(run.id)
    }

    /// Starts a pending run on its own task.
    ///
    /// The transition to `running` happens before this returns, so callers
    /// see the new status immediately. The active-run lock is held until the
    /// cancel handle is registered, so a concurrent [`Self::cancel_run`]
    /// always reaches the owning task once the run is `running`.
    pub async fn start_run(&self, run_id: RunId) -> Result<(), OrchestratorError> {
        let mut active = self.active.lock().await;
        let mut run = self.store.get_run(run_id).await?;
        self.orchestrator.start(&mut run).await?;

        let cancel = CancelHandle::new();
        let signal = cancel.signal();
        let orchestrator = self.orchestrator.clone();
        let handle = tokio::spawn(async move { orchestrator.execute(&mut run, signal).await });

        active.insert(
            run_id,
            ActiveRun {
                cancel,
                handle: Some(handle),
            },
        );
        Ok(())
    }

    pub async fn get_run(&self, run_id: RunId) -> Result<RunView, OrchestratorError> {
        let run = self.store.get_run(run_id).await?;
        Ok(RunView::from(&run))
    }

    pub async fn list_runs(&self) -> Result<Vec<RunView>, OrchestratorError> {
        let runs = self.store.list_runs().await?;
        Ok(runs.iter().map(RunView::from).collect())
    }

    /// Requests cancellation of a pending or running run.
    ///
    /// A running run stops dispatching new tasks at once; calls already in
    /// flight finish and are recorded.
    pub async fn cancel_run(
        &self,
        run_id: RunId,
        reason: impl Into<String>,
    ) -> Result<(), OrchestratorError> {
        let reason = reason.into();
        {
            let active = self.active.lock().await;
            if let Some(entry) = active.get(&run_id) {
                if entry.is_live() {
                    if !entry.cancel.cancel(reason.clone()) {
                        tracing::debug!(run_id = %run_id, "Cancellation already requested");
                    }
                    return Ok(());
                }
            }
        }

        let mut run = self.store.get_run(run_id).await?;
        self.orchestrator.cancel(&mut run, reason).await
    }

    /// Timeline of a run in insertion order.
    pub async fn timeline(&self, run_id: RunId) -> Result<Vec<TimelineEvent>, OrchestratorError> {
        self.store.get_run(run_id).await?;
        Ok(self.store.list_timeline(run_id).await?)
    }

    /// Waits for a run started by this service to reach a terminal status.
    ///
    /// Returns the stored status for runs this service is not executing.
    pub async fn wait(&self, run_id: RunId) -> Result<RunStatus, OrchestratorError> {
        // The cancel handle stays registered while the task is awaited.
        let handle = self
            .active
            .lock()
            .await
            .get_mut(&run_id)
            .and_then(|entry| entry.handle.take());
        let Some(handle) = handle else {
            return Ok(self.store.get_run(run_id).await?.status);
        };

        let joined = handle.await;
        self.active.lock().await.remove(&run_id);
        match joined {
            Ok(result) => result,
            Err(join_error) => {
                tracing::error!(run_id = %run_id, error = %join_error, "Run task aborted");
                Err(OrchestratorError::TaskAborted(join_error.to_string()))
            }
        }
    }

    /// Runs currently executing in this process.
    pub async fn active_runs(&self) -> Vec<RunId> {
        let active = self.active.lock().await;
        active
            .iter()
            .filter(|(_, entry)| entry.is_live())
            .map(|(id, _)| *id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        GenerationTask, Generator, GeneratorReply, Judge, ScoreSet, Verdict, VerdictWinner,
    };
    use crate::error::{CallError, JudgeError};
    use crate::pipeline::EngineConfig;
    use crate::evaluation::elo::EloRating;
    use crate::run::{
        Candidate, CombinedDocument, Criterion, GeneratedDocument, JudgeSpec, ModelSpec,
        PairwiseResult, PairwiseStage, SingleEvalResult, SourceDocument,
    };
    use crate::storage::{InMemoryRunStore, StoreError};
    use crate::timeline::TimelineEventType;
    use async_trait::async_trait;
    use std::time::Duration;

    struct SlowGenerator(Duration);

    #[async_trait]
    impl Generator for SlowGenerator {
        async fn generate(&self, task: &GenerationTask) -> Result<GeneratorReply, CallError> {
            let started = Utc::now();
            tokio::time::sleep(self.0).await;
            Ok(GeneratorReply::succeeded(
                format!("text from {}", task.model.model),
                0.0,
                started,
            ))
        }
    }

    /// Yields before every call so concurrent service calls interleave.
    struct YieldingStore(InMemoryRunStore);

    #[async_trait]
    impl RunStore for YieldingStore {
        async fn insert_run(&self, run: &Run) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.insert_run(run).await
        }

        async fn update_run(&self, run: &Run) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.update_run(run).await
        }

        async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError> {
            tokio::task::yield_now().await;
            self.0.get_run(run_id).await
        }

        async fn list_runs(&self) -> Result<Vec<Run>, StoreError> {
            self.0.list_runs().await
        }

        async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>, StoreError> {
            self.0.list_runs_by_status(status).await
        }

        async fn save_generated_document(&self, doc: &GeneratedDocument) -> Result<(), StoreError> {
            self.0.save_generated_document(doc).await
        }

        async fn list_generated_documents(
            &self,
            run_id: RunId,
        ) -> Result<Vec<GeneratedDocument>, StoreError> {
            self.0.list_generated_documents(run_id).await
        }

        async fn save_single_result(&self, result: &SingleEvalResult) -> Result<(), StoreError> {
            self.0.save_single_result(result).await
        }

        async fn list_single_results(
            &self,
            run_id: RunId,
        ) -> Result<Vec<SingleEvalResult>, StoreError> {
            self.0.list_single_results(run_id).await
        }

        async fn save_pairwise_result(&self, result: &PairwiseResult) -> Result<(), StoreError> {
            self.0.save_pairwise_result(result).await
        }

        async fn list_pairwise_results(
            &self,
            run_id: RunId,
            stage: PairwiseStage,
        ) -> Result<Vec<PairwiseResult>, StoreError> {
            self.0.list_pairwise_results(run_id, stage).await
        }

        async fn save_elo_ratings(
            &self,
            run_id: RunId,
            stage: PairwiseStage,
            ratings: &[EloRating],
        ) -> Result<(), StoreError> {
            self.0.save_elo_ratings(run_id, stage, ratings).await
        }

        async fn list_elo_ratings(
            &self,
            run_id: RunId,
            stage: PairwiseStage,
        ) -> Result<Vec<EloRating>, StoreError> {
            self.0.list_elo_ratings(run_id, stage).await
        }

        async fn save_combined_document(&self, doc: &CombinedDocument) -> Result<(), StoreError> {
            self.0.save_combined_document(doc).await
        }

        async fn get_combined_document(
            &self,
            run_id: RunId,
        ) -> Result<Option<CombinedDocument>, StoreError> {
            self.0.get_combined_document(run_id).await
        }

        async fn append_timeline_event(&self, event: &TimelineEvent) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.0.append_timeline_event(event).await
        }

        async fn list_timeline(&self, run_id: RunId) -> Result<Vec<TimelineEvent>, StoreError> {
            self.0.list_timeline(run_id).await
        }
    }

    struct TieJudge;

    #[async_trait]
    impl Judge for TieJudge {
        async fn score(
            &self,
            _judge: &JudgeSpec,
            _candidate: &Candidate,
            criteria: &[Criterion],
        ) -> Result<ScoreSet, JudgeError> {
            Ok(ScoreSet::new(criteria.iter().map(|c| (c.name.clone(), 5)).collect()))
        }

        async fn compare(
            &self,
            _judge: &JudgeSpec,
            _a: &Candidate,
            _b: &Candidate,
            _criteria: &[Criterion],
        ) -> Result<Verdict, JudgeError> {
            Ok(Verdict::new(VerdictWinner::Tie, "equal"))
        }
    }

    fn config(models: &[&str]) -> RunConfig {
        RunConfig::new(
            vec![SourceDocument::new("doc", "Describe the water cycle")],
            models.iter().map(|m| ModelSpec::new("p", *m)).collect(),
            vec![JudgeSpec::new("judge", ModelSpec::new("p", "judge"))],
            vec![Criterion::new("clarity")],
        )
        .with_concurrency(1, 2)
    }

    async fn service(store: Arc<dyn RunStore>, delay: Duration) -> RunService {
        let engine = EngineConfig::new().with_progress_interval(Duration::from_millis(50));
        let orchestrator = RunOrchestrator::new(
            store,
            Arc::new(engine),
            Arc::new(SlowGenerator(delay)),
            Arc::new(TieJudge),
        );
        RunService::startup(orchestrator).await
    }

    #[tokio::test]
    async fn test_create_start_wait() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let service = service(store, Duration::from_millis(1)).await;

        let run_id = service.create_run(config(&["a", "b"])).await.unwrap();
        assert_eq!(service.get_run(run_id).await.unwrap().status, RunStatus::Pending);

        service.start_run(run_id).await.unwrap();
        assert_eq!(service.wait(run_id).await.unwrap(), RunStatus::Completed);

        let view = service.get_run(run_id).await.unwrap();
        assert_eq!(view.status, RunStatus::Completed);
        // all ties: the earliest candidate wins everywhere
        assert_eq!(view.winner.as_deref(), Some("doc::p/a::1"));
        assert_eq!(view.progress.generation.completed, 2);
        assert!(service.timeline(run_id).await.unwrap().len() > 5);
        assert!(service.active_runs().await.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let service = service(store, Duration::from_millis(1)).await;
        let err = service.create_run(config(&[])).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[tokio::test]
    async fn test_cancel_running_run() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let service = service(store.clone(), Duration::from_millis(200)).await;

        let run_id = service.create_run(config(&["a", "b", "c"])).await.unwrap();
        service.start_run(run_id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        service.cancel_run(run_id, "operator request").await.unwrap();

        assert_eq!(service.wait(run_id).await.unwrap(), RunStatus::Cancelled);
        let view = service.get_run(run_id).await.unwrap();
        assert_eq!(view.cancel_reason.as_deref(), Some("operator request"));
        assert!(store.list_single_results(run_id).await.unwrap().is_empty());

        let err = service.cancel_run(run_id, "again").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_cancel_racing_start_reaches_owning_task() {
        let store: Arc<dyn RunStore> = Arc::new(YieldingStore(InMemoryRunStore::new()));
        let service = service(store, Duration::from_millis(20)).await;
        let run_id = service.create_run(config(&["a", "b"])).await.unwrap();

        // start_run is polled first and yields inside the store
        let (started, cancelled) = tokio::join!(
            service.start_run(run_id),
            service.cancel_run(run_id, "operator request"),
        );
        started.unwrap();
        cancelled.unwrap();

        assert_eq!(service.wait(run_id).await.unwrap(), RunStatus::Cancelled);
        let view = service.get_run(run_id).await.unwrap();
        assert_eq!(view.cancel_reason.as_deref(), Some("operator request"));
        assert!(view.winner.is_none());

        let timeline = service.timeline(run_id).await.unwrap();
        let terminal: Vec<_> = timeline
            .iter()
            .filter(|e| {
                matches!(
                    e.event_type,
                    TimelineEventType::RunCancelled
                        | TimelineEventType::RunCompleted
                        | TimelineEventType::RunFailed
                )
            })
            .collect();
        assert_eq!(terminal.len(), 1);
        assert_eq!(terminal[0].event_type, TimelineEventType::RunCancelled);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let service = service(store, Duration::from_millis(1)).await;
        let err = service.get_run(uuid::Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Store(StoreError::NotFound(_))));
        assert!(service.timeline(uuid::Uuid::new_v4()).await.is_err());
    }
}
