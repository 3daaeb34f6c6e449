//! Run orchestrator: the state machine that drives one run end to end.
//!
//! ```text
//! pending -> running -> { completed | failed | cancelled }
//!             |
//!             generating -> evaluating_single -> evaluating_pairwise
//!               -> combining -> evaluating_post_combine
//! ```
//!
//! Phase markers live inside `running` and are persisted with per-phase
//! progress after every transition. Disabled or inapplicable phases are
//! recorded as skipped. A run completes with partial results when a later
//! phase has nothing to work on; it only fails when generation produced no
//! usable content at all or the store gives out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::cancel::CancelSignal;
use super::progress::{ProgressCounters, ProgressMonitor};
use crate::collaborators::{Generator, Judge};
use crate::combine::CombineEngine;
use crate::evaluation::single::rank_by_mean_score;
use crate::evaluation::{
    eligible_candidates, EvaluationError, JudgeCallPolicy, PairwiseEvaluator, PairwiseReport,
    SingleDocEvaluator, SingleEvalReport,
};
use crate::generation::{GenerationDispatcher, GenerationReport};
use crate::llm::LlmProvider;
use crate::metrics::MetricsCollector;
use crate::pipeline::{ConfigError, EngineConfig};
use crate::run::{
    Candidate, CandidateId, CombinedDocument, PairwiseStage, PhaseProgress, Run, RunId, RunPhase,
    RunStatus, TransitionError,
};
use crate::storage::{RunStore, StoreError};
use crate::timeline::{TimelineEvent, TimelineEventType, TimelineRecorder};

/// Errors that stop a run or reject an operation on it.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The operation is not allowed in the run's current status.
    #[error("Cannot {operation} run {run_id} in status '{status}'")]
    InvalidState {
        run_id: RunId,
        status: RunStatus,
        operation: &'static str,
    },

    /// Every generation task failed, so there is nothing to evaluate.
    #[error("No generation task produced content ({attempted} attempted)")]
    NoGeneratedContent { attempted: usize },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The task executing the run panicked or was aborted.
    #[error("Run task aborted: {0}")]
    TaskAborted(String),
}

impl OrchestratorError {
    fn invalid_state(run: &Run, operation: &'static str) -> Self {
        OrchestratorError::InvalidState {
            run_id: run.id,
            status: run.status,
            operation,
        }
    }

    fn from_transition(run_id: RunId, err: TransitionError, operation: &'static str) -> Self {
        OrchestratorError::InvalidState {
            run_id,
            status: err.from,
            operation,
        }
    }
}

/// Where a finished run ended up.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Standings {
    /// Eligible generated candidates, best first.
    pub pre_combine_ranking: Vec<CandidateId>,
    pub pre_combine_winner: Option<CandidateId>,
    pub final_winner: Option<CandidateId>,
    pub combined: Option<CandidateId>,
    pub generated: usize,
    pub eligible: usize,
    /// Reasons the run completed with partial results.
    pub notes: Vec<String>,
}

impl Standings {
    pub fn is_partial(&self) -> bool {
        !self.notes.is_empty()
    }

    fn summary(&self, total_cost: f64) -> String {
        let winner = self.final_winner.as_deref().unwrap_or("none");
        let body = format!(
            "winner {} from {} of {} generated candidates; total cost ${:.4}",
            winner, self.eligible, self.generated, total_cost
        );
        if self.is_partial() {
            format!("completed (partial: {}): {}", self.notes.join("; "), body)
        } else {
            format!("completed: {}", body)
        }
    }
}

/// Orders `candidates` by an Elo ranking, dropping ids the ranking does not know.
fn order_by_ranking(candidates: &[Candidate], report: &PairwiseReport) -> Vec<Candidate> {
    report
        .ranking()
        .iter()
        .filter_map(|r| candidates.iter().find(|c| c.id == r.candidate_id).cloned())
        .collect()
}

/// How the phases stopped when nothing failed.
enum Outcome {
    Finished(Standings),
    Cancelled(String),
}

/// Drives runs through their phases.
pub struct RunOrchestrator {
    store: Arc<dyn RunStore>,
    engine: Arc<EngineConfig>,
    dispatcher: GenerationDispatcher,
    single: SingleDocEvaluator,
    pairwise: PairwiseEvaluator,
    combine: CombineEngine,
    metrics: MetricsCollector,
}

impl RunOrchestrator {
    pub fn new(
        store: Arc<dyn RunStore>,
        engine: Arc<EngineConfig>,
        generator: Arc<dyn Generator>,
        judge: Arc<dyn Judge>,
    ) -> Self {
        let policy = JudgeCallPolicy::from_config(&engine);
        Self {
            dispatcher: GenerationDispatcher::new(generator, store.clone(), &engine),
            single: SingleDocEvaluator::new(judge.clone(), store.clone(), policy),
            pairwise: PairwiseEvaluator::new(judge, store.clone(), policy, engine.elo()),
            combine: CombineEngine::new(&engine),
            metrics: MetricsCollector::new(),
            store,
            engine,
        }
    }

    /// Enables intelligent merge with `merger`.
    pub fn with_merger(mut self, merger: Arc<dyn LlmProvider>) -> Self {
        self.combine = CombineEngine::new(&self.engine).with_merger(merger);
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    pub fn engine(&self) -> &EngineConfig {
        &self.engine
    }

    /// Persists a new pending run after validating its configuration.
    pub async fn create(&self, run: &Run) -> Result<(), OrchestratorError> {
        run.config.validate()?;
        self.store.insert_run(run).await?;
        tracing::info!(
            run_id = %run.id,
            documents = run.config.documents.len(),
            models = run.config.models.len(),
            judges = run.config.judges.len(),
            "Run created"
        );
        Ok(())
    }

    /// `pending -> running`.
    pub async fn start(&self, run: &mut Run) -> Result<(), OrchestratorError> {
        if run.status != RunStatus::Pending {
            return Err(OrchestratorError::invalid_state(run, "start"));
        }
        run.mark_running()
            .map_err(|e| OrchestratorError::from_transition(run.id, e, "start"))?;
        self.store.update_run(run).await?;

        let planned = run.config.generation_task_count();
        TimelineRecorder::new(run.id, self.store.clone())
            .record(
                TimelineEvent::run_event(
                    run.id,
                    TimelineEventType::RunStarted,
                    format!("run started with {} generation task(s)", planned),
                )
                .with_details(serde_json::json!({
                    "documents": run.config.documents.len(),
                    "models": run.config.models.len(),
                    "judges": run.config.judges.len(),
                    "iterations": run.config.iterations,
                })),
            )
            .await?;
        self.metrics.run_started();
        tracing::info!(run_id = %run.id, planned_generations = planned, "Run started");
        Ok(())
    }

    /// Starts a pending run and executes it to a terminal status.
    pub async fn run(&self, run: &mut Run, cancel: CancelSignal) -> Result<RunStatus, OrchestratorError> {
        self.start(run).await?;
        self.execute(run, cancel).await
    }

    /// Executes every phase of a running run.
    ///
    /// Cancellation is observed between tasks and between phases. Tasks not
    /// yet dispatched are skipped, calls already in flight are awaited and
    /// persist their results, and the run is then marked cancelled without
    /// entering another phase. Every record of the run is stored by the time
    /// this returns.
    pub async fn execute(
        &self,
        run: &mut Run,
        cancel: CancelSignal,
    ) -> Result<RunStatus, OrchestratorError> {
        if run.status != RunStatus::Running {
            return Err(OrchestratorError::invalid_state(run, "execute"));
        }

        let recorder = TimelineRecorder::new(run.id, self.store.clone());
        let counters = ProgressCounters::new();
        let monitor = ProgressMonitor::start(run.id, counters.clone(), self.engine.progress_interval);

        let outcome = self.run_phases(run, &recorder, &cancel, &counters).await;
        monitor.stop().await;

        match outcome {
            Ok(Outcome::Cancelled(reason)) => {
                if let Some(phase) = counters.phase() {
                    *run.progress.phase_mut(phase) = counters.snapshot();
                }
                self.finish_cancelled(run, reason, &recorder).await?;
                Ok(RunStatus::Cancelled)
            }
            Ok(Outcome::Finished(standings)) => {
                self.finalize(run, standings, &recorder).await?;
                Ok(RunStatus::Completed)
            }
            Err(err) => {
                self.finish_failed(run, &err, &recorder).await;
                Err(err)
            }
        }
    }

    /// Cancels a run that is not executing in this process.
    ///
    /// Running runs are cancelled through their [`super::CancelHandle`].
    pub async fn cancel(&self, run: &mut Run, reason: impl Into<String>) -> Result<(), OrchestratorError> {
        if run.status.is_terminal() {
            return Err(OrchestratorError::invalid_state(run, "cancel"));
        }
        let was_running = run.status == RunStatus::Running;
        let recorder = TimelineRecorder::new(run.id, self.store.clone());
        self.finish_cancelled_inner(run, reason.into(), &recorder, was_running)
            .await
    }

    async fn finish_cancelled(
        &self,
        run: &mut Run,
        reason: String,
        recorder: &TimelineRecorder,
    ) -> Result<(), OrchestratorError> {
        self.finish_cancelled_inner(run, reason, recorder, true).await
    }

    async fn finish_cancelled_inner(
        &self,
        run: &mut Run,
        reason: String,
        recorder: &TimelineRecorder,
        was_active: bool,
    ) -> Result<(), OrchestratorError> {
        let phase = run.phase;
        run.mark_cancelled(reason.clone())
            .map_err(|e| OrchestratorError::from_transition(run.id, e, "cancel"))?;
        self.store.update_run(run).await?;
        recorder
            .record(
                TimelineEvent::run_event(
                    run.id,
                    TimelineEventType::RunCancelled,
                    format!("run cancelled: {}", reason),
                )
                .with_details(serde_json::json!({
                    "phase": phase.map(|p| p.as_str()),
                    "reason": reason,
                })),
            )
            .await?;
        if was_active {
            self.metrics.run_finished(RunStatus::Cancelled.as_str());
        }
        tracing::warn!(run_id = %run.id, phase = ?phase, reason = %reason, "Run cancelled");
        Ok(())
    }

    /// Marks the run failed. Store errors here are logged, not returned,
    /// since the run is already failing for another reason.
    async fn finish_failed(&self, run: &mut Run, err: &OrchestratorError, recorder: &TimelineRecorder) {
        tracing::error!(run_id = %run.id, phase = ?run.phase, error = %err, "Run failed");
        if run.mark_failed(format!("failed: {}", err)).is_err() {
            return;
        }
        if let Err(store_err) = self.store.update_run(run).await {
            tracing::error!(run_id = %run.id, error = %store_err, "Failed to persist failed run");
        }
        let event = TimelineEvent::run_event(run.id, TimelineEventType::RunFailed, "run failed")
            .failed(err.to_string());
        if let Err(store_err) = recorder.record(event).await {
            tracing::error!(run_id = %run.id, error = %store_err, "Failed to record run failure");
        }
        self.metrics.run_finished(RunStatus::Failed.as_str());
    }

    /// Records the winners and moves the run to `completed`.
    async fn finalize(
        &self,
        run: &mut Run,
        standings: Standings,
        recorder: &TimelineRecorder,
    ) -> Result<(), OrchestratorError> {
        run.pre_combine_winner = standings.pre_combine_winner.clone();
        let summary = standings.summary(run.total_cost);
        run.mark_completed(standings.final_winner.clone(), summary.clone())
            .map_err(|e| OrchestratorError::from_transition(run.id, e, "finalize"))?;
        self.store.update_run(run).await?;

        recorder
            .record(
                TimelineEvent::run_event(run.id, TimelineEventType::RunCompleted, summary)
                    .with_details(serde_json::json!({
                        "winner": standings.final_winner,
                        "pre_combine_winner": standings.pre_combine_winner,
                        "combined": standings.combined,
                        "ranking": standings.pre_combine_ranking,
                        "partial": standings.is_partial(),
                        "notes": standings.notes,
                        "total_cost": run.total_cost,
                    })),
            )
            .await?;
        self.metrics.run_finished(RunStatus::Completed.as_str());

        tracing::info!(
            run_id = %run.id,
            winner = standings.final_winner.as_deref().unwrap_or("-"),
            pre_combine_winner = standings.pre_combine_winner.as_deref().unwrap_or("-"),
            partial = standings.is_partial(),
            total_cost = run.total_cost,
            "Run completed"
        );
        Ok(())
    }

    async fn enter_phase(
        &self,
        run: &mut Run,
        phase: RunPhase,
        planned: usize,
        recorder: &TimelineRecorder,
        counters: &ProgressCounters,
    ) -> Result<DateTime<Utc>, StoreError> {
        run.set_phase(phase);
        run.progress.phase_mut(phase).total = planned;
        counters.begin_phase(phase, planned);
        self.store.update_run(run).await?;
        recorder
            .record(TimelineEvent::phase_started(run.id, phase, planned))
            .await?;
        tracing::info!(run_id = %run.id, phase = %phase, planned, "Phase started");
        Ok(Utc::now())
    }

    async fn leave_phase(
        &self,
        run: &mut Run,
        phase: RunPhase,
        progress: PhaseProgress,
        started_at: DateTime<Utc>,
        summary: String,
        recorder: &TimelineRecorder,
    ) -> Result<(), StoreError> {
        *run.progress.phase_mut(phase) = progress;
        self.store.update_run(run).await?;
        recorder
            .record(
                TimelineEvent::phase_completed(run.id, phase, started_at, summary.clone())
                    .with_details(serde_json::json!({
                        "total": progress.total,
                        "completed": progress.completed,
                        "failed": progress.failed,
                        "skipped": progress.skipped,
                    })),
            )
            .await?;
        tracing::info!(
            run_id = %run.id,
            phase = %phase,
            completed = progress.completed,
            failed = progress.failed,
            skipped = progress.skipped,
            "Phase completed: {}",
            summary
        );
        Ok(())
    }

    async fn skip_phase(
        &self,
        run: &mut Run,
        phase: RunPhase,
        reason: &str,
        recorder: &TimelineRecorder,
    ) -> Result<(), StoreError> {
        run.set_phase(phase);
        self.store.update_run(run).await?;
        recorder
            .record(TimelineEvent::phase_skipped(run.id, phase, reason))
            .await?;
        tracing::info!(run_id = %run.id, phase = %phase, reason, "Phase skipped");
        Ok(())
    }

    async fn run_phases(
        &self,
        run: &mut Run,
        recorder: &TimelineRecorder,
        cancel: &CancelSignal,
        counters: &ProgressCounters,
    ) -> Result<Outcome, OrchestratorError> {
        let config = run.config.clone();
        let mut standings = Standings::default();

        // Generation
        let tasks = GenerationDispatcher::plan(run.id, &config);
        let started = self
            .enter_phase(run, RunPhase::Generating, tasks.len(), recorder, counters)
            .await?;
        let generation: GenerationReport = self
            .dispatcher
            .dispatch(tasks, config.generation_concurrency, recorder, cancel, counters)
            .await?;
        run.total_cost += generation.cost;
        if let Some(reason) = cancel.reason() {
            return Ok(Outcome::Cancelled(reason));
        }
        standings.generated = generation.progress.total;
        self.leave_phase(
            run,
            RunPhase::Generating,
            generation.progress,
            started,
            format!(
                "{} of {} generation task(s) produced content",
                generation.succeeded(),
                generation.progress.total
            ),
            recorder,
        )
        .await?;

        if generation.succeeded() == 0 {
            return Err(OrchestratorError::NoGeneratedContent {
                attempted: generation.progress.total,
            });
        }
        let candidates = generation.candidates();
        standings.eligible = candidates.len();

        // Single evaluation
        let single: Option<SingleEvalReport> = if config.phases.single_eval {
            let (eligible, _) =
                eligible_candidates(&generation.documents, RunPhase::EvaluatingSingle, recorder)
                    .await?;
            let planned = eligible.len() * config.judges.len();
            let started = self
                .enter_phase(run, RunPhase::EvaluatingSingle, planned, recorder, counters)
                .await?;
            let report = self
                .single
                .evaluate(
                    run.id,
                    &eligible,
                    &config.judges,
                    &config.criteria,
                    config.evaluation_concurrency,
                    recorder,
                    cancel,
                    counters,
                )
                .await?;
            run.total_cost += report.cost;
            if let Some(reason) = cancel.reason() {
                return Ok(Outcome::Cancelled(reason));
            }
            self.leave_phase(
                run,
                RunPhase::EvaluatingSingle,
                report.progress,
                started,
                format!("{} of {} evaluation(s) scored", report.scored(), planned),
                recorder,
            )
            .await?;
            if report.scored() == 0 && planned > 0 {
                standings.notes.push("no single evaluation produced scores".to_string());
            }
            Some(report)
        } else {
            self.skip_phase(run, RunPhase::EvaluatingSingle, "disabled in configuration", recorder)
                .await?;
            None
        };

        // Pairwise evaluation
        let pairwise: Option<PairwiseReport> = if !config.phases.pairwise {
            self.skip_phase(run, RunPhase::EvaluatingPairwise, "disabled in configuration", recorder)
                .await?;
            None
        } else {
            let (eligible, _) =
                eligible_candidates(&generation.documents, RunPhase::EvaluatingPairwise, recorder)
                    .await?;
            if eligible.len() < 2 {
                let reason = format!(
                    "needs at least 2 eligible candidates, got {}",
                    eligible.len()
                );
                self.skip_phase(run, RunPhase::EvaluatingPairwise, &reason, recorder)
                    .await?;
                standings.notes.push(format!("pairwise evaluation skipped: {}", reason));
                None
            } else {
                let pairs = eligible.len() * (eligible.len() - 1) / 2;
                let planned = pairs * config.judges.len();
                let started = self
                    .enter_phase(run, RunPhase::EvaluatingPairwise, planned, recorder, counters)
                    .await?;
                let report = self
                    .pairwise
                    .evaluate(
                        run.id,
                        PairwiseStage::PreCombine,
                        &eligible,
                        &config.judges,
                        &config.criteria,
                        config.evaluation_concurrency,
                        recorder,
                        cancel,
                        counters,
                    )
                    .await?;
                run.total_cost += report.cost;
                if let Some(reason) = cancel.reason() {
                    return Ok(Outcome::Cancelled(reason));
                }
                self.leave_phase(
                    run,
                    RunPhase::EvaluatingPairwise,
                    report.progress,
                    started,
                    format!(
                        "{} of {} comparison(s) conclusive; leader {}",
                        report.conclusive(),
                        planned,
                        report
                            .leader()
                            .map(|l| l.candidate_id)
                            .unwrap_or_else(|| "-".to_string())
                    ),
                    recorder,
                )
                .await?;
                Some(report)
            }
        };

        // Pre-combine ranking: Elo when any verdict counted, mean score otherwise
        let ranked = match &pairwise {
            Some(report) if report.conclusive() > 0 => order_by_ranking(&candidates, report),
            Some(_) => {
                standings
                    .notes
                    .push("no conclusive pairwise verdicts; ranked by mean score".to_string());
                let means = single.as_ref().map(|s| s.mean_scores()).unwrap_or_default();
                rank_by_mean_score(&candidates, &means)
            }
            None => {
                let means = single.as_ref().map(|s| s.mean_scores()).unwrap_or_default();
                rank_by_mean_score(&candidates, &means)
            }
        };
        standings.pre_combine_ranking = ranked.iter().map(|c| c.id.clone()).collect();
        let pre_winner = ranked.first().cloned();
        standings.pre_combine_winner = pre_winner.as_ref().map(|c| c.id.clone());
        run.pre_combine_winner = standings.pre_combine_winner.clone();

        // Combine
        if let Some(reason) = cancel.reason() {
            return Ok(Outcome::Cancelled(reason));
        }
        let combined: Option<CombinedDocument> = if !config.phases.combine {
            self.skip_phase(run, RunPhase::Combining, "disabled in configuration", recorder)
                .await?;
            None
        } else {
            self.combine_phase(run, &ranked, generation.progress.total as u64, recorder, counters, &mut standings)
                .await?
        };
        standings.combined = combined.as_ref().map(|d| d.id.clone());
        if let Some(reason) = cancel.reason() {
            return Ok(Outcome::Cancelled(reason));
        }

        // Post-combine validation
        standings.final_winner = standings.pre_combine_winner.clone();
        match (&combined, &pre_winner) {
            (Some(doc), Some(pre)) if config.phases.post_combine => {
                let pair = [pre.clone(), doc.candidate()];
                let planned = config.judges.len();
                let started = self
                    .enter_phase(run, RunPhase::EvaluatingPostCombine, planned, recorder, counters)
                    .await?;
                let report = self
                    .pairwise
                    .evaluate(
                        run.id,
                        PairwiseStage::PostCombine,
                        &pair,
                        &config.judges,
                        &config.criteria,
                        config.evaluation_concurrency,
                        recorder,
                        cancel,
                        counters,
                    )
                    .await?;
                run.total_cost += report.cost;
                if let Some(reason) = cancel.reason() {
                    return Ok(Outcome::Cancelled(reason));
                }

                // A tie keeps the pre-combine winner: it was created first.
                if report.conclusive() > 0 {
                    standings.final_winner = report.leader().map(|l| l.candidate_id);
                } else {
                    standings
                        .notes
                        .push("post-combine comparison inconclusive; kept pre-combine winner".to_string());
                }
                self.leave_phase(
                    run,
                    RunPhase::EvaluatingPostCombine,
                    report.progress,
                    started,
                    format!(
                        "{} vs {}: winner {}",
                        pre.id,
                        doc.id,
                        standings.final_winner.as_deref().unwrap_or("-")
                    ),
                    recorder,
                )
                .await?;
            }
            _ => {
                let reason = if !config.phases.post_combine {
                    "disabled in configuration"
                } else {
                    "no combined document to validate"
                };
                self.skip_phase(run, RunPhase::EvaluatingPostCombine, reason, recorder)
                    .await?;
            }
        }

        Ok(Outcome::Finished(standings))
    }

    async fn combine_phase(
        &self,
        run: &mut Run,
        ranked: &[Candidate],
        seq: u64,
        recorder: &TimelineRecorder,
        counters: &ProgressCounters,
        standings: &mut Standings,
    ) -> Result<Option<CombinedDocument>, OrchestratorError> {
        let settings = run.config.combine.clone();
        let started = self
            .enter_phase(run, RunPhase::Combining, 1, recorder, counters)
            .await?;
        let task_started = Utc::now();

        match self.combine.combine(run.id, ranked, &settings, seq).await {
            Ok(doc) => {
                self.store.save_combined_document(&doc).await?;
                run.total_cost += doc.cost;
                counters.record_completed();
                recorder
                    .record(
                        TimelineEvent::task_completed(
                            run.id,
                            RunPhase::Combining,
                            format!("combined {} candidate(s) into {}", doc.source_ids.len(), doc.id),
                            task_started,
                            Utc::now(),
                        )
                        .with_actor(settings.strategy.as_str())
                        .with_subject(doc.id.clone())
                        .with_details(serde_json::json!({
                            "sources": doc.source_ids,
                            "content_chars": doc.content.chars().count(),
                            "cost": doc.cost,
                        })),
                    )
                    .await?;
                let progress = PhaseProgress {
                    total: 1,
                    completed: 1,
                    ..Default::default()
                };
                self.leave_phase(
                    run,
                    RunPhase::Combining,
                    progress,
                    started,
                    format!("{} produced {}", settings.strategy, doc.id),
                    recorder,
                )
                .await?;
                Ok(Some(doc))
            }
            Err(err) if err.is_skip() => {
                *run.progress.phase_mut(RunPhase::Combining) = PhaseProgress {
                    total: 1,
                    skipped: 1,
                    ..Default::default()
                };
                self.skip_phase(run, RunPhase::Combining, &err.to_string(), recorder)
                    .await?;
                standings.notes.push(format!("combine skipped: {}", err));
                Ok(None)
            }
            Err(err) => {
                tracing::warn!(run_id = %run.id, strategy = %settings.strategy, error = %err, "Combine failed");
                recorder
                    .record(
                        TimelineEvent::task_completed(
                            run.id,
                            RunPhase::Combining,
                            format!("{} failed", settings.strategy),
                            task_started,
                            Utc::now(),
                        )
                        .with_actor(settings.strategy.as_str())
                        .failed(err.to_string()),
                    )
                    .await?;
                let progress = PhaseProgress {
                    total: 1,
                    failed: 1,
                    ..Default::default()
                };
                self.leave_phase(
                    run,
                    RunPhase::Combining,
                    progress,
                    started,
                    format!("{} failed: {}", settings.strategy, err),
                    recorder,
                )
                .await?;
                standings.notes.push(format!("combine failed: {}", err));
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{GenerationTask, GeneratorReply, ScoreSet, Verdict, VerdictWinner};
    use crate::error::{CallError, JudgeError};
    use crate::orchestrator::CancelHandle;
    use crate::run::{Criterion, JudgeSpec, ModelSpec, PhaseToggles, RunConfig, SourceDocument};
    use crate::storage::InMemoryRunStore;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;

    struct EchoGenerator;

    #[async_trait]
    impl Generator for EchoGenerator {
        async fn generate(&self, task: &GenerationTask) -> Result<GeneratorReply, CallError> {
            if task.model.model == "mute" {
                return Ok(GeneratorReply::succeeded("", 0.0, Utc::now()));
            }
            Ok(GeneratorReply::succeeded(
                format!("# {}\n{} by {}", task.document.id, task.document.content, task.model.model),
                0.1,
                Utc::now(),
            ))
        }
    }

    /// Prefers longer content; scores everything 4.
    struct LengthJudge;

    #[async_trait]
    impl Judge for LengthJudge {
        async fn score(
            &self,
            _judge: &JudgeSpec,
            _candidate: &Candidate,
            criteria: &[Criterion],
        ) -> Result<ScoreSet, JudgeError> {
            Ok(ScoreSet::new(
                criteria.iter().map(|c| (c.name.clone(), 4)).collect::<BTreeMap<_, _>>(),
            ))
        }

        async fn compare(
            &self,
            _judge: &JudgeSpec,
            a: &Candidate,
            b: &Candidate,
            _criteria: &[Criterion],
        ) -> Result<Verdict, JudgeError> {
            let winner = match a.content.len().cmp(&b.content.len()) {
                std::cmp::Ordering::Greater => VerdictWinner::A,
                std::cmp::Ordering::Less => VerdictWinner::B,
                std::cmp::Ordering::Equal => VerdictWinner::Tie,
            };
            Ok(Verdict::new(winner, "longer is better"))
        }
    }

    fn config(models: &[&str]) -> RunConfig {
        RunConfig::new(
            vec![SourceDocument::new("doc-1", "Explain tides")],
            models.iter().map(|m| ModelSpec::new("p", *m)).collect(),
            vec![JudgeSpec::new("judge", ModelSpec::new("p", "judge"))],
            vec![Criterion::new("clarity")],
        )
    }

    fn orchestrator(store: Arc<dyn RunStore>) -> RunOrchestrator {
        let engine = EngineConfig::new()
            .with_backoff(Duration::from_millis(1), Duration::from_millis(2))
            .with_progress_interval(Duration::from_millis(50));
        RunOrchestrator::new(store, Arc::new(engine), Arc::new(EchoGenerator), Arc::new(LengthJudge))
    }

    #[tokio::test]
    async fn test_start_requires_pending() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let orchestrator = orchestrator(store.clone());
        let mut run = Run::new(config(&["m1"]));
        orchestrator.create(&run).await.unwrap();

        orchestrator.start(&mut run).await.unwrap();
        let err = orchestrator.start(&mut run).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidState { operation: "start", status: RunStatus::Running, .. }
        ));
    }

    #[tokio::test]
    async fn test_single_candidate_completes_partially() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let orchestrator = orchestrator(store.clone());
        let mut run = Run::new(config(&["m1", "mute"]));
        orchestrator.create(&run).await.unwrap();

        let status = orchestrator.run(&mut run, CancelSignal::never()).await.unwrap();
        assert_eq!(status, RunStatus::Completed);
        assert_eq!(run.winner.as_deref(), Some("doc-1::p/m1::1"));
        assert_eq!(run.pre_combine_winner, run.winner);
        assert!(run.summary.as_deref().unwrap().starts_with("completed (partial"));
        assert_eq!(run.progress.generation.failed, 1);

        let stored = store.get_run(run.id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        let skipped: Vec<_> = store
            .list_timeline(run.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == TimelineEventType::PhaseSkipped)
            .collect();
        // pairwise, combine, post-combine
        assert_eq!(skipped.len(), 3);
    }

    #[tokio::test]
    async fn test_all_generations_empty_fails_run() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let orchestrator = orchestrator(store.clone());
        let mut run = Run::new(config(&["mute"]));
        orchestrator.create(&run).await.unwrap();

        let err = orchestrator.run(&mut run, CancelSignal::never()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NoGeneratedContent { attempted: 1 }));
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(store.get_run(run.id).await.unwrap().status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn test_disabled_phases_are_skipped() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let orchestrator = orchestrator(store.clone());
        let mut run = Run::new(config(&["m1", "m22"]).with_phases(PhaseToggles {
            single_eval: false,
            pairwise: false,
            combine: false,
            post_combine: false,
        }));
        orchestrator.create(&run).await.unwrap();

        orchestrator.run(&mut run, CancelSignal::never()).await.unwrap();
        // no scores and no ratings: creation order decides
        assert_eq!(run.winner.as_deref(), Some("doc-1::p/m1::1"));
        assert!(store.list_single_results(run.id).await.unwrap().is_empty());
        assert!(store.get_combined_document(run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancel_before_execution() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let orchestrator = orchestrator(store.clone());
        let mut run = Run::new(config(&["m1"]));
        orchestrator.create(&run).await.unwrap();

        let handle = CancelHandle::new();
        handle.cancel("changed my mind");
        let status = orchestrator.run(&mut run, handle.signal()).await.unwrap();
        assert_eq!(status, RunStatus::Cancelled);
        assert_eq!(run.cancel_reason.as_deref(), Some("changed my mind"));
        assert!(store.list_generated_documents(run.id).await.unwrap().is_empty());

        let err = orchestrator.cancel(&mut run, "again").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { operation: "cancel", .. }));
    }

    #[tokio::test]
    async fn test_cancel_pending_run() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let orchestrator = orchestrator(store.clone());
        let mut run = Run::new(config(&["m1"]));
        orchestrator.create(&run).await.unwrap();

        orchestrator.cancel(&mut run, "not needed").await.unwrap();
        assert_eq!(store.get_run(run.id).await.unwrap().status, RunStatus::Cancelled);
        assert!(orchestrator.start(&mut run).await.is_err());
    }
}
