//! Pairwise evaluation feeding the Elo table.
//!
//! Pairs are formed over candidates sorted by creation order, so the earlier
//! candidate is always presented as A. Comparisons run concurrently, but
//! results are folded into ratings in canonical (pair, judge) order: the
//! final table does not depend on which call finished first.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::elo::{EloCalculator, EloRating, EloTable};
use super::parser::VerdictWinner;
use super::{EvaluationError, JudgeCallPolicy};
use crate::collaborators::Judge;
use crate::metrics::MetricsCollector;
use crate::orchestrator::{CancelSignal, ProgressCounters};
use crate::run::{
    Candidate, Criterion, JudgeSpec, PairwiseOutcome, PairwiseResult, PairwiseStage,
    PhaseProgress, RunId,
};
use crate::storage::{RunStore, StoreError};
use crate::timeline::{TimelineEvent, TimelineRecorder};

/// All unordered pairs of `candidates`, with the earlier-created candidate as A.
pub fn candidate_pairs(candidates: &[Candidate]) -> Vec<(Candidate, Candidate)> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.id.cmp(&b.id)));

    let mut pairs = Vec::with_capacity(sorted.len() * sorted.len().saturating_sub(1) / 2);
    for (i, a) in sorted.iter().enumerate() {
        for b in &sorted[i + 1..] {
            pairs.push((a.clone(), b.clone()));
        }
    }
    pairs
}

/// Outcome of one pairwise pass.
#[derive(Debug, Clone)]
pub struct PairwiseReport {
    pub stage: PairwiseStage,
    /// Results in canonical (pair, judge) order.
    pub results: Vec<PairwiseResult>,
    pub table: EloTable,
    pub progress: PhaseProgress,
    pub cost: f64,
}

impl PairwiseReport {
    /// Results that moved ratings.
    pub fn conclusive(&self) -> usize {
        self.results.iter().filter(|r| r.is_conclusive()).count()
    }

    pub fn ranking(&self) -> Vec<EloRating> {
        self.table.ranking()
    }

    pub fn leader(&self) -> Option<EloRating> {
        self.table.leader()
    }
}

#[derive(Clone)]
struct CompareWorker {
    judge: Arc<dyn Judge>,
    store: Arc<dyn RunStore>,
    policy: JudgeCallPolicy,
    metrics: MetricsCollector,
}

impl CompareWorker {
    #[allow(clippy::too_many_arguments)]
    async fn compare(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
        judge: &JudgeSpec,
        a: &Candidate,
        b: &Candidate,
        criteria: &[Criterion],
        recorder: &TimelineRecorder,
    ) -> Result<(PairwiseResult, f64), StoreError> {
        let started_at = Utc::now();
        let label = format!("compare {} vs {} by {}", a.id, b.id, judge.id);
        let attempt = self
            .policy
            .call(&label, || self.judge.compare(judge, a, b, criteria))
            .await;
        let completed_at = Utc::now();

        let (outcome, rationale, cost) = match attempt.result {
            Ok(verdict) => {
                let outcome = match verdict.winner {
                    VerdictWinner::A => PairwiseOutcome::WinnerA,
                    VerdictWinner::B => PairwiseOutcome::WinnerB,
                    VerdictWinner::Tie => PairwiseOutcome::Tie,
                };
                (outcome, verdict.rationale, verdict.cost)
            }
            Err(err) => (
                PairwiseOutcome::Inconclusive {
                    reason: err.to_string(),
                },
                String::new(),
                0.0,
            ),
        };

        let result = PairwiseResult {
            id: Uuid::new_v4(),
            run_id,
            stage,
            candidate_a: a.id.clone(),
            candidate_b: b.id.clone(),
            judge: judge.id.clone(),
            outcome,
            rationale,
            attempts: attempt.attempts,
            started_at,
            completed_at,
        };
        self.store.save_pairwise_result(&result).await?;

        let latency = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        self.metrics
            .record_judge_call("compare", result.is_conclusive(), latency, cost);

        let winner = match &result.outcome {
            PairwiseOutcome::WinnerA => "A",
            PairwiseOutcome::WinnerB => "B",
            PairwiseOutcome::Tie => "tie",
            PairwiseOutcome::Inconclusive { .. } => "inconclusive",
        };
        let mut event = TimelineEvent::task_completed(
            run_id,
            stage.run_phase(),
            format!("compared {} vs {}: {}", a.id, b.id, winner),
            started_at,
            completed_at,
        )
        .with_actor(judge.id.clone())
        .with_subject(format!("{} vs {}", a.id, b.id))
        .with_details(serde_json::json!({
            "stage": stage.as_str(),
            "candidate_a": a.id,
            "candidate_b": b.id,
            "winner": winner,
            "attempts": result.attempts,
            "cost": cost,
        }));

        if let PairwiseOutcome::Inconclusive { reason } = &result.outcome {
            tracing::warn!(
                run_id = %run_id,
                stage = %stage,
                candidate_a = %a.id,
                candidate_b = %b.id,
                judge = %judge.id,
                reason = %reason,
                "Comparison inconclusive, ratings unchanged"
            );
            event = event.failed(reason.clone());
        }
        recorder.record(event).await?;

        Ok((result, cost))
    }
}

enum TaskResolution {
    Done(PairwiseResult, f64),
    Skipped,
}

/// Runs head-to-head comparisons and folds them into Elo ratings.
pub struct PairwiseEvaluator {
    worker: CompareWorker,
    elo: EloCalculator,
}

impl PairwiseEvaluator {
    pub fn new(
        judge: Arc<dyn Judge>,
        store: Arc<dyn RunStore>,
        policy: JudgeCallPolicy,
        elo: EloCalculator,
    ) -> Self {
        Self {
            worker: CompareWorker {
                judge,
                store,
                policy,
                metrics: MetricsCollector::new(),
            },
            elo,
        }
    }

    pub fn elo(&self) -> EloCalculator {
        self.elo
    }

    /// Compares every pair of `candidates` with every judge and persists the ratings.
    ///
    /// Every candidate starts from the baseline rating, whatever it held in an
    /// earlier stage.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
        candidates: &[Candidate],
        judges: &[JudgeSpec],
        criteria: &[Criterion],
        concurrency: usize,
        recorder: &TimelineRecorder,
        cancel: &CancelSignal,
        counters: &ProgressCounters,
    ) -> Result<PairwiseReport, EvaluationError> {
        let pairs = candidate_pairs(candidates);
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let criteria: Arc<[Criterion]> = criteria.into();
        let mut handles = Vec::with_capacity(pairs.len() * judges.len());

        for (a, b) in &pairs {
            for judge in judges {
                let worker = self.worker.clone();
                let semaphore = semaphore.clone();
                let recorder = recorder.clone();
                let cancel = cancel.clone();
                let counters = counters.clone();
                let criteria = criteria.clone();
                let (a, b, judge) = (a.clone(), b.clone(), judge.clone());

                handles.push(tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => return Ok::<_, StoreError>(TaskResolution::Skipped),
                    };
                    if let Some(reason) = cancel.reason() {
                        counters.record_skipped();
                        recorder
                            .record(
                                TimelineEvent::task_skipped(
                                    run_id,
                                    stage.run_phase(),
                                    format!("{} vs {}", a.id, b.id),
                                    format!("run cancelled: {}", reason),
                                )
                                .with_actor(judge.id.clone()),
                            )
                            .await?;
                        return Ok(TaskResolution::Skipped);
                    }

                    let (result, cost) = worker
                        .compare(run_id, stage, &judge, &a, &b, &criteria, &recorder)
                        .await?;
                    if result.is_conclusive() {
                        counters.record_completed();
                    } else {
                        counters.record_failed();
                    }
                    Ok(TaskResolution::Done(result, cost))
                }));
            }
        }

        let mut progress = PhaseProgress {
            total: handles.len(),
            ..Default::default()
        };
        let mut results = Vec::with_capacity(handles.len());
        let mut cost = 0.0;
        let mut first_error = None;

        // join_all preserves spawn order, which is the canonical fold order
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(TaskResolution::Done(result, task_cost))) => {
                    if result.is_conclusive() {
                        progress.completed += 1;
                    } else {
                        progress.failed += 1;
                    }
                    cost += task_cost;
                    results.push(result);
                }
                Ok(Ok(TaskResolution::Skipped)) => progress.skipped += 1,
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_error) => {
                    tracing::error!(run_id = %run_id, error = %join_error, "Comparison task panicked");
                    progress.failed += 1;
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err.into());
        }

        let table = self.elo.replay(candidates, &results)?;
        let ranking = table.ranking();
        self.worker
            .store
            .save_elo_ratings(run_id, stage, &ranking)
            .await?;

        tracing::info!(
            run_id = %run_id,
            stage = %stage,
            pairs = pairs.len(),
            judges = judges.len(),
            conclusive = progress.completed,
            inconclusive = progress.failed,
            skipped = progress.skipped,
            leader = ranking.first().map(|r| r.candidate_id.as_str()).unwrap_or("-"),
            "Pairwise evaluation finished"
        );

        Ok(PairwiseReport {
            stage,
            results,
            table,
            progress,
            cost,
        })
    }
}
