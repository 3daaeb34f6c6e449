//! Single-document evaluation.
//!
//! Every eligible candidate is scored by every configured judge across the
//! full criteria set. Each (candidate, judge) pair yields exactly one
//! [`SingleEvalResult`]: either per-criterion scores with their mean, or a
//! failure marker with the reason the judge could not be used.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use super::parser::{validate_scores, ScoreSet};
use super::{EvaluationError, JudgeCallPolicy};
use crate::collaborators::Judge;
use crate::error::JudgeError;
use crate::metrics::MetricsCollector;
use crate::orchestrator::{CancelSignal, ProgressCounters};
use crate::run::{
    Candidate, CandidateId, Criterion, JudgeSpec, PhaseProgress, RunId, RunPhase,
    SingleEvalResult,
};
use crate::storage::{RunStore, StoreError};
use crate::timeline::{TimelineEvent, TimelineRecorder};

/// Results of one single-evaluation phase.
#[derive(Debug, Clone, Default)]
pub struct SingleEvalReport {
    /// Results ordered by (candidate, judge) as planned.
    pub results: Vec<SingleEvalResult>,
    pub progress: PhaseProgress,
    pub cost: f64,
}

impl SingleEvalReport {
    /// Results that carry scores.
    pub fn scored(&self) -> usize {
        self.results.iter().filter(|r| !r.is_failure()).count()
    }

    /// Average of the per-judge mean scores for each candidate with at least one score.
    pub fn mean_scores(&self) -> BTreeMap<CandidateId, f64> {
        let mut sums: BTreeMap<CandidateId, (f64, usize)> = BTreeMap::new();
        for result in &self.results {
            if let Some(mean) = result.mean_score {
                let entry = sums.entry(result.candidate_id.clone()).or_insert((0.0, 0));
                entry.0 += mean;
                entry.1 += 1;
            }
        }
        sums.into_iter()
            .map(|(id, (sum, n))| (id, sum / n as f64))
            .collect()
    }
}

/// Ranks candidates by mean single-evaluation score, then creation order.
///
/// Used when no pairwise ratings are available. Unscored candidates rank last.
pub fn rank_by_mean_score(
    candidates: &[Candidate],
    means: &BTreeMap<CandidateId, f64>,
) -> Vec<Candidate> {
    let mut ranked = candidates.to_vec();
    ranked.sort_by(|a, b| {
        let ma = means.get(&a.id).copied().unwrap_or(f64::NEG_INFINITY);
        let mb = means.get(&b.id).copied().unwrap_or(f64::NEG_INFINITY);
        mb.total_cmp(&ma)
            .then_with(|| a.seq.cmp(&b.seq))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

#[derive(Clone)]
struct ScoreWorker {
    judge: Arc<dyn Judge>,
    store: Arc<dyn RunStore>,
    policy: JudgeCallPolicy,
    metrics: MetricsCollector,
}

impl ScoreWorker {
    async fn score(
        &self,
        run_id: RunId,
        judge: &JudgeSpec,
        candidate: &Candidate,
        criteria: &[Criterion],
        recorder: &TimelineRecorder,
    ) -> Result<(SingleEvalResult, f64), StoreError> {
        let started_at = Utc::now();
        let label = format!("score {} by {}", candidate.id, judge.id);
        // Out-of-range or missing criteria are re-asked like unparsable answers.
        let attempt = self
            .policy
            .call(&label, || async move {
                let set = self.judge.score(judge, candidate, criteria).await?;
                let scores = validate_scores(&set.scores, criteria)?;
                Ok::<_, JudgeError>(ScoreSet { scores, ..set })
            })
            .await;
        let completed_at = Utc::now();

        let (result, cost) = match attempt.result {
            Ok(set) => {
                let mean_score = set.mean();
                let cost = set.cost;
                (
                    SingleEvalResult {
                        id: Uuid::new_v4(),
                        run_id,
                        candidate_id: candidate.id.clone(),
                        judge: judge.id.clone(),
                        scores: set.scores,
                        mean_score,
                        attempts: attempt.attempts,
                        failure: None,
                        started_at,
                        completed_at,
                    },
                    cost,
                )
            }
            Err(err) => (
                SingleEvalResult {
                    id: Uuid::new_v4(),
                    run_id,
                    candidate_id: candidate.id.clone(),
                    judge: judge.id.clone(),
                    scores: BTreeMap::new(),
                    mean_score: None,
                    attempts: attempt.attempts,
                    failure: Some(err.to_string()),
                    started_at,
                    completed_at,
                },
                0.0,
            ),
        };

        self.store.save_single_result(&result).await?;

        let latency = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;
        self.metrics
            .record_judge_call("score", !result.is_failure(), latency, cost);

        let mut event = TimelineEvent::task_completed(
            run_id,
            RunPhase::EvaluatingSingle,
            format!("scored {}", candidate.id),
            started_at,
            completed_at,
        )
        .with_actor(judge.id.clone())
        .with_subject(candidate.id.clone())
        .with_details(serde_json::json!({
            "scores": result.scores,
            "mean_score": result.mean_score,
            "attempts": result.attempts,
            "cost": cost,
        }));

        match &result.failure {
            Some(reason) => {
                tracing::warn!(
                    run_id = %run_id,
                    candidate = %candidate.id,
                    judge = %judge.id,
                    attempts = result.attempts,
                    reason = %reason,
                    "Single evaluation failed"
                );
                event = event.failed(reason.clone());
            }
            None => {
                tracing::debug!(
                    run_id = %run_id,
                    candidate = %candidate.id,
                    judge = %judge.id,
                    mean_score = ?result.mean_score,
                    "Single evaluation scored"
                );
            }
        }
        recorder.record(event).await?;

        Ok((result, cost))
    }
}

enum TaskResolution {
    Done(SingleEvalResult, f64),
    Skipped,
}

/// Scores candidates with every judge under a concurrency bound.
pub struct SingleDocEvaluator {
    worker: ScoreWorker,
}

impl SingleDocEvaluator {
    pub fn new(judge: Arc<dyn Judge>, store: Arc<dyn RunStore>, policy: JudgeCallPolicy) -> Self {
        Self {
            worker: ScoreWorker {
                judge,
                store,
                policy,
                metrics: MetricsCollector::new(),
            },
        }
    }

    /// Runs the phase over `candidates`.
    ///
    /// Tasks not yet started when `cancel` fires are recorded as skipped.
    #[allow(clippy::too_many_arguments)]
    pub async fn evaluate(
        &self,
        run_id: RunId,
        candidates: &[Candidate],
        judges: &[JudgeSpec],
        criteria: &[Criterion],
        concurrency: usize,
        recorder: &TimelineRecorder,
        cancel: &CancelSignal,
        counters: &ProgressCounters,
    ) -> Result<SingleEvalReport, EvaluationError> {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let criteria: Arc<[Criterion]> = criteria.into();
        let mut handles = Vec::with_capacity(candidates.len() * judges.len());

        for candidate in candidates {
            for judge in judges {
                let worker = self.worker.clone();
                let semaphore = semaphore.clone();
                let recorder = recorder.clone();
                let cancel = cancel.clone();
                let counters = counters.clone();
                let criteria = criteria.clone();
                let candidate = candidate.clone();
                let judge = judge.clone();

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
                                    RunPhase::EvaluatingSingle,
                                    candidate.id.clone(),
                                    format!("run cancelled: {}", reason),
                                )
                                .with_actor(judge.id.clone()),
                            )
                            .await?;
                        return Ok(TaskResolution::Skipped);
                    }

                    let (result, cost) = worker
                        .score(run_id, &judge, &candidate, &criteria, &recorder)
                        .await?;
                    if result.is_failure() {
                        counters.record_failed();
                    } else {
                        counters.record_completed();
                    }
                    Ok(TaskResolution::Done(result, cost))
                }));
            }
        }

        let mut report = SingleEvalReport {
            progress: PhaseProgress {
                total: handles.len(),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut first_error = None;

        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(TaskResolution::Done(result, cost))) => {
                    if result.is_failure() {
                        report.progress.failed += 1;
                    } else {
                        report.progress.completed += 1;
                    }
                    report.cost += cost;
                    report.results.push(result);
                }
                Ok(Ok(TaskResolution::Skipped)) => report.progress.skipped += 1,
                Ok(Err(err)) => {
                    first_error.get_or_insert(err);
                }
                Err(join_error) => {
                    tracing::error!(run_id = %run_id, error = %join_error, "Scoring task panicked");
                    report.progress.failed += 1;
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err.into());
        }

        tracing::info!(
            run_id = %run_id,
            candidates = candidates.len(),
            judges = judges.len(),
            scored = report.progress.completed,
            failed = report.progress.failed,
            skipped = report.progress.skipped,
            "Single evaluation finished"
        );

        Ok(report)
    }
}
