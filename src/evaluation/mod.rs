//! Candidate evaluation: single-document scoring, pairwise comparison and Elo.
//!
//! Both evaluators share the same call discipline: each judge call runs under
//! a per-call timeout, transient failures are retried with backoff, and
//! unparsable answers are re-asked up to a fixed bound. Whatever happens, a
//! dispatched (candidate, judge) task resolves to exactly one persisted result.

pub mod elo;
pub mod pairwise;
pub mod parser;
pub mod retry;
pub mod single;

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::error::{CallError, JudgeError, ParseError};
use crate::pipeline::EngineConfig;
use crate::run::{Candidate, CandidateOrigin, GeneratedDocument, GenerationOutcome, RunPhase};
use crate::storage::StoreError;
use crate::timeline::{TimelineEvent, TimelineRecorder};

pub use elo::{EloCalculator, EloError, EloRating, EloTable};
pub use pairwise::{PairwiseEvaluator, PairwiseReport};
pub use parser::{ScoreSet, Verdict, VerdictWinner};
pub use retry::{with_timeout, Attempted, RetryPolicy};
pub use single::{SingleDocEvaluator, SingleEvalReport};

/// Errors that abort an evaluation phase.
///
/// Individual judge failures never surface here; they become failure records.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Rating update failed: {0}")]
    Elo(#[from] EloError),
}

/// Timeout, retry and re-ask bounds for judge calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JudgeCallPolicy {
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// How many times an unparsable answer is re-requested.
    pub parse_attempts: u32,
}

impl JudgeCallPolicy {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            timeout: config.judge_timeout,
            retry: config.judge_retry(),
            parse_attempts: config.judge_parse_attempts.max(1),
        }
    }

    /// Calls the judge until it yields a parsed answer or the bounds are exhausted.
    ///
    /// Transient call errors are retried by the retry policy; parse errors
    /// restart the whole call with the same request. The returned attempt
    /// count covers every call made.
    pub async fn call<T, F, Fut>(&self, label: &str, mut call: F) -> JudgeAttempt<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, JudgeError>>,
    {
        let mut attempts = 0;
        let mut last_error = JudgeError::Validation(ParseError::NoJson);

        for parse_attempt in 1..=self.parse_attempts {
            let outcome = self
                .retry
                .run(label, |_| with_timeout(self.timeout, split_judge_error(call())))
                .await;
            attempts += outcome.attempts;

            match outcome.result {
                Ok(Ok(value)) => {
                    return JudgeAttempt {
                        result: Ok(value),
                        attempts,
                    }
                }
                Ok(Err(parse_error)) => {
                    tracing::warn!(
                        call = label,
                        parse_attempt,
                        max_parse_attempts = self.parse_attempts,
                        error = %parse_error,
                        "Unparsable judge response"
                    );
                    last_error = JudgeError::Validation(parse_error);
                }
                Err(call_error) => {
                    return JudgeAttempt {
                        result: Err(JudgeError::Call(call_error)),
                        attempts,
                    }
                }
            }
        }

        JudgeAttempt {
            result: Err(last_error),
            attempts,
        }
    }
}

/// Result of a judge call with the total number of calls made.
#[derive(Debug)]
pub struct JudgeAttempt<T> {
    pub result: Result<T, JudgeError>,
    pub attempts: u32,
}

/// Separates retryable call failures from parse failures.
async fn split_judge_error<T>(
    fut: impl Future<Output = Result<T, JudgeError>>,
) -> Result<Result<T, ParseError>, CallError> {
    match fut.await {
        Ok(value) => Ok(Ok(value)),
        Err(JudgeError::Validation(parse_error)) => Ok(Err(parse_error)),
        Err(JudgeError::Call(call_error)) => Err(call_error),
    }
}

/// Candidates eligible for `phase`, plus the number excluded.
///
/// Every excluded document is logged and gets a `TaskSkipped` event for the
/// phase, so nothing drops out of a run without a trace.
pub async fn eligible_candidates(
    documents: &[GeneratedDocument],
    phase: RunPhase,
    recorder: &TimelineRecorder,
) -> Result<(Vec<Candidate>, usize), StoreError> {
    let mut eligible = Vec::with_capacity(documents.len());
    let mut excluded = 0;

    for doc in documents {
        let reason = match &doc.outcome {
            GenerationOutcome::Succeeded { content } => {
                eligible.push(Candidate {
                    id: doc.id.clone(),
                    seq: doc.seq,
                    origin: CandidateOrigin::Generated {
                        source_document_id: doc.source_document_id.clone(),
                        model: doc.model.clone(),
                        iteration: doc.iteration,
                    },
                    content: content.clone(),
                });
                continue;
            }
            GenerationOutcome::FailedEmpty { reason } => format!("empty content: {}", reason),
            GenerationOutcome::FailedError { kind, message } => {
                format!("generation failed ({}): {}", kind, message)
            }
        };

        excluded += 1;
        tracing::warn!(
            run_id = %recorder.run_id(),
            phase = %phase,
            candidate = %doc.id,
            model = %doc.model,
            reason = %reason,
            "Excluding document from evaluation"
        );
        recorder
            .record(
                TimelineEvent::task_skipped(recorder.run_id(), phase, doc.id.clone(), reason)
                    .with_actor(doc.model.id()),
            )
            .await?;
    }

    Ok((eligible, excluded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::ModelSpec;
    use crate::storage::{InMemoryRunStore, RunStore};
    use crate::timeline::TimelineEventType;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use uuid::Uuid;

    fn policy(parse_attempts: u32) -> JudgeCallPolicy {
        JudgeCallPolicy {
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
            parse_attempts,
        }
    }

    fn doc(id: &str, seq: u64, outcome: GenerationOutcome) -> GeneratedDocument {
        let now = Utc::now();
        GeneratedDocument {
            id: id.to_string(),
            run_id: Uuid::nil(),
            source_document_id: "doc".to_string(),
            model: ModelSpec::new("p", "m"),
            iteration: 1,
            seq,
            outcome,
            attempts: 1,
            started_at: now,
            completed_at: now,
            cost: 0.0,
        }
    }

    #[tokio::test]
    async fn test_parse_errors_are_reasked() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let outcome = policy(3)
            .call("score", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(JudgeError::Validation(ParseError::NoJson))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(outcome.result.unwrap(), 7);
        assert_eq!(outcome.attempts, 3);
    }

    #[tokio::test]
    async fn test_parse_exhaustion_returns_validation_error() {
        let outcome: JudgeAttempt<()> = policy(3)
            .call("compare", || async {
                Err(JudgeError::Validation(ParseError::UnknownWinner("C".to_string())))
            })
            .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(
            outcome.result.unwrap_err(),
            JudgeError::Validation(ParseError::UnknownWinner("C".to_string()))
        );
    }

    #[tokio::test]
    async fn test_permanent_call_error_stops_immediately() {
        let outcome: JudgeAttempt<()> = policy(3)
            .call("score", || async {
                Err(JudgeError::Call(CallError::Provider {
                    code: 401,
                    message: "bad key".to_string(),
                }))
            })
            .await;
        assert_eq!(outcome.attempts, 1);
        assert!(matches!(outcome.result, Err(JudgeError::Call(_))));
    }

    #[tokio::test]
    async fn test_ineligible_documents_leave_skip_records() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let run_id = Uuid::new_v4();
        let recorder = TimelineRecorder::new(run_id, store);

        let documents = vec![
            doc("a", 0, GenerationOutcome::Succeeded { content: "text".to_string() }),
            doc("b", 1, GenerationOutcome::FailedEmpty { reason: "blank".to_string() }),
            doc(
                "c",
                2,
                GenerationOutcome::FailedError {
                    kind: "timeout".to_string(),
                    message: "Call timed out after 600s".to_string(),
                },
            ),
        ];

        let (eligible, excluded) =
            eligible_candidates(&documents, RunPhase::EvaluatingSingle, &recorder)
                .await
                .unwrap();
        assert_eq!(eligible.len(), 1);
        assert_eq!(eligible[0].id, "a");
        assert_eq!(excluded, 2);

        let events = recorder.events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|e| e.event_type == TimelineEventType::TaskSkipped));
        assert_eq!(events[0].subject.as_deref(), Some("b"));
        assert!(events[1].description.contains("timeout"));
    }
}
