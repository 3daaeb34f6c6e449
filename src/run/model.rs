//! Run data model: the run record and every entity a run owns.
//!
//! A [`Run`] exclusively owns its generated documents, evaluation results,
//! Elo ratings, combined document and timeline. None of these are shared
//! across runs; every child record carries its parent `run_id`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::config::{CombineStrategy, ModelSpec, RunConfig};

/// Identifier of a run.
pub type RunId = Uuid;

/// Identifier of a candidate document within a run.
pub type CandidateId = String;

/// Error returned when a run status change is not allowed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid state transition from '{from}' to '{to}'")]
pub struct TransitionError {
    pub from: RunStatus,
    pub to: RunStatus,
}

// ============================================================================
// Run status and phases
// ============================================================================

/// Persisted status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses are immutable except for the run summary.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        match (self, next) {
            (RunStatus::Pending, RunStatus::Running) => true,
            (RunStatus::Pending, RunStatus::Cancelled) => true,
            (RunStatus::Running, RunStatus::Completed) => true,
            (RunStatus::Running, RunStatus::Failed) => true,
            (RunStatus::Running, RunStatus::Cancelled) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status '{}'", other)),
        }
    }
}

/// Progress marker inside the `running` status.
///
/// Used for progress reporting only, never as a persisted status value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Generating,
    EvaluatingSingle,
    EvaluatingPairwise,
    Combining,
    EvaluatingPostCombine,
}

impl RunPhase {
    /// All phases in execution order.
    pub fn all() -> [RunPhase; 5] {
        [
            RunPhase::Generating,
            RunPhase::EvaluatingSingle,
            RunPhase::EvaluatingPairwise,
            RunPhase::Combining,
            RunPhase::EvaluatingPostCombine,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Generating => "generating",
            RunPhase::EvaluatingSingle => "evaluating_single",
            RunPhase::EvaluatingPairwise => "evaluating_pairwise",
            RunPhase::Combining => "combining",
            RunPhase::EvaluatingPostCombine => "evaluating_post_combine",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Task counters for one phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseProgress {
    /// Tasks planned for the phase.
    pub total: usize,
    /// Tasks that resolved successfully.
    pub completed: usize,
    /// Tasks that resolved to a recorded failure.
    pub failed: usize,
    /// Tasks never dispatched (cancellation, ineligible input).
    pub skipped: usize,
}

impl PhaseProgress {
    /// Tasks that reached a terminal record.
    pub fn resolved(&self) -> usize {
        self.completed + self.failed + self.skipped
    }
}

/// Per-phase progress counters of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunProgress {
    pub generation: PhaseProgress,
    pub single_eval: PhaseProgress,
    pub pairwise: PhaseProgress,
    pub combine: PhaseProgress,
    pub post_combine: PhaseProgress,
}

impl RunProgress {
    pub fn phase(&self, phase: RunPhase) -> &PhaseProgress {
        match phase {
            RunPhase::Generating => &self.generation,
            RunPhase::EvaluatingSingle => &self.single_eval,
            RunPhase::EvaluatingPairwise => &self.pairwise,
            RunPhase::Combining => &self.combine,
            RunPhase::EvaluatingPostCombine => &self.post_combine,
        }
    }

    pub fn phase_mut(&mut self, phase: RunPhase) -> &mut PhaseProgress {
        match phase {
            RunPhase::Generating => &mut self.generation,
            RunPhase::EvaluatingSingle => &mut self.single_eval,
            RunPhase::EvaluatingPairwise => &mut self.pairwise,
            RunPhase::Combining => &mut self.combine,
            RunPhase::EvaluatingPostCombine => &mut self.post_combine,
        }
    }
}

// ============================================================================
// Run
// ============================================================================

/// The unit of work: one end-to-end pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub status: RunStatus,
    /// Current phase marker while running.
    pub phase: Option<RunPhase>,
    pub config: RunConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    /// Winner before the combine phase.
    pub pre_combine_winner: Option<CandidateId>,
    /// Final winner reference, set once the run completes.
    pub winner: Option<CandidateId>,
    pub progress: RunProgress,
    pub total_cost: f64,
    pub cancel_reason: Option<String>,
}

impl Run {
    /// Creates a new pending run.
    pub fn new(config: RunConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: RunStatus::Pending,
            phase: None,
            config,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            summary: None,
            pre_combine_winner: None,
            winner: None,
            progress: RunProgress::default(),
            total_cost: 0.0,
            cancel_reason: None,
        }
    }

    fn transition(&mut self, next: RunStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
            self.phase = None;
        }
        Ok(())
    }

    /// `pending -> running`.
    pub fn mark_running(&mut self) -> Result<(), TransitionError> {
        self.transition(RunStatus::Running)?;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// `running -> completed`.
    pub fn mark_completed(
        &mut self,
        winner: Option<CandidateId>,
        summary: impl Into<String>,
    ) -> Result<(), TransitionError> {
        self.transition(RunStatus::Completed)?;
        self.winner = winner;
        self.summary = Some(summary.into());
        Ok(())
    }

    /// `running -> failed`.
    pub fn mark_failed(&mut self, summary: impl Into<String>) -> Result<(), TransitionError> {
        self.transition(RunStatus::Failed)?;
        self.summary = Some(summary.into());
        Ok(())
    }

    /// `pending | running -> cancelled`.
    pub fn mark_cancelled(&mut self, reason: impl Into<String>) -> Result<(), TransitionError> {
        let reason = reason.into();
        self.transition(RunStatus::Cancelled)?;
        self.summary = Some(format!("cancelled: {}", reason));
        self.cancel_reason = Some(reason);
        Ok(())
    }

    /// Updates the phase marker. Ignored unless the run is running.
    pub fn set_phase(&mut self, phase: RunPhase) {
        if self.status == RunStatus::Running {
            self.phase = Some(phase);
        }
    }

    /// Replaces the summary. Allowed in every status.
    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = Some(summary.into());
    }
}

// ============================================================================
// Generated documents
// ============================================================================

/// Outcome of one generation task.
///
/// A tagged tri-state instead of a boolean plus content: downstream phases
/// must match on it, so an ineligible document cannot be skipped without a
/// code path that also records why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GenerationOutcome {
    /// Non-empty content was produced.
    Succeeded { content: String },
    /// The call finished but yielded no usable text.
    FailedEmpty { reason: String },
    /// The call failed (timeout, provider error, reported failure).
    FailedError { kind: String, message: String },
}

impl GenerationOutcome {
    /// Builds an outcome from generator content, downgrading blank text to `FailedEmpty`.
    pub fn from_content(content: String, empty_reason: impl Into<String>) -> Self {
        if content.trim().is_empty() {
            GenerationOutcome::FailedEmpty {
                reason: empty_reason.into(),
            }
        } else {
            GenerationOutcome::Succeeded { content }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, GenerationOutcome::Succeeded { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            GenerationOutcome::Succeeded { .. } => "succeeded",
            GenerationOutcome::FailedEmpty { .. } => "failed_empty",
            GenerationOutcome::FailedError { .. } => "failed_error",
        }
    }

    /// Reason for a non-success outcome.
    pub fn failure_reason(&self) -> Option<String> {
        match self {
            GenerationOutcome::Succeeded { .. } => None,
            GenerationOutcome::FailedEmpty { reason } => Some(reason.clone()),
            GenerationOutcome::FailedError { kind, message } => {
                Some(format!("{}: {}", kind, message))
            }
        }
    }
}

/// One document x model x iteration output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    pub id: CandidateId,
    pub run_id: RunId,
    pub source_document_id: String,
    pub model: ModelSpec,
    pub iteration: u32,
    /// Creation ordinal within the run.
    pub seq: u64,
    pub outcome: GenerationOutcome,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub cost: f64,
}

impl GeneratedDocument {
    /// Deterministic candidate id for a generation task.
    pub fn candidate_id(source_document_id: &str, model: &ModelSpec, iteration: u32) -> CandidateId {
        format!("{}::{}::{}", source_document_id, model.id(), iteration)
    }

    pub fn success(&self) -> bool {
        self.outcome.is_success()
    }

    /// The generated text; empty for failed outcomes.
    pub fn content(&self) -> &str {
        match &self.outcome {
            GenerationOutcome::Succeeded { content } => content,
            _ => "",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }

    /// The evaluation candidate for this document, only for successful outcomes.
    pub fn candidate(&self) -> Option<Candidate> {
        match &self.outcome {
            GenerationOutcome::Succeeded { content } => Some(Candidate {
                id: self.id.clone(),
                seq: self.seq,
                origin: CandidateOrigin::Generated {
                    source_document_id: self.source_document_id.clone(),
                    model: self.model.clone(),
                    iteration: self.iteration,
                },
                content: content.clone(),
            }),
            GenerationOutcome::FailedEmpty { .. } | GenerationOutcome::FailedError { .. } => None,
        }
    }
}

// ============================================================================
// Candidates
// ============================================================================

/// Where a candidate came from.
#[derive(Debug, Clone, PartialEq)]
pub enum CandidateOrigin {
    Generated {
        source_document_id: String,
        model: ModelSpec,
        iteration: u32,
    },
    Combined {
        strategy: CombineStrategy,
        sources: Vec<CandidateId>,
    },
}

/// A document eligible for evaluation.
///
/// Only constructed from successful generations or from a combined document,
/// so its content is never empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub id: CandidateId,
    /// Creation ordinal; lower means created earlier.
    pub seq: u64,
    pub origin: CandidateOrigin,
    pub content: String,
}

impl Candidate {
    /// Short label for logs: the model for generated candidates, the strategy otherwise.
    pub fn label(&self) -> String {
        match &self.origin {
            CandidateOrigin::Generated { model, .. } => model.id(),
            CandidateOrigin::Combined { strategy, .. } => format!("combined/{}", strategy),
        }
    }
}

// ============================================================================
// Evaluation results
// ============================================================================

/// One (candidate, judge) scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleEvalResult {
    pub id: Uuid,
    pub run_id: RunId,
    pub candidate_id: CandidateId,
    pub judge: String,
    /// Per-criterion scores; empty when the evaluation failed.
    pub scores: BTreeMap<String, i64>,
    pub mean_score: Option<f64>,
    pub attempts: u32,
    /// Failure marker with reason.
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl SingleEvalResult {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

/// Which pairwise pass produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairwiseStage {
    PreCombine,
    PostCombine,
}

impl PairwiseStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PairwiseStage::PreCombine => "pre_combine",
            PairwiseStage::PostCombine => "post_combine",
        }
    }

    /// Phase marker the stage runs under.
    pub fn run_phase(&self) -> RunPhase {
        match self {
            PairwiseStage::PreCombine => RunPhase::EvaluatingPairwise,
            PairwiseStage::PostCombine => RunPhase::EvaluatingPostCombine,
        }
    }
}

impl fmt::Display for PairwiseStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Verdict of one comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PairwiseOutcome {
    WinnerA,
    WinnerB,
    Tie,
    /// The judge could not produce a usable verdict; ratings are left untouched.
    Inconclusive { reason: String },
}

/// One (A, B, judge) comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseResult {
    pub id: Uuid,
    pub run_id: RunId,
    pub stage: PairwiseStage,
    pub candidate_a: CandidateId,
    pub candidate_b: CandidateId,
    pub judge: String,
    pub outcome: PairwiseOutcome,
    pub rationale: String,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

impl PairwiseResult {
    /// Winning candidate, `None` for ties and inconclusive comparisons.
    pub fn winner(&self) -> Option<&CandidateId> {
        match self.outcome {
            PairwiseOutcome::WinnerA => Some(&self.candidate_a),
            PairwiseOutcome::WinnerB => Some(&self.candidate_b),
            PairwiseOutcome::Tie | PairwiseOutcome::Inconclusive { .. } => None,
        }
    }

    pub fn is_conclusive(&self) -> bool {
        !matches!(self.outcome, PairwiseOutcome::Inconclusive { .. })
    }
}

/// Output of the combine phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedDocument {
    pub id: CandidateId,
    pub run_id: RunId,
    pub source_ids: Vec<CandidateId>,
    pub strategy: CombineStrategy,
    pub content: String,
    pub cost: f64,
    pub seq: u64,
    pub created_at: DateTime<Utc>,
}

impl CombinedDocument {
    pub fn candidate_id(strategy: CombineStrategy) -> CandidateId {
        format!("combined-{}", strategy)
    }

    /// The combined document as a fresh evaluation candidate.
    pub fn candidate(&self) -> Candidate {
        Candidate {
            id: self.id.clone(),
            seq: self.seq,
            origin: CandidateOrigin::Combined {
                strategy: self.strategy,
                sources: self.source_ids.clone(),
            },
            content: self.content.clone(),
        }
    }
}
