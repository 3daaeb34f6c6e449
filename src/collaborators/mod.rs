//! External collaborators a run depends on.
//!
//! A [`Generator`] turns a source document into candidate text with one
//! model; a [`Judge`] scores one candidate or compares two. Both are traits so
//! the orchestrator can be driven by LLM-backed implementations in production
//! and by scripted fakes in tests.

pub mod llm_generator;
pub mod llm_judge;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CallError, JudgeError};
use crate::run::{Candidate, CandidateId, Criterion, JudgeSpec, ModelSpec, RunId, SourceDocument};

pub use crate::evaluation::parser::{ScoreSet, Verdict, VerdictWinner};
pub use llm_generator::LlmGenerator;
pub use llm_judge::LlmJudge;

/// One unit of generation work: a document rendered by one model.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationTask {
    pub run_id: RunId,
    pub candidate_id: CandidateId,
    pub document: SourceDocument,
    pub model: ModelSpec,
    pub iteration: u32,
    /// Creation ordinal assigned when the task is planned.
    pub seq: u64,
}

/// What a generator reports for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorReply {
    pub content: String,
    pub success: bool,
    pub cost: f64,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl GeneratorReply {
    /// A successful reply stamped now.
    pub fn succeeded(content: impl Into<String>, cost: f64, started_at: DateTime<Utc>) -> Self {
        Self {
            content: content.into(),
            success: true,
            cost,
            started_at,
            completed_at: Utc::now(),
            error: None,
        }
    }

    /// A reply carrying an explicit failure status.
    pub fn failed(error: impl Into<String>, cost: f64, started_at: DateTime<Utc>) -> Self {
        Self {
            content: String::new(),
            success: false,
            cost,
            started_at,
            completed_at: Utc::now(),
            error: Some(error.into()),
        }
    }
}

/// Produces candidate text for a document with one model.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generates content for `task`.
    ///
    /// Implementations should never report `success` with empty content, but
    /// callers must not rely on it.
    async fn generate(&self, task: &GenerationTask) -> Result<GeneratorReply, CallError>;
}

/// Scores and compares candidates against a rubric.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Scores one candidate on every criterion.
    async fn score(
        &self,
        judge: &JudgeSpec,
        candidate: &Candidate,
        criteria: &[Criterion],
    ) -> Result<ScoreSet, JudgeError>;

    /// Picks the better of two candidates; `a` is always presented first.
    async fn compare(
        &self,
        judge: &JudgeSpec,
        a: &Candidate,
        b: &Candidate,
        criteria: &[Criterion],
    ) -> Result<Verdict, JudgeError>;
}

/// Renders the rubric block shared by scoring and comparison prompts.
pub(crate) fn render_rubric(criteria: &[Criterion]) -> String {
    criteria
        .iter()
        .map(|c| {
            if c.description.is_empty() {
                format!("- {} ({}-{})", c.name, c.min, c.max)
            } else {
                format!("- {} ({}-{}): {}", c.name, c.min, c.max, c.description)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
