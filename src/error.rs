//! Error types shared across the evaluation pipeline.
//!
//! Defines the error taxonomy for every external call made by a run:
//! - HTTP-level LLM client failures
//! - Generator/Judge call failures (transient vs. permanent)
//! - Malformed judge responses
//! - Generation outcomes that must never count as success
//! - Combine phase preconditions

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during LLM HTTP operations.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: LITELLM_API_KEY or OPENROUTER_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("Missing API base URL: LITELLM_API_BASE environment variable not set")]
    MissingApiBase,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Context length exceeded: {limit} tokens")]
    ContextLengthExceeded { limit: u32 },

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("HTTP client construction failed: {0}")]
    ClientBuild(String),
}

/// Failure of a single call to an external Generator or Judge.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CallError {
    /// The call did not finish within its per-call timeout.
    #[error("Call timed out after {limit:?}")]
    Timeout { limit: Duration },

    /// The provider asked us to slow down.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Transport-level failure (connection reset, DNS, 5xx).
    #[error("Network failure: {0}")]
    Network(String),

    /// The provider rejected the request and retrying will not help.
    #[error("Provider error ({code}): {message}")]
    Provider { code: u16, message: String },

    /// The collaborator refused the request before calling out.
    #[error("Request rejected: {0}")]
    Rejected(String),
}

impl CallError {
    /// Whether the call site should retry with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            CallError::Timeout { .. } | CallError::RateLimited(_) | CallError::Network(_)
        )
    }

    /// Short label used for metrics and timeline details.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::Timeout { .. } => "timeout",
            CallError::RateLimited(_) => "rate_limited",
            CallError::Network(_) => "network",
            CallError::Provider { .. } => "provider",
            CallError::Rejected(_) => "rejected",
        }
    }
}

impl From<LlmError> for CallError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::RateLimited(msg) => CallError::RateLimited(msg),
            LlmError::RequestFailed(msg) => CallError::Network(msg),
            LlmError::ApiError { code, message } if code == 429 => CallError::RateLimited(message),
            LlmError::ApiError { code, message } if code == 408 || code >= 500 => {
                CallError::Network(format!("HTTP {}: {}", code, message))
            }
            LlmError::ApiError { code, message } => CallError::Provider { code, message },
            LlmError::ContextLengthExceeded { limit } => CallError::Provider {
                code: 400,
                message: format!("context length exceeded ({} tokens)", limit),
            },
            other => CallError::Rejected(other.to_string()),
        }
    }
}

/// Errors produced when a judge response cannot be turned into structured output.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ParseError {
    #[error("No JSON object found in judge response")]
    NoJson,

    #[error("Invalid JSON in judge response: {0}")]
    InvalidJson(String),

    #[error("Judge response is missing a score for criterion '{0}'")]
    MissingCriterion(String),

    #[error("Score {score} for criterion '{criterion}' is outside [{min}, {max}]")]
    OutOfRange {
        criterion: String,
        score: i64,
        min: i64,
        max: i64,
    },

    #[error("Unrecognized winner '{0}' in judge response")]
    UnknownWinner(String),
}

/// Errors returned by a [`crate::collaborators::Judge`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum JudgeError {
    #[error("Judge call failed: {0}")]
    Call(#[from] CallError),

    #[error("Judge response invalid: {0}")]
    Validation(#[from] ParseError),
}

/// Why a generation task did not produce usable content.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GenerationFailure {
    /// The generator reported (or implied) success but returned no text.
    #[error("Generator returned empty content{}", detail_suffix(.detail))]
    EmptyContent { detail: Option<String> },

    /// The call itself failed, after retries where applicable.
    #[error("{0}")]
    Call(#[from] CallError),

    /// The generator answered with an explicit failure status.
    #[error("Generator reported failure: {0}")]
    Reported(String),
}

fn detail_suffix(detail: &Option<String>) -> String {
    detail
        .as_deref()
        .map(|d| format!(": {}", d))
        .unwrap_or_default()
}

/// Errors from the combine phase.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CombineError {
    /// Fewer than two eligible inputs; the phase is skipped, not failed.
    #[error("Combine requires at least 2 eligible candidates, got {available}")]
    InsufficientCandidates { available: usize },

    /// The merge produced no text.
    #[error("Combine produced empty content")]
    EmptyOutput,

    /// The model-driven merge call failed.
    #[error("Merge call failed: {0}")]
    Merge(#[from] CallError),

    /// Intelligent merge was requested but no merge model is configured.
    #[error("Intelligent merge requires a merge model")]
    MergeModelMissing,
}

impl CombineError {
    /// Whether the phase should be recorded as skipped rather than failed.
    pub fn is_skip(&self) -> bool {
        matches!(self, CombineError::InsufficientCandidates { .. })
    }
}
