//! Append-only timeline of run, phase and task events.
//!
//! Every phase transition and every unit task of a run emits exactly one
//! [`TimelineEvent`]. Events are never mutated after creation and the store
//! returns them in insertion order, which is how a run's narrative is
//! reconstructed after the fact.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::{RunId, RunPhase};
use crate::storage::{RunStore, StoreError};

/// Scope an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelinePhase {
    /// Run lifecycle events (start, cancel, finalize, recovery).
    Run,
    Generation,
    SingleEval,
    PairwiseEval,
    Combine,
    PostCombineEval,
}

impl TimelinePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelinePhase::Run => "run",
            TimelinePhase::Generation => "generation",
            TimelinePhase::SingleEval => "single_eval",
            TimelinePhase::PairwiseEval => "pairwise_eval",
            TimelinePhase::Combine => "combine",
            TimelinePhase::PostCombineEval => "post_combine_eval",
        }
    }
}

impl From<RunPhase> for TimelinePhase {
    fn from(phase: RunPhase) -> Self {
        match phase {
            RunPhase::Generating => TimelinePhase::Generation,
            RunPhase::EvaluatingSingle => TimelinePhase::SingleEval,
            RunPhase::EvaluatingPairwise => TimelinePhase::PairwiseEval,
            RunPhase::Combining => TimelinePhase::Combine,
            RunPhase::EvaluatingPostCombine => TimelinePhase::PostCombineEval,
        }
    }
}

impl fmt::Display for TimelinePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Kind of event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineEventType {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,
    RunRecovered,
    PhaseStarted,
    PhaseCompleted,
    /// The phase was toggled off or had nothing to work on.
    PhaseSkipped,
    /// A unit task resolved (successfully or not).
    TaskCompleted,
    /// A unit task was never dispatched, with the reason in the description.
    TaskSkipped,
}

impl TimelineEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimelineEventType::RunStarted => "run_started",
            TimelineEventType::RunCompleted => "run_completed",
            TimelineEventType::RunFailed => "run_failed",
            TimelineEventType::RunCancelled => "run_cancelled",
            TimelineEventType::RunRecovered => "run_recovered",
            TimelineEventType::PhaseStarted => "phase_started",
            TimelineEventType::PhaseCompleted => "phase_completed",
            TimelineEventType::PhaseSkipped => "phase_skipped",
            TimelineEventType::TaskCompleted => "task_completed",
            TimelineEventType::TaskSkipped => "task_skipped",
        }
    }
}

impl fmt::Display for TimelineEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One immutable timeline entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: Uuid,
    pub run_id: RunId,
    pub phase: TimelinePhase,
    pub event_type: TimelineEventType,
    pub description: String,
    /// Model or judge identity, when the event concerns an external call.
    pub actor: Option<String>,
    /// Candidate or document the event concerns.
    pub subject: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub success: bool,
    /// Failure reason; always non-empty when `success` is false.
    pub error: Option<String>,
    /// Phase-specific payload.
    pub details: serde_json::Value,
}

impl TimelineEvent {
    /// Creates a successful event stamped now.
    pub fn new(
        run_id: RunId,
        phase: TimelinePhase,
        event_type: TimelineEventType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            run_id,
            phase,
            event_type,
            description: description.into(),
            actor: None,
            subject: None,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            success: true,
            error: None,
            details: serde_json::Value::Null,
        }
    }

    /// Creates a `PhaseStarted` event.
    pub fn phase_started(run_id: RunId, phase: RunPhase, planned_tasks: usize) -> Self {
        Self::new(
            run_id,
            phase.into(),
            TimelineEventType::PhaseStarted,
            format!("{} started with {} task(s)", phase, planned_tasks),
        )
        .with_details(serde_json::json!({ "planned_tasks": planned_tasks }))
    }

    /// Creates a `PhaseCompleted` event spanning from `started_at` until now.
    pub fn phase_completed(
        run_id: RunId,
        phase: RunPhase,
        started_at: DateTime<Utc>,
        summary: impl Into<String>,
    ) -> Self {
        Self::new(
            run_id,
            phase.into(),
            TimelineEventType::PhaseCompleted,
            summary,
        )
        .with_window(started_at, Utc::now())
    }

    /// Creates a `PhaseSkipped` event.
    pub fn phase_skipped(run_id: RunId, phase: RunPhase, reason: impl Into<String>) -> Self {
        Self::new(
            run_id,
            phase.into(),
            TimelineEventType::PhaseSkipped,
            reason,
        )
    }

    /// Creates a `TaskSkipped` event for a unit that was never dispatched.
    pub fn task_skipped(
        run_id: RunId,
        phase: RunPhase,
        subject: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        Self::new(
            run_id,
            phase.into(),
            TimelineEventType::TaskSkipped,
            format!("skipped: {}", reason),
        )
        .with_subject(subject)
    }

    /// Creates a `TaskCompleted` event for a resolved unit task.
    pub fn task_completed(
        run_id: RunId,
        phase: RunPhase,
        description: impl Into<String>,
        started_at: DateTime<Utc>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        Self::new(
            run_id,
            phase.into(),
            TimelineEventType::TaskCompleted,
            description,
        )
        .with_window(started_at, completed_at)
    }

    /// Creates a run lifecycle event.
    pub fn run_event(
        run_id: RunId,
        event_type: TimelineEventType,
        description: impl Into<String>,
    ) -> Self {
        Self::new(run_id, TimelinePhase::Run, event_type, description)
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn with_window(mut self, started_at: DateTime<Utc>, completed_at: DateTime<Utc>) -> Self {
        self.started_at = started_at;
        self.completed_at = Some(completed_at);
        self.duration_ms = Some((completed_at - started_at).num_milliseconds());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Marks the event failed. A blank reason is replaced so failures always explain themselves.
    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        self.success = false;
        self.error = Some(if reason.trim().is_empty() {
            "unspecified failure".to_string()
        } else {
            reason
        });
        self
    }
}

/// Appends timeline events for one run.
#[derive(Clone)]
pub struct TimelineRecorder {
    run_id: RunId,
    store: Arc<dyn RunStore>,
}

impl TimelineRecorder {
    pub fn new(run_id: RunId, store: Arc<dyn RunStore>) -> Self {
        Self { run_id, store }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Persists an event.
    pub async fn record(&self, event: TimelineEvent) -> Result<(), StoreError> {
        debug_assert_eq!(event.run_id, self.run_id);
        tracing::debug!(
            run_id = %self.run_id,
            phase = %event.phase,
            event_type = %event.event_type,
            success = event.success,
            "{}",
            event.description
        );
        self.store.append_timeline_event(&event).await
    }

    /// Events recorded so far, in insertion order.
    pub async fn events(&self) -> Result<Vec<TimelineEvent>, StoreError> {
        self.store.list_timeline(self.run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryRunStore;

    #[test]
    fn test_failed_event_always_has_reason() {
        let event = TimelineEvent::new(
            Uuid::new_v4(),
            TimelinePhase::Generation,
            TimelineEventType::TaskCompleted,
            "generation",
        )
        .failed("  ");
        assert!(!event.success);
        assert_eq!(event.error.as_deref(), Some("unspecified failure"));
    }

    #[test]
    fn test_window_sets_duration() {
        let start = Utc::now();
        let end = start + chrono::Duration::milliseconds(1500);
        let event = TimelineEvent::task_completed(
            Uuid::new_v4(),
            RunPhase::Generating,
            "generated",
            start,
            end,
        );
        assert_eq!(event.duration_ms, Some(1500));
        assert_eq!(event.phase, TimelinePhase::Generation);
        assert!(event.success);
    }

    #[test]
    fn test_task_skipped_carries_subject() {
        let event = TimelineEvent::task_skipped(
            Uuid::new_v4(),
            RunPhase::EvaluatingSingle,
            "doc-1::p/m::1",
            "empty content",
        );
        assert_eq!(event.event_type, TimelineEventType::TaskSkipped);
        assert_eq!(event.subject.as_deref(), Some("doc-1::p/m::1"));
        assert!(event.description.contains("empty content"));
    }

    #[tokio::test]
    async fn test_recorder_preserves_insertion_order() {
        let store: Arc<dyn RunStore> = Arc::new(InMemoryRunStore::new());
        let run_id = Uuid::new_v4();
        let recorder = TimelineRecorder::new(run_id, store);

        for phase in RunPhase::all() {
            recorder
                .record(TimelineEvent::phase_started(run_id, phase, 1))
                .await
                .unwrap();
        }

        let events = recorder.events().await.unwrap();
        let phases: Vec<TimelinePhase> = events.iter().map(|e| e.phase).collect();
        assert_eq!(
            phases,
            vec![
                TimelinePhase::Generation,
                TimelinePhase::SingleEval,
                TimelinePhase::PairwiseEval,
                TimelinePhase::Combine,
                TimelinePhase::PostCombineEval,
            ]
        );
    }
}
