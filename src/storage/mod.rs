//! Durable run records.
//!
//! One record per [`Run`] plus one per child entity, all keyed by run id. The
//! orchestrator persists the run (status, phase marker, progress) after each
//! phase and child records as soon as they resolve, so a run's position can be
//! reconstructed purely from the store.
//!
//! # Usage
//!
//! ```rust,ignore
//! use evalforge::storage::{RunStore, SqliteRunStore};
//!
//! let store = SqliteRunStore::connect("sqlite://runs.db").await?;
//! store.insert_run(&run).await?;
//! let timeline = store.list_timeline(run.id).await?;
//! ```

pub mod memory;
pub mod migrations;
pub mod schema;
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::evaluation::elo::EloRating;
use crate::run::{
    CombinedDocument, GeneratedDocument, PairwiseResult, PairwiseStage, Run, RunId, RunStatus,
    SingleEvalResult,
};
use crate::timeline::TimelineEvent;

pub use memory::InMemoryRunStore;
pub use migrations::{MigrationError, MigrationRunner};
pub use sqlite::SqliteRunStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    /// No run with this id.
    #[error("Run not found: {0}")]
    NotFound(RunId),

    /// The run already exists.
    #[error("Run already exists: {0}")]
    Duplicate(RunId),

    /// A terminal run cannot change status.
    #[error("Run {run_id} is {status}; only its summary can change")]
    TerminalRun { run_id: RunId, status: RunStatus },

    /// A stored value could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Persistence for runs and everything a run owns.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Inserts a new run record.
    async fn insert_run(&self, run: &Run) -> Result<(), StoreError>;

    /// Replaces a run record.
    ///
    /// When the stored run is terminal, only the summary is written and any
    /// attempt to change the status fails with [`StoreError::TerminalRun`].
    async fn update_run(&self, run: &Run) -> Result<(), StoreError>;

    async fn get_run(&self, run_id: RunId) -> Result<Run, StoreError>;

    /// All runs, oldest first.
    async fn list_runs(&self) -> Result<Vec<Run>, StoreError>;

    async fn list_runs_by_status(&self, status: RunStatus) -> Result<Vec<Run>, StoreError>;

    async fn save_generated_document(&self, doc: &GeneratedDocument) -> Result<(), StoreError>;

    /// Generated documents of a run in creation order.
    async fn list_generated_documents(
        &self,
        run_id: RunId,
    ) -> Result<Vec<GeneratedDocument>, StoreError>;

    async fn save_single_result(&self, result: &SingleEvalResult) -> Result<(), StoreError>;

    async fn list_single_results(&self, run_id: RunId)
        -> Result<Vec<SingleEvalResult>, StoreError>;

    async fn save_pairwise_result(&self, result: &PairwiseResult) -> Result<(), StoreError>;

    async fn list_pairwise_results(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
    ) -> Result<Vec<PairwiseResult>, StoreError>;

    /// Replaces the ratings of one pairwise stage.
    async fn save_elo_ratings(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
        ratings: &[EloRating],
    ) -> Result<(), StoreError>;

    async fn list_elo_ratings(
        &self,
        run_id: RunId,
        stage: PairwiseStage,
    ) -> Result<Vec<EloRating>, StoreError>;

    async fn save_combined_document(&self, doc: &CombinedDocument) -> Result<(), StoreError>;

    async fn get_combined_document(
        &self,
        run_id: RunId,
    ) -> Result<Option<CombinedDocument>, StoreError>;

    async fn append_timeline_event(&self, event: &TimelineEvent) -> Result<(), StoreError>;

    /// Timeline of a run in insertion order.
    async fn list_timeline(&self, run_id: RunId) -> Result<Vec<TimelineEvent>, StoreError>;
}

/// Applies the terminal-status guard shared by every store implementation.
///
/// Returns the record that should actually be written.
pub(crate) fn guarded_update(stored: &Run, incoming: &Run) -> Result<Run, StoreError> {
    if !stored.status.is_terminal() {
        return Ok(incoming.clone());
    }
    if incoming.status != stored.status {
        return Err(StoreError::TerminalRun {
            run_id: stored.id,
            status: stored.status,
        });
    }
    let mut kept = stored.clone();
    kept.summary = incoming.summary.clone();
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{Criterion, JudgeSpec, ModelSpec, RunConfig, SourceDocument};

    fn run() -> Run {
        Run::new(RunConfig::new(
            vec![SourceDocument::new("d", "x")],
            vec![ModelSpec::new("p", "m")],
            vec![JudgeSpec::new("j", ModelSpec::new("p", "m"))],
            vec![Criterion::new("c")],
        ))
    }

    #[test]
    fn test_guard_passes_non_terminal() {
        let stored = run();
        let mut incoming = stored.clone();
        incoming.mark_running().unwrap();
        let written = guarded_update(&stored, &incoming).unwrap();
        assert_eq!(written.status, RunStatus::Running);
    }

    #[test]
    fn test_guard_blocks_terminal_status_change() {
        let mut stored = run();
        stored.mark_running().unwrap();
        stored.mark_cancelled("user").unwrap();

        let mut incoming = stored.clone();
        incoming.status = RunStatus::Completed;
        let err = guarded_update(&stored, &incoming).unwrap_err();
        assert!(matches!(
            err,
            StoreError::TerminalRun {
                status: RunStatus::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn test_guard_keeps_only_summary_on_terminal() {
        let mut stored = run();
        stored.mark_running().unwrap();
        stored.mark_failed("boom").unwrap();

        let mut incoming = stored.clone();
        incoming.set_summary("boom, annotated");
        incoming.total_cost = 99.0;
        let written = guarded_update(&stored, &incoming).unwrap();
        assert_eq!(written.summary.as_deref(), Some("boom, annotated"));
        assert_eq!(written.total_cost, 0.0);
    }
}
