//! evalforge: multi-model generation and evaluation pipeline orchestrator.
//!
//! A run generates one candidate per source document, model and iteration,
//! scores every candidate with a panel of judges, ranks them head to head
//! with Elo ratings, merges the leaders into a combined document and checks
//! whether the merge beats the original winner.

// Core modules
pub mod cli;
pub mod collaborators;
pub mod combine;
pub mod error;
pub mod evaluation;
pub mod generation;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;
pub mod run;
pub mod storage;
pub mod timeline;

// Re-export commonly used error types
pub use error::{CallError, CombineError, GenerationFailure, JudgeError, LlmError, ParseError};

// Re-export the run surface
pub use orchestrator::{
    CancelHandle, OrchestratorError, RecoveryManager, RunOrchestrator, RunService, RunView,
};
pub use pipeline::{ConfigError, EngineConfig};
pub use run::{Run, RunConfig, RunId, RunStatus};
pub use storage::{InMemoryRunStore, RunStore, SqliteRunStore, StoreError};
pub use timeline::{TimelineEvent, TimelineRecorder};
