//! Run orchestration: lifecycle state machine, cancellation, progress
//! reporting, startup recovery and the run service.

pub mod cancel;
#[allow(clippy::module_inception)]
pub mod orchestrator;
pub mod progress;
pub mod recovery;
pub mod service;

pub use cancel::{CancelHandle, CancelSignal};
pub use orchestrator::{OrchestratorError, RunOrchestrator, Standings};
pub use progress::{ProgressCounters, ProgressMonitor};
pub use recovery::{RecoveryError, RecoveryManager, RecoveryReport, INTERRUPTED_SUMMARY};
pub use service::{RunService, RunView};
