//! Run records and run configuration.

pub mod config;
pub mod model;

pub use config::{
    CombineSettings, CombineStrategy, Criterion, JudgeSpec, ModelSpec, PhaseToggles, RunConfig,
    SourceDocument,
};
pub use model::{
    Candidate, CandidateId, CandidateOrigin, CombinedDocument, GeneratedDocument,
    GenerationOutcome, PairwiseOutcome, PairwiseResult, PairwiseStage, PhaseProgress, Run,
    RunId, RunPhase, RunProgress, RunStatus, SingleEvalResult, TransitionError,
};
