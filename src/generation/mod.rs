//! Generation phase: one candidate per source document, model and iteration.

pub mod dispatcher;

pub use dispatcher::{GenerationDispatcher, GenerationReport};
