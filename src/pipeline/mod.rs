//! Process-level configuration for the evaluation engine.
//!
//! # Example
//!
//! ```rust,ignore
//! use evalforge::pipeline::EngineConfig;
//! use std::time::Duration;
//!
//! // Via builder pattern
//! let config = EngineConfig::new()
//!     .with_generation_timeout(Duration::from_secs(300))
//!     .with_default_concurrency(4, 8)
//!     .with_database_url("sqlite://runs.db");
//!
//! // Via environment variables
//! let config = EngineConfig::from_env()?;
//! ```

pub mod config;

pub use config::{ConfigError, EngineConfig};
