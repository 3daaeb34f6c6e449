//! Per-run configuration: documents, models, judges, criteria and phase toggles.
//!
//! Loaded from YAML by the CLI and stored as JSON alongside the run record.

use std::collections::HashSet;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::pipeline::ConfigError;

/// An input document to generate from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub content: String,
}

impl SourceDocument {
    pub fn new(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: None,
            content: content.into(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// A provider/model pair, written as `provider/model`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ModelSpec {
    pub provider: String,
    pub model: String,
}

impl ModelSpec {
    pub fn new(provider: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            model: model.into(),
        }
    }

    /// Stable identifier `provider/model`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.provider, self.model)
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

impl FromStr for ModelSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
                Ok(Self::new(provider.trim(), model.trim()))
            }
            _ => Err(format!("expected 'provider/model', got '{}'", s)),
        }
    }
}

impl TryFrom<String> for ModelSpec {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelSpec> for String {
    fn from(spec: ModelSpec) -> Self {
        spec.id()
    }
}

/// A judge: an identity plus the model that backs it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JudgeSpec {
    pub id: String,
    pub model: ModelSpec,
}

impl JudgeSpec {
    pub fn new(id: impl Into<String>, model: ModelSpec) -> Self {
        Self {
            id: id.into(),
            model,
        }
    }
}

fn default_min_score() -> i64 {
    1
}

fn default_max_score() -> i64 {
    5
}

/// A scoring criterion with an inclusive integer range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Criterion {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_min_score")]
    pub min: i64,
    #[serde(default = "default_max_score")]
    pub max: i64,
}

impl Criterion {
    /// A criterion scored on the default 1-5 scale.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            min: default_min_score(),
            max: default_max_score(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_range(mut self, min: i64, max: i64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn contains(&self, score: i64) -> bool {
        (self.min..=self.max).contains(&score)
    }
}

fn enabled() -> bool {
    true
}

/// Which optional phases run. Generation always runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseToggles {
    #[serde(default = "enabled")]
    pub single_eval: bool,
    #[serde(default = "enabled")]
    pub pairwise: bool,
    #[serde(default = "enabled")]
    pub combine: bool,
    #[serde(default = "enabled")]
    pub post_combine: bool,
}

impl Default for PhaseToggles {
    fn default() -> Self {
        Self {
            single_eval: true,
            pairwise: true,
            combine: true,
            post_combine: true,
        }
    }
}

/// How the combine phase merges its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineStrategy {
    /// Append inputs in rank order.
    Concatenate,
    /// Keep the top-ranked input as-is.
    BestOfN,
    /// Assemble sections by heading, preferring higher-ranked inputs.
    #[default]
    SectionAssembly,
    /// Ask a model to merge the inputs.
    IntelligentMerge,
}

impl CombineStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            CombineStrategy::Concatenate => "concatenate",
            CombineStrategy::BestOfN => "best_of_n",
            CombineStrategy::SectionAssembly => "section_assembly",
            CombineStrategy::IntelligentMerge => "intelligent_merge",
        }
    }
}

impl fmt::Display for CombineStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CombineStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "concatenate" => Ok(CombineStrategy::Concatenate),
            "best_of_n" => Ok(CombineStrategy::BestOfN),
            "section_assembly" => Ok(CombineStrategy::SectionAssembly),
            "intelligent_merge" => Ok(CombineStrategy::IntelligentMerge),
            other => Err(format!("unknown combine strategy '{}'", other)),
        }
    }
}

fn default_top_n() -> usize {
    2
}

/// Combine phase settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CombineSettings {
    #[serde(default)]
    pub strategy: CombineStrategy,
    /// Number of top-ranked candidates fed to the combiner.
    #[serde(default = "default_top_n")]
    pub top_n: usize,
    /// Model used by intelligent merge.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<ModelSpec>,
}

impl Default for CombineSettings {
    fn default() -> Self {
        Self {
            strategy: CombineStrategy::default(),
            top_n: default_top_n(),
            model: None,
        }
    }
}

fn default_generation_concurrency() -> usize {
    4
}

fn default_evaluation_concurrency() -> usize {
    8
}

fn default_iterations() -> u32 {
    1
}

/// Configuration of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub documents: Vec<SourceDocument>,
    pub models: Vec<ModelSpec>,
    pub judges: Vec<JudgeSpec>,
    pub criteria: Vec<Criterion>,
    #[serde(default)]
    pub phases: PhaseToggles,
    #[serde(default = "default_generation_concurrency")]
    pub generation_concurrency: usize,
    #[serde(default = "default_evaluation_concurrency")]
    pub evaluation_concurrency: usize,
    /// Generations per document x model pair.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub combine: CombineSettings,
}

impl RunConfig {
    pub fn new(
        documents: Vec<SourceDocument>,
        models: Vec<ModelSpec>,
        judges: Vec<JudgeSpec>,
        criteria: Vec<Criterion>,
    ) -> Self {
        Self {
            name: None,
            documents,
            models,
            judges,
            criteria,
            phases: PhaseToggles::default(),
            generation_concurrency: default_generation_concurrency(),
            evaluation_concurrency: default_evaluation_concurrency(),
            iterations: default_iterations(),
            combine: CombineSettings::default(),
        }
    }

    /// Parses a YAML run configuration and validates it.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: RunConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a YAML run configuration file and validates it.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Number of generation tasks the run plans.
    pub fn generation_task_count(&self) -> usize {
        self.documents.len() * self.models.len() * self.iterations as usize
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` describing the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.documents.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one document is required".to_string(),
            ));
        }

        if self.models.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one model is required".to_string(),
            ));
        }

        let evaluates = self.phases.single_eval || self.phases.pairwise || self.phases.post_combine;
        if evaluates && self.judges.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one judge is required when evaluation phases are enabled".to_string(),
            ));
        }

        if evaluates && self.criteria.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "at least one criterion is required when evaluation phases are enabled"
                    .to_string(),
            ));
        }

        if self.generation_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "generation_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.evaluation_concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "evaluation_concurrency must be greater than 0".to_string(),
            ));
        }

        if self.iterations == 0 {
            return Err(ConfigError::ValidationFailed(
                "iterations must be at least 1".to_string(),
            ));
        }

        if self.combine.top_n < 2 {
            return Err(ConfigError::ValidationFailed(
                "combine.top_n must be at least 2".to_string(),
            ));
        }

        if self.phases.combine
            && self.combine.strategy == CombineStrategy::IntelligentMerge
            && self.combine.model.is_none()
        {
            return Err(ConfigError::ValidationFailed(
                "combine.model is required for the intelligent_merge strategy".to_string(),
            ));
        }

        if self.documents.iter().any(|d| d.id.trim().is_empty()) {
            return Err(ConfigError::ValidationFailed(
                "document id cannot be empty".to_string(),
            ));
        }

        ensure_unique(self.documents.iter().map(|d| d.id.clone()), "document id")?;
        ensure_unique(self.models.iter().map(ModelSpec::id), "model")?;
        ensure_unique(self.judges.iter().map(|j| j.id.clone()), "judge id")?;
        ensure_unique(self.criteria.iter().map(|c| c.name.clone()), "criterion")?;

        for criterion in &self.criteria {
            if criterion.min >= criterion.max {
                return Err(ConfigError::ValidationFailed(format!(
                    "criterion '{}' must have min < max",
                    criterion.name
                )));
            }
        }

        Ok(())
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_phases(mut self, phases: PhaseToggles) -> Self {
        self.phases = phases;
        self
    }

    pub fn with_concurrency(mut self, generation: usize, evaluation: usize) -> Self {
        self.generation_concurrency = generation;
        self.evaluation_concurrency = evaluation;
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    pub fn with_combine(mut self, combine: CombineSettings) -> Self {
        self.combine = combine;
        self
    }
}

fn ensure_unique(ids: impl Iterator<Item = String>, what: &str) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id.clone()) {
            return Err(ConfigError::ValidationFailed(format!(
                "duplicate {} '{}'",
                what, id
            )));
        }
    }
    Ok(())
}
