//! Combine phase: synthesize one document from the top-ranked candidates.
//!
//! Strategies are selected per run. Concatenation, best-of-N and section
//! assembly are pure text transforms; intelligent merge asks a model to
//! rewrite the inputs into one document and is the only strategy with cost.

pub mod sections;

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;

use crate::error::{CallError, CombineError};
use crate::evaluation::{with_timeout, RetryPolicy};
use crate::llm::{GenerationRequest, LlmProvider, Message, PricingTable};
use crate::metrics::MetricsCollector;
use crate::pipeline::EngineConfig;
use crate::run::{
    Candidate, CombineSettings, CombineStrategy, CombinedDocument, ModelSpec, RunId,
};

/// Separator placed between concatenated inputs.
pub const CONCATENATE_SEPARATOR: &str = "\n\n---\n\n";

const MERGE_SYSTEM_PROMPT: &str = "You merge several drafts of the same document into one. \
The drafts are ordered from strongest to weakest. Keep the structure of the strongest draft, \
fill gaps with material from the others, remove repetition and resolve contradictions in favor \
of the stronger draft. Output only the merged markdown document.";

/// Merged text and what producing it cost.
struct Merged {
    content: String,
    cost: f64,
}

/// Produces combined documents.
pub struct CombineEngine {
    merger: Option<Arc<dyn LlmProvider>>,
    pricing: PricingTable,
    timeout: Duration,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl CombineEngine {
    /// An engine without a merge model; intelligent merge is unavailable.
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            merger: None,
            pricing: PricingTable::default(),
            timeout: config.generation_timeout,
            retry: config.generation_retry(),
            metrics: MetricsCollector::new(),
        }
    }

    pub fn with_merger(mut self, merger: Arc<dyn LlmProvider>) -> Self {
        self.merger = Some(merger);
        self
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    /// Combines the top `settings.top_n` of `ranked` (best first).
    ///
    /// `seq` becomes the creation ordinal of the combined candidate.
    pub async fn combine(
        &self,
        run_id: RunId,
        ranked: &[Candidate],
        settings: &CombineSettings,
        seq: u64,
    ) -> Result<CombinedDocument, CombineError> {
        if ranked.len() < 2 {
            return Err(CombineError::InsufficientCandidates {
                available: ranked.len(),
            });
        }
        let inputs = &ranked[..settings.top_n.max(2).min(ranked.len())];

        tracing::info!(
            run_id = %run_id,
            strategy = %settings.strategy,
            inputs = inputs.len(),
            primary = %inputs[0].id,
            "Combining candidates"
        );

        let merged = match settings.strategy {
            CombineStrategy::Concatenate => Merged {
                content: inputs
                    .iter()
                    .map(|c| c.content.trim())
                    .collect::<Vec<_>>()
                    .join(CONCATENATE_SEPARATOR),
                cost: 0.0,
            },
            CombineStrategy::BestOfN => Merged {
                content: inputs[0].content.clone(),
                cost: 0.0,
            },
            CombineStrategy::SectionAssembly => {
                let others: Vec<&str> = inputs[1..].iter().map(|c| c.content.as_str()).collect();
                Merged {
                    content: sections::assemble(&inputs[0].content, &others),
                    cost: 0.0,
                }
            }
            CombineStrategy::IntelligentMerge => {
                let model = settings
                    .model
                    .as_ref()
                    .ok_or(CombineError::MergeModelMissing)?;
                self.merge_with_model(run_id, model, inputs).await?
            }
        };

        if merged.content.trim().is_empty() {
            return Err(CombineError::EmptyOutput);
        }

        Ok(CombinedDocument {
            id: CombinedDocument::candidate_id(settings.strategy),
            run_id,
            source_ids: inputs.iter().map(|c| c.id.clone()).collect(),
            strategy: settings.strategy,
            content: merged.content,
            cost: merged.cost,
            seq,
            created_at: Utc::now(),
        })
    }

    async fn merge_with_model(
        &self,
        run_id: RunId,
        model: &ModelSpec,
        inputs: &[Candidate],
    ) -> Result<Merged, CombineError> {
        let merger = self.merger.as_ref().ok_or_else(|| {
            CombineError::Merge(CallError::Rejected(
                "no merge provider configured".to_string(),
            ))
        })?;

        let mut prompt = String::new();
        for (rank, candidate) in inputs.iter().enumerate() {
            prompt.push_str(&format!(
                "## Draft {} ({})\n\n{}\n\n",
                rank + 1,
                candidate.id,
                candidate.content.trim()
            ));
        }

        let started = Instant::now();
        let attempted = self
            .retry
            .run("merge", |_| {
                let request = GenerationRequest::new(
                    model.id(),
                    vec![
                        Message::system(MERGE_SYSTEM_PROMPT),
                        Message::user(prompt.clone()),
                    ],
                )
                .with_temperature(0.3);
                with_timeout(self.timeout, async move {
                    merger.generate(request).await.map_err(CallError::from)
                })
            })
            .await;
        let latency = started.elapsed().as_secs_f64();

        let response = match attempted.result {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(
                    run_id = %run_id,
                    model = %model,
                    attempts = attempted.attempts,
                    error = %err,
                    "Merge call failed"
                );
                return Err(CombineError::Merge(err));
            }
        };

        let cost = self.pricing.cost(&model.id(), &response.usage);
        self.metrics.record_merge(latency, cost);

        Ok(Merged {
            content: response.first_content().unwrap_or_default().to_string(),
            cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationResponse, Usage};
    use crate::run::CandidateOrigin;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn candidate(id: &str, seq: u64, content: &str) -> Candidate {
        Candidate {
            id: id.to_string(),
            seq,
            origin: CandidateOrigin::Generated {
                source_document_id: "doc".to_string(),
                model: ModelSpec::new("p", id),
                iteration: 1,
            },
            content: content.to_string(),
        }
    }

    fn settings(strategy: CombineStrategy, top_n: usize) -> CombineSettings {
        CombineSettings {
            strategy,
            top_n,
            model: Some(ModelSpec::new("openai", "gpt-4o")),
        }
    }

    fn ranked() -> Vec<Candidate> {
        vec![
            candidate("best", 2, "# Intro\nBest intro.\n"),
            candidate("second", 0, "# Intro\nOkay intro.\n\n# Usage\nRun it.\n"),
            candidate("third", 1, "# Appendix\nExtra.\n"),
        ]
    }

    struct EchoMerger {
        calls: AtomicU32,
        reply: String,
    }

    #[async_trait]
    impl LlmProvider for EchoMerger {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.messages[1].content.contains("Draft 2 (second)"));
            Ok(GenerationResponse {
                id: "resp".to_string(),
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(self.reply.clone()),
                    finish_reason: "stop".to_string(),
                }],
                usage: Usage {
                    prompt_tokens: 1_000_000,
                    completion_tokens: 0,
                    total_tokens: 1_000_000,
                },
            })
        }
    }

    #[tokio::test]
    async fn test_fewer_than_two_inputs_is_an_error() {
        let engine = CombineEngine::new(&EngineConfig::new());
        let err = engine
            .combine(
                Uuid::new_v4(),
                &ranked()[..1],
                &settings(CombineStrategy::Concatenate, 2),
                3,
            )
            .await
            .unwrap_err();
        assert_eq!(err, CombineError::InsufficientCandidates { available: 1 });
        assert!(err.is_skip());
    }

    #[tokio::test]
    async fn test_concatenate_uses_top_n_in_rank_order() {
        let engine = CombineEngine::new(&EngineConfig::new());
        let doc = engine
            .combine(Uuid::new_v4(), &ranked(), &settings(CombineStrategy::Concatenate, 2), 3)
            .await
            .unwrap();
        assert_eq!(doc.id, "combined-concatenate");
        assert_eq!(doc.source_ids, vec!["best", "second"]);
        assert_eq!(
            doc.content,
            format!("# Intro\nBest intro.{}# Intro\nOkay intro.\n\n# Usage\nRun it.", CONCATENATE_SEPARATOR)
        );
        assert_eq!(doc.seq, 3);
        assert_eq!(doc.cost, 0.0);
    }

    #[tokio::test]
    async fn test_best_of_n_keeps_leader() {
        let engine = CombineEngine::new(&EngineConfig::new());
        let doc = engine
            .combine(Uuid::new_v4(), &ranked(), &settings(CombineStrategy::BestOfN, 3), 3)
            .await
            .unwrap();
        assert_eq!(doc.content, "# Intro\nBest intro.\n");
        assert_eq!(doc.candidate().content, doc.content);
    }

    #[tokio::test]
    async fn test_section_assembly_merges_headings() {
        let engine = CombineEngine::new(&EngineConfig::new());
        let doc = engine
            .combine(
                Uuid::new_v4(),
                &ranked(),
                &settings(CombineStrategy::SectionAssembly, 3),
                3,
            )
            .await
            .unwrap();
        assert_eq!(
            doc.content,
            "# Intro\nBest intro.\n\n# Usage\nRun it.\n\n# Appendix\nExtra."
        );
    }

    #[tokio::test]
    async fn test_intelligent_merge_calls_model() {
        let merger = Arc::new(EchoMerger {
            calls: AtomicU32::new(0),
            reply: "# Merged\nAll the best parts.".to_string(),
        });
        let engine = CombineEngine::new(&EngineConfig::new())
            .with_merger(merger.clone())
            .with_pricing(PricingTable::default().with_price(
                "openai/gpt-4o",
                crate::llm::ModelPrice::new(2.0, 4.0),
            ));
        let doc = engine
            .combine(
                Uuid::new_v4(),
                &ranked(),
                &settings(CombineStrategy::IntelligentMerge, 2),
                3,
            )
            .await
            .unwrap();
        assert_eq!(merger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(doc.content, "# Merged\nAll the best parts.");
        assert!((doc.cost - 2.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_intelligent_merge_failures() {
        let engine = CombineEngine::new(&EngineConfig::new());
        let mut no_model = settings(CombineStrategy::IntelligentMerge, 2);
        no_model.model = None;
        assert_eq!(
            engine
                .combine(Uuid::new_v4(), &ranked(), &no_model, 3)
                .await
                .unwrap_err(),
            CombineError::MergeModelMissing
        );

        assert!(matches!(
            engine
                .combine(
                    Uuid::new_v4(),
                    &ranked(),
                    &settings(CombineStrategy::IntelligentMerge, 2),
                    3
                )
                .await
                .unwrap_err(),
            CombineError::Merge(CallError::Rejected(_))
        ));

        let blank = Arc::new(EchoMerger {
            calls: AtomicU32::new(0),
            reply: "   ".to_string(),
        });
        let engine = CombineEngine::new(&EngineConfig::new()).with_merger(blank);
        assert_eq!(
            engine
                .combine(
                    Uuid::new_v4(),
                    &ranked(),
                    &settings(CombineStrategy::IntelligentMerge, 2),
                    3
                )
                .await
                .unwrap_err(),
            CombineError::EmptyOutput
        );
    }
}
