//! Generator backed by a chat-completions provider.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use super::{GenerationTask, Generator, GeneratorReply};
use crate::error::CallError;
use crate::llm::{GenerationRequest, LlmProvider, Message, PricingTable};

const GENERATION_SYSTEM_PROMPT: &str = "You are a careful technical writer. \
Produce a complete, well-structured markdown document that fulfils the request. \
Use headings for major sections. Output only the document.";

/// Generates candidate documents by prompting the task's model.
pub struct LlmGenerator {
    provider: Arc<dyn LlmProvider>,
    pricing: PricingTable,
    temperature: f64,
    max_tokens: Option<u32>,
}

impl LlmGenerator {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            pricing: PricingTable::default(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_pricing(mut self, pricing: PricingTable) -> Self {
        self.pricing = pricing;
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn build_request(&self, task: &GenerationTask) -> GenerationRequest {
        let mut prompt = String::new();
        if let Some(title) = &task.document.title {
            prompt.push_str(&format!("# {}\n\n", title));
        }
        prompt.push_str(&task.document.content);

        let request = GenerationRequest::new(
            task.model.id(),
            vec![
                Message::system(GENERATION_SYSTEM_PROMPT),
                Message::user(prompt),
            ],
        )
        .with_temperature(self.temperature);

        match self.max_tokens {
            Some(max) => request.with_max_tokens(max),
            None => request,
        }
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn generate(&self, task: &GenerationTask) -> Result<GeneratorReply, CallError> {
        let started_at = Utc::now();
        let response = self.provider.generate(self.build_request(task)).await?;
        let cost = self.pricing.cost(&task.model.id(), &response.usage);

        let finish_reason = response
            .choices
            .first()
            .map(|c| c.finish_reason.clone())
            .unwrap_or_default();
        let content = response.first_content().unwrap_or_default();

        if content.trim().is_empty() {
            return Ok(GeneratorReply::failed(
                format!("model returned no text (finish_reason: '{}')", finish_reason),
                cost,
                started_at,
            ));
        }

        Ok(GeneratorReply::succeeded(content, cost, started_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{Choice, GenerationResponse, Usage};
    use crate::run::{ModelSpec, SourceDocument};
    use std::sync::Mutex;
    use uuid::Uuid;

    struct FixedProvider {
        result: Mutex<Option<Result<String, LlmError>>>,
        seen_model: Mutex<Option<String>>,
    }

    impl FixedProvider {
        fn new(result: Result<String, LlmError>) -> Self {
            Self {
                result: Mutex::new(Some(result)),
                seen_model: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl LlmProvider for FixedProvider {
        async fn generate(
            &self,
            request: GenerationRequest,
        ) -> Result<GenerationResponse, LlmError> {
            *self.seen_model.lock().unwrap() = Some(request.model.clone());
            let content = self
                .result
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Ok(String::new()))?;
            Ok(GenerationResponse {
                id: "gen-1".to_string(),
                model: request.model,
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(content),
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

    fn task() -> GenerationTask {
        let model = ModelSpec::new("openai", "gpt-4o");
        GenerationTask {
            run_id: Uuid::new_v4(),
            candidate_id: "doc-1::openai/gpt-4o::1".to_string(),
            document: SourceDocument::new("doc-1", "Explain tides").with_title("Tides"),
            model,
            iteration: 1,
            seq: 0,
        }
    }

    #[tokio::test]
    async fn test_successful_generation_is_priced() {
        let provider = Arc::new(FixedProvider::new(Ok("# Tides\nThe moon...".to_string())));
        let generator = LlmGenerator::new(provider.clone());

        let reply = generator.generate(&task()).await.unwrap();
        assert!(reply.success);
        assert!(reply.content.starts_with("# Tides"));
        assert!((reply.cost - 2.5).abs() < 1e-9);
        assert_eq!(
            provider.seen_model.lock().unwrap().as_deref(),
            Some("openai/gpt-4o")
        );
    }

    #[tokio::test]
    async fn test_blank_completion_reports_failure() {
        let generator = LlmGenerator::new(Arc::new(FixedProvider::new(Ok("  ".to_string()))));
        let reply = generator.generate(&task()).await.unwrap();
        assert!(!reply.success);
        assert!(reply.error.unwrap().contains("no text"));
    }

    #[tokio::test]
    async fn test_provider_error_maps_to_call_error() {
        let generator = LlmGenerator::new(Arc::new(FixedProvider::new(Err(
            LlmError::RateLimited("slow down".to_string()),
        ))));
        let err = generator.generate(&task()).await.unwrap_err();
        assert!(err.is_transient());
    }
}
