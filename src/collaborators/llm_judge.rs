//! Judge backed by a chat-completions provider.
//!
//! The judge asks for a JSON answer and hands the raw text to the response
//! parser; provider payloads never leave this module.

use std::sync::Arc;

use async_trait::async_trait;

use super::{render_rubric, Judge, ScoreSet, Verdict};
use crate::error::{CallError, JudgeError};
use crate::evaluation::parser::{parse_scores, parse_verdict};
use crate::llm::{GenerationRequest, LlmProvider, Message, PricingTable};
use crate::run::{Candidate, Criterion, JudgeSpec};

const JUDGE_SYSTEM_PROMPT: &str = "You are an impartial evaluator of written documents. \
Answer with a single JSON object and nothing else.";

/// Judge that prompts the judge's model for structured verdicts.
pub struct LlmJudge {
    provider: Arc<dyn LlmProvider>,
    pricing: PricingTable,
    temperature: f64,
}

impl LlmJudge {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            pricing: PricingTable::default(),
            temperature: 0.0,
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

    /// Sends the prompt and returns the raw answer with its cost.
    async fn ask(&self, judge: &JudgeSpec, prompt: String) -> Result<(String, f64), CallError> {
        let model = judge.model.id();
        let request = GenerationRequest::new(
            model.clone(),
            vec![Message::system(JUDGE_SYSTEM_PROMPT), Message::user(prompt)],
        )
        .with_temperature(self.temperature);

        let response = self.provider.generate(request).await?;
        let cost = self.pricing.cost(&model, &response.usage);
        Ok((response.first_content().unwrap_or_default().to_string(), cost))
    }
}

fn score_prompt(candidate: &Candidate, criteria: &[Criterion]) -> String {
    let keys = criteria
        .iter()
        .map(|c| format!("\"{}\": <int>", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Score the document on each criterion using whole numbers.\n\n\
         Criteria:\n{}\n\n\
         Respond as {{\"scores\": {{{}}}, \"rationale\": \"<one paragraph>\"}}\n\n\
         <document>\n{}\n</document>",
        render_rubric(criteria),
        keys,
        candidate.content
    )
}

fn compare_prompt(a: &Candidate, b: &Candidate, criteria: &[Criterion]) -> String {
    format!(
        "Compare the two documents against the criteria and pick the better one.\n\n\
         Criteria:\n{}\n\n\
         Respond as {{\"winner\": \"A\" | \"B\" | \"tie\", \"rationale\": \"<one paragraph>\"}}\n\n\
         <document_a>\n{}\n</document_a>\n\n<document_b>\n{}\n</document_b>",
        render_rubric(criteria),
        a.content,
        b.content
    )
}

#[async_trait]
impl Judge for LlmJudge {
    async fn score(
        &self,
        judge: &JudgeSpec,
        candidate: &Candidate,
        criteria: &[Criterion],
    ) -> Result<ScoreSet, JudgeError> {
        let (raw, cost) = self.ask(judge, score_prompt(candidate, criteria)).await?;
        Ok(parse_scores(&raw, criteria)?.with_cost(cost))
    }

    async fn compare(
        &self,
        judge: &JudgeSpec,
        a: &Candidate,
        b: &Candidate,
        criteria: &[Criterion],
    ) -> Result<Verdict, JudgeError> {
        let (raw, cost) = self.ask(judge, compare_prompt(a, b, criteria)).await?;
        Ok(parse_verdict(&raw)?.with_cost(cost))
    }
}
