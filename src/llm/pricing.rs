//! Token pricing used to turn usage into per-call cost.

use std::collections::HashMap;

use super::litellm::Usage;

/// Price of one model in dollars per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

impl ModelPrice {
    pub fn new(input_per_1m: f64, output_per_1m: f64) -> Self {
        Self {
            input_per_1m,
            output_per_1m,
        }
    }

    /// Cost in dollars of a call with the given usage.
    pub fn cost(&self, usage: &Usage) -> f64 {
        (usage.prompt_tokens as f64 / 1_000_000.0) * self.input_per_1m
            + (usage.completion_tokens as f64 / 1_000_000.0) * self.output_per_1m
    }
}

/// Per-model prices with a fallback for unknown models.
#[derive(Debug, Clone)]
pub struct PricingTable {
    prices: HashMap<String, ModelPrice>,
    fallback: ModelPrice,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut table = Self::new(ModelPrice::new(1.0, 3.0));
        table.insert("openai/gpt-4o", ModelPrice::new(2.5, 10.0));
        table.insert("openai/gpt-4o-mini", ModelPrice::new(0.15, 0.6));
        table.insert("anthropic/claude-sonnet-4", ModelPrice::new(3.0, 15.0));
        table.insert("anthropic/claude-opus-4.5", ModelPrice::new(5.0, 25.0));
        table.insert("google/gemini-2.5-pro", ModelPrice::new(1.25, 10.0));
        table.insert("google/gemini-2.5-flash", ModelPrice::new(0.3, 2.5));
        table
    }
}

impl PricingTable {
    /// An empty table charging `fallback` for every model.
    pub fn new(fallback: ModelPrice) -> Self {
        Self {
            prices: HashMap::new(),
            fallback,
        }
    }

    pub fn insert(&mut self, model: impl Into<String>, price: ModelPrice) {
        self.prices.insert(model.into(), price);
    }

    pub fn with_price(mut self, model: impl Into<String>, price: ModelPrice) -> Self {
        self.insert(model, price);
        self
    }

    pub fn price(&self, model: &str) -> ModelPrice {
        self.prices.get(model).copied().unwrap_or(self.fallback)
    }

    /// Cost in dollars of a call to `model`.
    pub fn cost(&self, model: &str, usage: &Usage) -> f64 {
        self.price(model).cost(usage)
    }
}
