//! LLM integration for evalforge.
//!
//! Provides the chat-completions client used by the LLM-backed generator and
//! judge, plus the pricing table that turns token usage into cost.
//!
//! ```ignore
//! use evalforge::llm::{GenerationRequest, LiteLlmClient, LlmProvider, Message};
//!
//! let client = LiteLlmClient::from_env()?;
//! let request = GenerationRequest::new("openai/gpt-4o", vec![Message::user("Hello")]);
//! let response = client.generate(request).await?;
//! ```

pub mod litellm;
pub mod pricing;

pub use litellm::{
    Choice, GenerationRequest, GenerationResponse, LiteLlmClient, LlmProvider, Message, Usage,
    OPENROUTER_API_BASE,
};
pub use pricing::{ModelPrice, PricingTable};
