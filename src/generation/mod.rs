//! Generation Module
//!
//! Talks to the code-generating service: providers, prompts, refusal
//! detection and the [`GenerationClient`] contract the engine depends on.

pub mod client;
pub mod prompts;
pub mod provider;
pub mod refusal;

pub use client::{strip_code_fences, EvolveRequest, Generation, GenerationClient, LlmGenerationClient, Replacement};
pub use provider::{AnthropicProvider, LLMProvider, OllamaProvider, OpenAICompatibleProvider, ProviderRefusal};
pub use refusal::{RefusalDetector, DEFAULT_REFUSAL_PHRASES};
