//! Generation client
//!
//! The engine's view of the code-generating service. Every outcome of a
//! generation call is one of [`Generation`]'s variants; explicit provider
//! refusals and phrase-matched refusals both come back as
//! [`Generation::Refused`]. Transport failures are plain errors.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::prompts::{evolve_prompt, sanitize_prompt, spawn_prompt, SYSTEM_PROMPT};
use super::provider::{LLMProvider, ProviderRefusal};
use super::refusal::RefusalDetector;
use crate::sandbox::Sandbox;
use crate::utils::excerpt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Generation {
    Code(String),
    Refused { reason: String },
    /// The call succeeded but produced nothing usable.
    Empty,
}

/// A benign identity and body offered in place of a refused request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replacement {
    pub path: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvolveRequest {
    pub path: String,
    pub code: String,
    pub last_error: Option<String>,
    pub failures: u64,
    pub uses: u64,
    pub capabilities: Vec<String>,
}

#[async_trait]
pub trait GenerationClient: Send + Sync {
    /// New code for an endpoint that does not exist yet.
    async fn generate(&self, path: &str, capabilities: &[String]) -> Result<Generation>;

    /// A harmless replacement for a refused request.
    async fn sanitize(&self, path: &str, capabilities: &[String]) -> Result<Replacement>;

    /// Rewrite of a failing endpoint.
    async fn evolve(&self, request: EvolveRequest) -> Result<Generation>;
}

/// Remove a surrounding markdown fence, if any, and trim.
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string (```js) along with the opening fence.
    let body = rest.split_once('\n').map(|(_, body)| body).unwrap_or("");
    let body = body.trim_end();
    body.strip_suffix("```").unwrap_or(body).trim().to_string()
}

/// Normalise a replacement path: leading `/`, never the refused path.
pub fn replacement_path(requested: &str, proposed: &str) -> String {
    let proposed = proposed.trim();
    let mut path = if proposed.starts_with('/') {
        proposed.to_string()
    } else {
        format!("/{}", proposed)
    };
    if path == "/" {
        path = requested.to_string();
    }
    if path == requested {
        path = format!("{}-reformed", requested.trim_end_matches('/'));
    }
    path
}

pub struct LlmGenerationClient {
    provider: Arc<dyn LLMProvider>,
    model: String,
    detector: RefusalDetector,
    /// Bodies this sandbox rejects are reported as [`Generation::Empty`].
    sandbox: Option<Arc<dyn Sandbox>>,
}

impl LlmGenerationClient {
    pub fn new(provider: Arc<dyn LLMProvider>, model: impl Into<String>, detector: RefusalDetector) -> Self {
        Self {
            provider,
            model: model.into(),
            detector,
            sandbox: None,
        }
    }

    pub fn with_sandbox(mut self, sandbox: Arc<dyn Sandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    fn validate(&self, code: &str) -> Result<()> {
        match &self.sandbox {
            Some(sandbox) => sandbox.validate(code).map_err(|e| anyhow!(e)),
            None => Ok(()),
        }
    }

    async fn ask(&self, prompt: String) -> Result<String> {
        self.provider
            .generate(&self.model, prompt, Some(SYSTEM_PROMPT.to_string()))
            .await
    }

    fn classify(&self, response: Result<String>) -> Result<Generation> {
        let text = match response {
            Ok(text) => text,
            Err(e) => {
                if let Some(refusal) = e.downcast_ref::<ProviderRefusal>() {
                    return Ok(Generation::Refused { reason: refusal.0.clone() });
                }
                return Err(e);
            }
        };

        if let Some(phrase) = self.detector.detect(&text) {
            warn!("Refusal phrase \"{}\" in generated output: {}", phrase, excerpt(&text, 80));
            return Ok(Generation::Refused {
                reason: excerpt(text.trim(), 120),
            });
        }

        let code = strip_code_fences(&text);
        if code.is_empty() {
            return Ok(Generation::Empty);
        }
        if let Err(e) = self.validate(&code) {
            warn!("Discarding generated code that cannot run ({}): {}", e, excerpt(&code, 80));
            return Ok(Generation::Empty);
        }
        Ok(Generation::Code(code))
    }

    fn parse_replacement(&self, requested: &str, text: &str) -> Result<Replacement> {
        let start = text.find('{').context("Sanitize response contains no JSON object")?;
        let end = text.rfind('}').context("Sanitize response contains no JSON object")?;
        if end < start {
            bail!("Sanitize response contains no JSON object");
        }

        let raw: Replacement = serde_json::from_str(&text[start..=end])
            .with_context(|| format!("Failed to parse sanitize response: {}", excerpt(text, 200)))?;

        let code = strip_code_fences(&raw.code);
        if code.is_empty() {
            bail!("Sanitize response for {} has empty code", requested);
        }
        if self.detector.is_refusal(&code) {
            bail!("Sanitize response for {} was itself a refusal", requested);
        }
        self.validate(&code)
            .with_context(|| format!("Sanitize response for {} is not runnable", requested))?;

        Ok(Replacement {
            path: replacement_path(requested, &raw.path),
            code,
        })
    }
}

#[async_trait]
impl GenerationClient for LlmGenerationClient {
    async fn generate(&self, path: &str, capabilities: &[String]) -> Result<Generation> {
        debug!("Generating code for {}", path);
        let response = self.ask(spawn_prompt(path, capabilities)).await;
        self.classify(response)
            .with_context(|| format!("Generation request for {} failed", path))
    }

    async fn sanitize(&self, path: &str, capabilities: &[String]) -> Result<Replacement> {
        debug!("Requesting sanitized replacement for {}", path);
        let text = match self.ask(sanitize_prompt(path, capabilities)).await {
            Ok(text) => text,
            Err(e) => {
                if let Some(refusal) = e.downcast_ref::<ProviderRefusal>() {
                    return Err(anyhow!("Sanitize request for {} was refused: {}", path, refusal.0));
                }
                return Err(e.context(format!("Sanitize request for {} failed", path)));
            }
        };
        self.parse_replacement(path, &text)
    }

    async fn evolve(&self, request: EvolveRequest) -> Result<Generation> {
        debug!("Requesting evolution of {}", request.path);
        let response = self.ask(evolve_prompt(&request)).await;
        self.classify(response)
            .with_context(|| format!("Evolution request for {} failed", request.path))
    }
}
