//! LLM providers
//!
//! Thin text-in/text-out adapters. A provider that receives an explicit
//! policy refusal from its backend returns [`ProviderRefusal`] inside the
//! error so callers can tell it apart from transport failures.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;

use crate::utils::truncate_middle;

pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 2048;

/// The backend declined the request on policy grounds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("provider refused: {0}")]
pub struct ProviderRefusal(pub String);

#[async_trait]
pub trait LLMProvider: Send + Sync {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String>;
}

pub struct OllamaProvider {
    client: ollama_rs::Ollama,
}

impl OllamaProvider {
    pub fn new(client: ollama_rs::Ollama) -> Self {
        Self { client }
    }

    /// `base_url` like `http://localhost:11434`
    pub fn from_url(base_url: &str) -> Result<Self> {
        let url = reqwest::Url::parse(base_url).with_context(|| format!("Invalid Ollama URL {}", base_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("Ollama URL must be http or https: {}", base_url);
        }
        let host = format!("{}://{}", url.scheme(), url.host_str().unwrap_or("localhost"));
        let client = ollama_rs::Ollama::builder()
            .host(host.as_str())
            .port(url.port().unwrap_or(11434))
            .build();
        Ok(Self::new(client))
    }
}

#[async_trait]
impl LLMProvider for OllamaProvider {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String> {
        use ollama_rs::generation::chat::{request::ChatMessageRequest, ChatMessage};

        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(ChatMessage::system(sys));
        }
        messages.push(ChatMessage::user(prompt));

        let res = self
            .client
            .send_chat_messages(ChatMessageRequest::new(model.to_string(), messages))
            .await
            .context("Ollama chat request failed")?;

        Ok(res.message.content)
    }
}

pub struct OpenAICompatibleProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl OpenAICompatibleProvider {
    pub fn new(base_url: String, api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl LLMProvider for OpenAICompatibleProvider {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String> {
        let mut messages = Vec::new();
        if let Some(sys) = system {
            messages.push(json!({ "role": "system", "content": sys }));
        }
        messages.push(json!({ "role": "user", "content": prompt }));

        let body = json!({
            "model": model,
            "messages": messages,
            "temperature": 0.7,
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.base_url.trim_end_matches('/')))
            .json(&body);

        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let res = request.send().await?.error_for_status()?;
        let json: serde_json::Value = res.json().await?;

        let choice = &json["choices"][0];
        if let Some(refusal) = choice["message"]["refusal"].as_str() {
            return Err(ProviderRefusal(refusal.to_string()).into());
        }
        if choice["finish_reason"].as_str() == Some("content_filter") {
            return Err(ProviderRefusal("content_filter".to_string()).into());
        }

        let content = choice["message"]["content"]
            .as_str()
            .context("Failed to parse content from OpenAI response")?;

        Ok(content.to_string())
    }
}

pub struct AnthropicProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl AnthropicProvider {
    pub fn new(api_key: String) -> Self {
        Self::with_base_url(ANTHROPIC_API_BASE.to_string(), api_key)
    }

    pub fn with_base_url(base_url: String, api_key: String) -> Self {
        Self {
            client: Client::new(),
            base_url,
            api_key,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicContent>,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum AnthropicContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: Option<String>,
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    async fn generate(&self, model: &str, prompt: String, system: Option<String>) -> Result<String> {
        let mut body = json!({
            "model": model,
            "max_tokens": MAX_TOKENS,
            "messages": [{ "role": "user", "content": prompt }],
        });
        if let Some(system) = system {
            body["system"] = json!(system);
        }

        tracing::debug!("Anthropic request to model {}", model);

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url.trim_end_matches('/')))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .context("Failed to send request to Anthropic")?;

        let status = response.status();
        let text = response.text().await.context("Failed to read Anthropic response")?;

        if !status.is_success() {
            if let Ok(err) = serde_json::from_str::<AnthropicError>(&text) {
                anyhow::bail!("Anthropic API error: {} ({:?})", err.error.message, err.error.error_type);
            }
            anyhow::bail!("Anthropic API error: {} {}", status, truncate_middle(&text, 400));
        }

        let response: AnthropicResponse = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse Anthropic response: {}", truncate_middle(&text, 200)))?;

        let content: String = response
            .content
            .iter()
            .filter_map(|part| match part {
                AnthropicContent::Text { text } => Some(text.as_str()),
                AnthropicContent::Other => None,
            })
            .collect();

        tracing::debug!(stop_reason = ?response.stop_reason, "Received Anthropic response");

        if response.stop_reason.as_deref() == Some("refusal") {
            let reason = if content.trim().is_empty() {
                "stop_reason=refusal".to_string()
            } else {
                content
            };
            return Err(ProviderRefusal(reason).into());
        }

        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_anthropic_response_shapes() {
        let parsed: AnthropicResponse = serde_json::from_str(
            r#"{"content":[{"type":"text","text":"return input"},{"type":"tool_use","id":"x","name":"y","input":{}}],"stop_reason":"end_turn"}"#,
        )
        .unwrap();
        assert_eq!(parsed.content.len(), 2);
        assert_eq!(parsed.stop_reason.as_deref(), Some("end_turn"));
    }

    #[test]
    fn test_refusal_survives_anyhow() {
        let err: anyhow::Error = ProviderRefusal("nope".to_string()).into();
        let err = err.context("while spawning");
        assert_eq!(err.downcast_ref::<ProviderRefusal>(), Some(&ProviderRefusal("nope".to_string())));
    }

    #[test]
    fn test_ollama_url_parsing() {
        assert!(OllamaProvider::from_url("http://localhost:11434").is_ok());
        assert!(OllamaProvider::from_url("not a url").is_err());
        assert!(OllamaProvider::from_url("mailto:ollama@localhost").is_err());
    }
}
