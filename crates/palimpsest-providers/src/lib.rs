use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::sync::RwLock;

pub mod budget;
pub mod invoker;
#[cfg(any(test, feature = "test-util"))]
pub mod scripted;

pub use budget::{BudgetError, BudgetLedger, InvocationTicket};
pub use invoker::{clip_input, InvocationRequest, InvokeError, ModelInvoker, MAX_INPUT_CHARS};
#[cfg(any(test, feature = "test-util"))]
pub use scripted::{ScriptedOutcome, ScriptedProvider};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProviderEndpointConfig {
    pub api_key: Option<String>,
    pub url: Option<String>,
    #[serde(default)]
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderEndpointConfig>,
}

impl ProvidersConfig {
    /// Anthropic with its stock models, key taken from the environment.
    /// The registry stays empty when no key is present, which drives every
    /// agent down its deterministic fallback path.
    pub fn with_defaults() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "anthropic".to_string(),
            ProviderEndpointConfig {
                api_key: None,
                url: None,
                models: Vec::new(),
            },
        );
        Self { providers }
    }
}

/// Token counts as reported by the remote endpoint.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// One outbound request, already truncated and budgeted by the invoker.
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub model_id: String,
    pub system_prompt: String,
    pub user_input: String,
    pub image_base64: Option<String>,
    pub image_media_type: Option<String>,
    pub max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct ProviderError {
    pub status: Option<u16>,
    pub reason: String,
}

impl ProviderError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self {
            status: None,
            reason: reason.into(),
        }
    }

    pub fn http(status: u16, reason: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            reason: reason.into(),
        }
    }
}

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    fn serves(&self, model_id: &str) -> bool {
        self.info().models.iter().any(|m| m.id == model_id)
    }

    /// Whether this provider holds the credentials it needs to send a
    /// request at all.
    fn can_invoke(&self) -> bool {
        true
    }

    async fn complete(&self, call: &ModelCall) -> Result<Completion, ProviderError>;
}

#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<RwLock<Vec<Arc<dyn Provider>>>>,
}

impl ProviderRegistry {
    pub fn new(config: &ProvidersConfig) -> Self {
        Self {
            providers: Arc::new(RwLock::new(build_providers(config))),
        }
    }

    /// Registry over caller-supplied providers; the seam the engine and the
    /// tests use to install non-HTTP implementations.
    pub fn with_providers(providers: Vec<Arc<dyn Provider>>) -> Self {
        Self {
            providers: Arc::new(RwLock::new(providers)),
        }
    }

    pub async fn reload(&self, config: &ProvidersConfig) {
        *self.providers.write().await = build_providers(config);
    }

    pub async fn list(&self) -> Vec<ProviderInfo> {
        self.providers
            .read()
            .await
            .iter()
            .map(|p| p.info())
            .collect()
    }

    pub async fn registered_models(&self) -> Vec<ModelInfo> {
        self.providers
            .read()
            .await
            .iter()
            .flat_map(|p| p.info().models)
            .collect()
    }

    pub async fn for_model(&self, model_id: &str) -> Option<Arc<dyn Provider>> {
        self.providers
            .read()
            .await
            .iter()
            .find(|p| p.serves(model_id))
            .cloned()
    }
}

fn build_providers(config: &ProvidersConfig) -> Vec<Arc<dyn Provider>> {
    let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

    if let Some(anthropic) = config.providers.get("anthropic") {
        let models = if anthropic.models.is_empty() {
            vec![
                "claude-3-5-sonnet-latest".to_string(),
                "claude-3-5-haiku-latest".to_string(),
            ]
        } else {
            anthropic.models.clone()
        };
        providers.push(Arc::new(AnthropicProvider {
            api_key: resolve_api_key(anthropic.api_key.as_deref(), "ANTHROPIC_API_KEY"),
            base_url: normalize_base(
                anthropic.url.as_deref().unwrap_or("https://api.anthropic.com"),
            ),
            models,
            client: Client::new(),
        }));
    }

    if let Some(openai) = config.providers.get("openai") {
        let models = if openai.models.is_empty() {
            vec!["gpt-4o-mini".to_string()]
        } else {
            openai.models.clone()
        };
        providers.push(Arc::new(OpenAICompatibleProvider {
            id: "openai".to_string(),
            name: "OpenAI".to_string(),
            api_key: resolve_api_key(openai.api_key.as_deref(), "OPENAI_API_KEY"),
            base_url: normalize_base(openai.url.as_deref().unwrap_or("https://api.openai.com/v1")),
            models,
            client: Client::new(),
        }));
    }

    providers
}

fn resolve_api_key(configured: Option<&str>, env_name: &str) -> Option<String> {
    configured
        .filter(|key| !is_placeholder_api_key(key))
        .map(|key| key.to_string())
        .or_else(|| {
            std::env::var(env_name)
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
}

fn is_placeholder_api_key(value: &str) -> bool {
    let trimmed = value.trim();
    trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("x")
        || trimmed.eq_ignore_ascii_case("placeholder")
}

fn normalize_base(input: &str) -> String {
    input.trim_end_matches('/').to_string()
}

fn truncate_for_error(input: &str, max_len: usize) -> String {
    if input.len() <= max_len {
        input.to_string()
    } else {
        let cut = input
            .char_indices()
            .take_while(|(i, _)| *i <= max_len)
            .last()
            .map(|(i, _)| i)
            .unwrap_or(0);
        format!("{}...", &input[..cut])
    }
}

struct AnthropicProvider {
    api_key: Option<String>,
    base_url: String,
    models: Vec<String>,
    client: Client,
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "anthropic".to_string(),
            name: "Anthropic".to_string(),
            models: self
                .models
                .iter()
                .map(|id| ModelInfo {
                    id: id.clone(),
                    provider_id: "anthropic".to_string(),
                    display_name: id.clone(),
                })
                .collect(),
        }
    }

    fn can_invoke(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, call: &ModelCall) -> Result<Completion, ProviderError> {
        let Some(key) = &self.api_key else {
            return Err(ProviderError::transport(
                "anthropic API key is not configured (set ANTHROPIC_API_KEY)",
            ));
        };

        let mut content = Vec::new();
        if let Some(image) = &call.image_base64 {
            content.push(json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": call.image_media_type.as_deref().unwrap_or("image/png"),
                    "data": image,
                }
            }));
        }
        content.push(json!({"type": "text", "text": call.user_input}));

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", key)
            .header("anthropic-version", "2023-06-01")
            .json(&json!({
                "model": call.model_id,
                "max_tokens": call.max_tokens,
                "system": call.system_prompt,
                "messages": [{"role": "user", "content": content}],
            }))
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        if !status.is_success() {
            let reason = value["error"]["message"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| truncate_for_error(&value.to_string(), 500));
            return Err(ProviderError::http(status.as_u16(), reason));
        }

        let text = value["content"][0]["text"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::transport(format!(
                    "anthropic response carried no text content: {}",
                    truncate_for_error(&value.to_string(), 500)
                ))
            })?
            .to_string();

        let usage = TokenUsage::new(
            value["usage"]["input_tokens"].as_u64().unwrap_or(0),
            value["usage"]["output_tokens"].as_u64().unwrap_or(0),
        );

        Ok(Completion { text, usage })
    }
}

struct OpenAICompatibleProvider {
    id: String,
    name: String,
    api_key: Option<String>,
    base_url: String,
    models: Vec<String>,
    client: Client,
}

#[async_trait]
impl Provider for OpenAICompatibleProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            models: self
                .models
                .iter()
                .map(|id| ModelInfo {
                    id: id.clone(),
                    provider_id: self.id.clone(),
                    display_name: id.clone(),
                })
                .collect(),
        }
    }

    fn can_invoke(&self) -> bool {
        self.api_key.is_some()
    }

    async fn complete(&self, call: &ModelCall) -> Result<Completion, ProviderError> {
        let Some(key) = &self.api_key else {
            return Err(ProviderError::transport(format!(
                "provider `{}` has no API key configured",
                self.id
            )));
        };

        let user_content = if let Some(image) = &call.image_base64 {
            let media = call.image_media_type.as_deref().unwrap_or("image/png");
            json!([
                {"type": "image_url", "image_url": {"url": format!("data:{media};base64,{image}")}},
                {"type": "text", "text": call.user_input},
            ])
        } else {
            json!(call.user_input)
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(key)
            .json(&json!({
                "model": call.model_id,
                "max_tokens": call.max_tokens,
                "messages": [
                    {"role": "system", "content": call.system_prompt},
                    {"role": "user", "content": user_content},
                ],
            }))
            .send()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        let status = response.status();
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::transport(e.to_string()))?;

        if !status.is_success() {
            let reason = value["error"]["message"]
                .as_str()
                .map(|s| s.to_string())
                .unwrap_or_else(|| truncate_for_error(&value.to_string(), 500));
            return Err(ProviderError::http(status.as_u16(), reason));
        }

        let text = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                ProviderError::transport(format!(
                    "provider `{}` returned no completion content: {}",
                    self.id,
                    truncate_for_error(&value.to_string(), 500)
                ))
            })?
            .to_string();

        let usage = TokenUsage::new(
            value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        );

        Ok(Completion { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(provider_ids: &[&str]) -> ProvidersConfig {
        let mut providers = HashMap::new();
        for id in provider_ids {
            providers.insert(
                (*id).to_string(),
                ProviderEndpointConfig {
                    api_key: Some(format!("{id}-key")),
                    url: None,
                    models: vec![format!("{id}-model")],
                },
            );
        }
        ProvidersConfig { providers }
    }

    #[tokio::test]
    async fn registry_resolves_provider_by_model_id() {
        let registry = ProviderRegistry::new(&cfg(&["anthropic", "openai"]));
        let provider = registry.for_model("openai-model").await.expect("provider");
        assert_eq!(provider.info().id, "openai");
    }

    #[tokio::test]
    async fn unknown_model_resolves_to_none() {
        let registry = ProviderRegistry::new(&cfg(&["anthropic"]));
        assert!(registry.for_model("gpt-oss-120b").await.is_none());
    }

    #[tokio::test]
    async fn anthropic_defaults_its_stock_models() {
        let registry = ProviderRegistry::new(&ProvidersConfig::with_defaults());
        let models = registry.registered_models().await;
        assert!(models.iter().any(|m| m.id == "claude-3-5-sonnet-latest"));
    }

    #[test]
    fn placeholder_api_keys_are_ignored() {
        assert!(is_placeholder_api_key(" x "));
        assert!(is_placeholder_api_key("placeholder"));
        assert!(!is_placeholder_api_key("sk-real"));
    }

    #[test]
    fn error_truncation_respects_char_boundaries() {
        let long = "é".repeat(600);
        let out = truncate_for_error(&long, 500);
        assert!(out.ends_with("..."));
        assert!(out.len() <= 506);
    }
}
