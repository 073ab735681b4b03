//! Deterministic in-memory provider for tests and offline runs.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::{Completion, ModelCall, ModelInfo, Provider, ProviderError, ProviderInfo, TokenUsage};

#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    Text { text: String, total_tokens: u64 },
    Fail { status: Option<u16>, reason: String },
    Stall { duration: Duration },
}

impl ScriptedOutcome {
    pub fn text(text: impl Into<String>, total_tokens: u64) -> Self {
        Self::Text {
            text: text.into(),
            total_tokens,
        }
    }

    pub fn fail(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::Fail {
            status,
            reason: reason.into(),
        }
    }

    pub fn stall(duration: Duration) -> Self {
        Self::Stall { duration }
    }
}

/// Serves every model id. Outcomes are scripted per model id and consumed in
/// FIFO order; when a model's queue is empty the default text is returned.
pub struct ScriptedProvider {
    script: Arc<Mutex<HashMap<String, VecDeque<ScriptedOutcome>>>>,
    default_text: String,
    default_tokens: u64,
}

impl ScriptedProvider {
    pub fn new(default_text: impl Into<String>) -> Self {
        Self {
            script: Arc::new(Mutex::new(HashMap::new())),
            default_text: default_text.into(),
            default_tokens: 100,
        }
    }

    pub fn push(&self, model_id: &str, outcome: ScriptedOutcome) {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(model_id.to_string())
            .or_default()
            .push_back(outcome);
    }

    fn next_outcome(&self, model_id: &str) -> Option<ScriptedOutcome> {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(model_id)
            .and_then(|queue| queue.pop_front())
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: "scripted".to_string(),
            name: "Scripted".to_string(),
            models: vec![ModelInfo {
                id: "scripted-model".to_string(),
                provider_id: "scripted".to_string(),
                display_name: "Scripted Model".to_string(),
            }],
        }
    }

    fn serves(&self, _model_id: &str) -> bool {
        true
    }

    async fn complete(&self, call: &ModelCall) -> Result<Completion, ProviderError> {
        match self.next_outcome(&call.model_id) {
            Some(ScriptedOutcome::Text { text, total_tokens }) => Ok(Completion {
                text,
                usage: TokenUsage {
                    input_tokens: total_tokens / 2,
                    output_tokens: total_tokens - total_tokens / 2,
                    total_tokens,
                },
            }),
            Some(ScriptedOutcome::Fail { status, reason }) => {
                Err(ProviderError { status, reason })
            }
            Some(ScriptedOutcome::Stall { duration }) => {
                tokio::time::sleep(duration).await;
                Ok(Completion {
                    text: self.default_text.clone(),
                    usage: TokenUsage::new(
                        self.default_tokens / 2,
                        self.default_tokens - self.default_tokens / 2,
                    ),
                })
            }
            None => Ok(Completion {
                text: self.default_text.clone(),
                usage: TokenUsage::new(
                    self.default_tokens / 2,
                    self.default_tokens - self.default_tokens / 2,
                ),
            }),
        }
    }
}
