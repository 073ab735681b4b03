use serde::{Deserialize, Serialize};

use crate::{AgentMessage, ResurrectionResult};

/// Terminal event of a submission stream. Exactly one is emitted per
/// successful run; a failed submission carries `error` instead of `result`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    #[serde(rename = "type")]
    pub kind: String,
    pub cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResurrectionResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CompletionEvent {
    pub const KIND: &'static str = "complete";

    pub fn fresh(result: ResurrectionResult) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            cached: false,
            result: Some(result),
            error: None,
        }
    }

    pub fn replayed(result: ResurrectionResult) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            cached: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            cached: false,
            result: None,
            error: Some(reason.into()),
        }
    }
}

/// One client-facing stream event: either an agent message or the terminal
/// completion. Serialized untagged so agent messages keep their flat wire
/// shape and the terminal event is distinguished by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamEvent {
    Message(AgentMessage),
    Complete(CompletionEvent),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete(_))
    }
}
