use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Well-known `section` tags carried by agent messages.
pub mod section {
    pub const ACTIVATION: &str = "activation";
    pub const COMPLETION: &str = "completion";
    pub const FALLBACK: &str = "fallback";
    pub const NO_INPUT: &str = "no_input";
}

/// The closed set of pipeline workers, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Scanner,
    Linguist,
    Historian,
    Validator,
    RepairAdvisor,
}

impl AgentRole {
    pub const ALL: [AgentRole; 5] = [
        AgentRole::Scanner,
        AgentRole::Linguist,
        AgentRole::Historian,
        AgentRole::Validator,
        AgentRole::RepairAdvisor,
    ];

    /// The three roles of the parallel fan-out stage, in tie-break order.
    pub const FAN_OUT: [AgentRole; 3] = [
        AgentRole::Linguist,
        AgentRole::Historian,
        AgentRole::Validator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentRole::Scanner => "scanner",
            AgentRole::Linguist => "linguist",
            AgentRole::Historian => "historian",
            AgentRole::Validator => "validator",
            AgentRole::RepairAdvisor => "repair_advisor",
        }
    }

    /// Fixed tie-break priority for the parallel-stage timestamp merge.
    /// Lower yields first when timestamps are equal.
    pub fn merge_priority(self) -> u8 {
        match self {
            AgentRole::Scanner => 0,
            AgentRole::Linguist => 1,
            AgentRole::Historian => 2,
            AgentRole::Validator => 3,
            AgentRole::RepairAdvisor => 4,
        }
    }
}

impl std::fmt::Display for AgentRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One utterance in the inter-agent conversation. Immutable after emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentMessage {
    pub role: AgentRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
    #[serde(default)]
    pub collaboration: bool,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AgentMessage {
    pub fn new(role: AgentRole, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp,
            confidence: None,
            section: None,
            collaboration: false,
            metadata: Map::new(),
        }
    }

    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 100.0));
        self
    }

    pub fn with_section(mut self, section: &str) -> Self {
        self.section = Some(section.to_string());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Structured per-role output written into the shared context before an
/// agent's completion message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentFindings {
    pub confidence: f32,
    #[serde(default)]
    pub key_findings: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub artifacts: Map<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_serializes_snake_case() {
        let json = serde_json::to_string(&AgentRole::RepairAdvisor).unwrap();
        assert_eq!(json, "\"repair_advisor\"");
    }

    #[test]
    fn fan_out_order_matches_merge_priority() {
        let priorities: Vec<u8> = AgentRole::FAN_OUT
            .iter()
            .map(|r| r.merge_priority())
            .collect();
        let mut sorted = priorities.clone();
        sorted.sort_unstable();
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn confidence_is_clamped_into_percent_range() {
        let msg = AgentMessage::new(AgentRole::Scanner, "done", Utc::now()).with_confidence(140.0);
        assert_eq!(msg.confidence, Some(100.0));
    }

    #[test]
    fn empty_metadata_is_omitted_from_wire_form() {
        let msg = AgentMessage::new(AgentRole::Linguist, "hello", Utc::now());
        let json = serde_json::to_value(&msg).unwrap();
        assert!(json.get("metadata").is_none());
        assert!(json.get("confidence").is_none());
        assert_eq!(json["role"], "linguist");
    }
}
