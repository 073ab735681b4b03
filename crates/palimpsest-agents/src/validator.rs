use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use palimpsest_core::{MessageEmitter, RestorationAgent, RoleBudgetConfig, SharedContext};
use palimpsest_providers::{clip_input, ModelInvoker};
use palimpsest_types::{AgentFindings, AgentRole};

use crate::support::{first_line, model_insight};

const VALIDATOR_SYSTEM_PROMPT: &str = "You are reviewing the combined output of an OCR \
pass, a transliteration pass, and a historical placement of one document. Note any \
contradiction between them in one short sentence, or state that they agree.";

/// Weights for the overall-confidence aggregation. The repair advisor does
/// not contribute.
const WEIGHT_SCANNER: f32 = 0.35;
const WEIGHT_LINGUIST: f32 = 0.20;
const WEIGHT_HISTORIAN: f32 = 0.25;
const WEIGHT_VALIDATOR: f32 = 0.20;

/// Fan-out worker: cross-checks the other agents' findings and owns the
/// overall-confidence scalar. Shared aggregation is deferred here so the
/// fan-out stage writes stay disjoint.
pub struct ValidatorAgent {
    invoker: Arc<ModelInvoker>,
    budget: RoleBudgetConfig,
}

impl ValidatorAgent {
    pub fn new(invoker: Arc<ModelInvoker>, budget: RoleBudgetConfig) -> Self {
        Self { invoker, budget }
    }

    /// Agreement score over the upstream confidences: tight agreement with
    /// full coverage scores high, missing contributors drag it down, and an
    /// empty text floor-caps it.
    fn own_confidence(text_empty: bool, upstream: &[f32]) -> f32 {
        if text_empty {
            return 5.0;
        }
        if upstream.is_empty() {
            return 20.0;
        }
        let max = upstream.iter().cloned().fold(f32::MIN, f32::max);
        let min = upstream.iter().cloned().fold(f32::MAX, f32::min);
        let agreement = (88.0 - (max - min) / 2.0).clamp(20.0, 92.0);
        agreement * (upstream.len() as f32 / 3.0)
    }

    fn overall(
        scanner: f32,
        linguist: f32,
        historian: f32,
        validator: f32,
    ) -> f32 {
        (WEIGHT_SCANNER * scanner
            + WEIGHT_LINGUIST * linguist
            + WEIGHT_HISTORIAN * historian
            + WEIGHT_VALIDATOR * validator)
            .clamp(0.0, 100.0)
    }
}

#[async_trait]
impl RestorationAgent for ValidatorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Validator
    }

    fn deadline(&self) -> Duration {
        Duration::from_secs(self.budget.deadline_secs)
    }

    fn token_budget(&self) -> u32 {
        self.budget.max_tokens
    }

    async fn process(
        &self,
        ctx: &SharedContext,
        emitter: &mut MessageEmitter,
    ) -> anyhow::Result<()> {
        emitter
            .activation("Validator activated; cross-checking the findings")
            .await?;

        let raw_text = ctx.read(|c| c.raw_ocr_text.clone()).await;
        let text_empty = raw_text.trim().is_empty();

        // The linguist and historian run concurrently with this agent and
        // write findings just before their completion messages. When the text
        // is non-empty both will eventually contribute, so aggregation waits
        // for their entries, bounded by this role's deadline.
        if !text_empty {
            ctx.wait_for(
                |c| {
                    (c.findings.contains_key(&AgentRole::Linguist)
                        && c.findings.contains_key(&AgentRole::Historian))
                    .then_some(())
                },
                self.deadline(),
            )
            .await;
        }

        let (scanner_conf, linguist_conf, historian_conf) = ctx
            .read(|c| {
                (
                    c.confidence_of(AgentRole::Scanner),
                    c.confidence_of(AgentRole::Linguist),
                    c.confidence_of(AgentRole::Historian),
                )
            })
            .await;
        let upstream: Vec<f32> = [scanner_conf, linguist_conf, historian_conf]
            .into_iter()
            .flatten()
            .collect();

        let mut flags = Vec::new();
        if text_empty {
            flags.push("no_legible_text".to_string());
        }
        if linguist_conf.is_none() || historian_conf.is_none() {
            flags.push("partial_analysis".to_string());
        }

        let summary = format!(
            "scanner {:.0}, linguist {:.0}, historian {:.0}; text: {}",
            scanner_conf.unwrap_or(0.0),
            linguist_conf.unwrap_or(0.0),
            historian_conf.unwrap_or(0.0),
            if text_empty { "(empty)" } else { raw_text.trim() },
        );

        let cancel = emitter.cancellation().clone();
        let cross_check = if text_empty {
            None
        } else {
            model_insight(
                &self.invoker,
                &self.budget,
                VALIDATOR_SYSTEM_PROMPT,
                clip_input(&summary),
                None,
                &cancel,
                emitter,
            )
            .await?
        };

        if let Some(verdict) = &cross_check {
            let line = first_line(verdict);
            if !line.is_empty() {
                emitter.note(format!("Cross-check: {line}")).await?;
            }
        }

        let own = Self::own_confidence(text_empty, &upstream);
        let overall = Self::overall(
            scanner_conf.unwrap_or(0.0),
            linguist_conf.unwrap_or(0.0),
            historian_conf.unwrap_or(0.0),
            own,
        );

        emitter
            .note_scored(
                format!("Overall restoration confidence settles at {overall:.0}"),
                overall,
            )
            .await?;

        let findings = AgentFindings {
            confidence: own,
            key_findings: vec![format!(
                "{} of 3 upstream contributions present",
                upstream.len()
            )],
            artifacts: json!({
                "weights": {
                    "scanner": WEIGHT_SCANNER,
                    "linguist": WEIGHT_LINGUIST,
                    "historian": WEIGHT_HISTORIAN,
                    "validator": WEIGHT_VALIDATOR,
                },
                "overall": overall,
                "flags": flags,
                "assisted": cross_check.is_some(),
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        };

        ctx.update(|c| {
            c.overall_confidence = overall;
            c.record_findings(AgentRole::Validator, findings);
        })
        .await;

        emitter.completion("Validation complete", own).await?;
        Ok(())
    }
}
