use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use palimpsest_core::{
    MessageEmitter, ReferenceData, RestorationAgent, RoleBudgetConfig, SharedContext,
};
use palimpsest_providers::{clip_input, ModelInvoker};
use palimpsest_types::{AgentFindings, AgentRole, DamageHotspot};

use crate::support::{first_line, model_insight};

const ADVISOR_SYSTEM_PROMPT: &str = "You are a paper conservator. Given the condition \
signals of a degraded historical document, give one concrete handling or storage \
recommendation in a single sentence.";

/// Stage-C worker: reads every prior finding and derives damage hotspots and
/// conservation recommendations from the taxonomy. Runs alone after the
/// fan-out stage; does not contribute to overall confidence.
pub struct RepairAdvisorAgent {
    invoker: Arc<ModelInvoker>,
    reference: Arc<ReferenceData>,
    budget: RoleBudgetConfig,
}

/// Condition snapshot the damage rules run over.
struct ConditionSignals {
    ocr_chars: usize,
    substitutions: u64,
    enhancements: usize,
}

impl RepairAdvisorAgent {
    pub fn new(
        invoker: Arc<ModelInvoker>,
        reference: Arc<ReferenceData>,
        budget: RoleBudgetConfig,
    ) -> Self {
        Self {
            invoker,
            reference,
            budget,
        }
    }

    /// Deterministic damage classification from context signals:
    /// nothing legible reads as severe media loss, sparse text as fading,
    /// archaic orthography as aged (acidic) stock, and an enhancer that had
    /// to intervene as surface speckling.
    fn detect_damage(signals: &ConditionSignals) -> Vec<&'static str> {
        let mut damage = Vec::new();
        if signals.ocr_chars == 0 {
            damage.push("water_damage");
        } else if signals.ocr_chars < 120 {
            damage.push("ink_fading");
        }
        if signals.substitutions > 0 {
            damage.push("brittleness");
        }
        if signals.enhancements > 0 {
            damage.push("foxing");
        }
        damage
    }

    /// Fixed placement per damage class, expressed as page percentages.
    fn hotspot_for(&self, damage_type: &str) -> Option<DamageHotspot> {
        let entry = self.reference.taxonomy_entry(damage_type)?;
        let (x, y, radius) = match damage_type {
            "water_damage" => (50.0, 12.0, 22.0),
            "ink_fading" => (50.0, 50.0, 30.0),
            "brittleness" => (6.0, 50.0, 12.0),
            "foxing" => (72.0, 28.0, 9.0),
            "edge_tearing" => (4.0, 85.0, 10.0),
            "mold_staining" => (85.0, 70.0, 14.0),
            _ => (50.0, 50.0, 15.0),
        };
        Some(DamageHotspot::new(
            x,
            y,
            radius,
            entry.severity,
            entry.damage_type.clone(),
            entry.indicators.join("; "),
        ))
    }
}

#[async_trait]
impl RestorationAgent for RepairAdvisorAgent {
    fn role(&self) -> AgentRole {
        AgentRole::RepairAdvisor
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
            .activation("Repair advisor activated; assessing physical condition")
            .await?;

        let signals = ctx
            .read(|c| ConditionSignals {
                ocr_chars: c.raw_ocr_text.chars().count(),
                substitutions: c
                    .findings
                    .get(&AgentRole::Linguist)
                    .and_then(|f| f.artifacts.get("substitutions"))
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0),
                enhancements: c.applied_enhancements.len(),
            })
            .await;

        let damage_types = Self::detect_damage(&signals);
        let hotspots: Vec<DamageHotspot> = damage_types
            .iter()
            .filter_map(|d| self.hotspot_for(d))
            .collect();
        let mut recommendations: Vec<String> = damage_types
            .iter()
            .filter_map(|d| self.reference.taxonomy_entry(d))
            .map(|entry| entry.recommendation.clone())
            .collect();

        if damage_types.is_empty() {
            emitter
                .note("No damage indicators detected; routine archival housing is sufficient")
                .await?;
            recommendations.push("Rehouse in an acid-free folder; no intervention needed".to_string());
        } else {
            emitter
                .note(format!(
                    "Damage indicators: {}",
                    damage_types.join(", ")
                ))
                .await?;
        }

        let condition_brief = format!(
            "legible characters: {}; archaic orthography clusters: {}; enhancement passes: {}; damage classes: {}",
            signals.ocr_chars,
            signals.substitutions,
            signals.enhancements,
            if damage_types.is_empty() {
                "none".to_string()
            } else {
                damage_types.join(", ")
            },
        );

        let cancel = emitter.cancellation().clone();
        let advice = model_insight(
            &self.invoker,
            &self.budget,
            ADVISOR_SYSTEM_PROMPT,
            clip_input(&condition_brief),
            None,
            &cancel,
            emitter,
        )
        .await?;

        let assisted = advice.is_some();
        if let Some(advice) = &advice {
            let line = first_line(advice);
            if !line.is_empty() {
                recommendations.push(line.to_string());
                emitter.note(format!("Conservator's note: {line}")).await?;
            }
        }

        let confidence = if assisted {
            60.0 + (damage_types.len() as f32 * 5.0).min(20.0)
        } else {
            45.0 + (damage_types.len() as f32 * 5.0).min(20.0)
        };

        let findings = AgentFindings {
            confidence,
            key_findings: damage_types.iter().map(|d| d.to_string()).collect(),
            artifacts: json!({
                "damage_types": damage_types,
                "hotspots": hotspots.len(),
                "assisted": assisted,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        };

        let hotspots_for_ctx = hotspots.clone();
        let recommendations_for_ctx = recommendations.clone();
        ctx.update(|c| {
            c.damage_hotspots = hotspots_for_ctx;
            c.repair_recommendations = recommendations_for_ctx;
            c.record_findings(AgentRole::RepairAdvisor, findings);
        })
        .await;

        emitter
            .completion(
                format!(
                    "Condition assessment complete; {} hotspot(s), {} recommendation(s)",
                    hotspots.len(),
                    recommendations.len()
                ),
                confidence,
            )
            .await?;
        Ok(())
    }
}
