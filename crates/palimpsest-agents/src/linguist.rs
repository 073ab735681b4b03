use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use palimpsest_core::{
    MessageEmitter, ReferenceData, RestorationAgent, RoleBudgetConfig, SharedContext,
};
use palimpsest_providers::{clip_input, ModelInvoker};
use palimpsest_types::{AgentFindings, AgentRole};

use crate::support::{first_line, model_insight};

const LINGUIST_SYSTEM_PROMPT: &str = "You are a Shona-language scholar reviewing a \
transliteration of a historical document from Doke-era orthography into the modern \
standard. Point out any passage whose rendering looks doubtful, in one or two short \
sentences.";

/// Fan-out worker: rewrites archaic orthography into the modern standard.
/// Reads the Scanner's raw text; owns the transliterated-text field.
pub struct LinguistAgent {
    invoker: Arc<ModelInvoker>,
    reference: Arc<ReferenceData>,
    budget: RoleBudgetConfig,
}

impl LinguistAgent {
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

    fn confidence(substitutions: usize, assisted: bool) -> f32 {
        if assisted {
            58.0 + (substitutions as f32 * 6.0).min(30.0)
        } else {
            40.0 + (substitutions as f32 * 5.0).min(25.0)
        }
    }
}

#[async_trait]
impl RestorationAgent for LinguistAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Linguist
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
            .activation("Linguist activated; reviewing the recovered text")
            .await?;

        let raw_text = ctx.read(|c| c.raw_ocr_text.clone()).await;
        if raw_text.trim().is_empty() {
            emitter
                .no_input_completion("No recovered text to transliterate")
                .await?;
            return Ok(());
        }

        let transliteration = self.reference.transliterate(&raw_text);
        if transliteration.substitutions > 0 {
            emitter
                .note(format!(
                    "Rewrote {} archaic orthography cluster(s) into the modern standard",
                    transliteration.substitutions
                ))
                .await?;
        } else {
            emitter
                .note("Text already follows the modern orthography")
                .await?;
        }

        let cancel = emitter.cancellation().clone();
        let review = model_insight(
            &self.invoker,
            &self.budget,
            LINGUIST_SYSTEM_PROMPT,
            clip_input(&transliteration.text),
            None,
            &cancel,
            emitter,
        )
        .await?;

        let assisted = review.is_some();
        if let Some(commentary) = &review {
            let line = first_line(commentary);
            if !line.is_empty() {
                emitter.note(format!("Reading note: {line}")).await?;
            }
        }

        let confidence = Self::confidence(transliteration.substitutions, assisted);
        let findings = AgentFindings {
            confidence,
            key_findings: vec![format!(
                "{} orthography substitution(s) applied",
                transliteration.substitutions
            )],
            artifacts: json!({
                "substitutions": transliteration.substitutions,
                "assisted": assisted,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        };

        let text_for_ctx = transliteration.text.clone();
        ctx.update(|c| {
            c.transliterated_text = text_for_ctx;
            c.record_findings(AgentRole::Linguist, findings);
        })
        .await;

        emitter
            .completion("Transliteration settled", confidence)
            .await?;
        Ok(())
    }
}
