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

const HISTORIAN_SYSTEM_PROMPT: &str = "You are a historian of 19th-century Zimbabwe. \
Given text recovered from a degraded document, place it in its period: who is \
mentioned, what events it touches, and roughly when it was written. Two to three \
short sentences.";

/// Fan-out worker: situates the recovered text historically. Reads the
/// Scanner's raw text only; owns nothing but its findings entry.
pub struct HistorianAgent {
    invoker: Arc<ModelInvoker>,
    reference: Arc<ReferenceData>,
    budget: RoleBudgetConfig,
}

impl HistorianAgent {
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

    fn confidence(matches: usize, assisted: bool) -> f32 {
        if assisted {
            52.0 + (matches as f32 * 12.0).min(36.0)
        } else {
            38.0 + (matches as f32 * 10.0).min(30.0)
        }
    }

    fn classify(text: &str) -> &'static str {
        let lowered = text.to_lowercase();
        if lowered.contains("kuna ") || lowered.contains("dear ") {
            "correspondence"
        } else if lowered.contains("muripo") || lowered.contains("receipt") {
            "administrative_record"
        } else {
            "archival_document"
        }
    }
}

#[async_trait]
impl RestorationAgent for HistorianAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Historian
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
            .activation("Historian activated; searching for period context")
            .await?;

        let raw_text = ctx.read(|c| c.raw_ocr_text.clone()).await;
        if raw_text.trim().is_empty() {
            emitter
                .no_input_completion("No recovered text to contextualize")
                .await?;
            return Ok(());
        }

        let matched = self.reference.match_figures(&raw_text);
        let names: Vec<String> = matched.iter().map(|f| f.name.clone()).collect();
        if names.is_empty() {
            emitter
                .note("No known historical figures named in the text")
                .await?;
        } else {
            emitter
                .note(format!("Recognized: {}", names.join("; ")))
                .await?;
        }

        let cancel = emitter.cancellation().clone();
        let commentary = model_insight(
            &self.invoker,
            &self.budget,
            HISTORIAN_SYSTEM_PROMPT,
            clip_input(&raw_text),
            None,
            &cancel,
            emitter,
        )
        .await?;

        let assisted = commentary.is_some();
        if let Some(context_note) = &commentary {
            let line = first_line(context_note);
            if !line.is_empty() {
                emitter.note(format!("Period reading: {line}")).await?;
            }
        }

        let document_type = Self::classify(&raw_text);
        let confidence = Self::confidence(names.len(), assisted);
        let mut key_findings = vec![format!("document classified as {document_type}")];
        for figure in &matched {
            key_findings.push(format!("{} ({})", figure.name, figure.era));
        }

        let findings = AgentFindings {
            confidence,
            key_findings,
            artifacts: json!({
                "document_type": document_type,
                "figures": names,
                "assisted": assisted,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        };
        ctx.update(|c| c.record_findings(AgentRole::Historian, findings))
            .await;

        emitter
            .completion(
                format!("Historical review complete; {} figure(s) placed", names.len()),
                confidence,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palimpsest_core::AnalysisContext;
    use palimpsest_providers::{
        BudgetLedger, ProviderRegistry, ScriptedOutcome, ScriptedProvider,
    };
    use palimpsest_types::{section, AgentMessage};
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn historian_with(provider: ScriptedProvider) -> HistorianAgent {
        let mut rates = HashMap::new();
        rates.insert("historian-model".to_string(), 0.000001);
        let invoker = Arc::new(ModelInvoker::new(
            ProviderRegistry::with_providers(vec![Arc::new(provider)]),
            BudgetLedger::new(5.0, rates),
        ));
        HistorianAgent::new(
            invoker,
            Arc::new(ReferenceData::default()),
            RoleBudgetConfig {
                model: "historian-model".to_string(),
                deadline_secs: 5,
                max_tokens: 200,
            },
        )
    }

    async fn run(agent: &HistorianAgent, ctx: &SharedContext) -> Vec<AgentMessage> {
        let (tx, mut rx) = mpsc::channel(32);
        let mut emitter = MessageEmitter::new(AgentRole::Historian, tx, CancellationToken::new());
        agent.process(ctx, &mut emitter).await.unwrap();
        drop(emitter);
        let mut messages = Vec::new();
        while let Some(msg) = rx.recv().await {
            messages.push(msg);
        }
        messages
    }

    fn context_with_text(text: &str) -> SharedContext {
        let mut ctx = AnalysisContext::new(vec![1; 8], "image/png");
        ctx.raw_ocr_text = text.to_string();
        SharedContext::new(ctx)
    }

    #[tokio::test]
    async fn recognizes_figures_and_scores_accordingly() {
        let agent = historian_with(ScriptedProvider::new(
            "A letter from the Mazowe valley, late 1890s.",
        ));
        let ctx = context_with_text("Kuna Nehanda, mukuru weɗu");

        let messages = run(&agent, &ctx).await;
        let last = messages.last().unwrap();
        assert_eq!(last.section.as_deref(), Some(section::COMPLETION));
        assert_eq!(last.confidence, Some(64.0));

        let artifacts = ctx
            .read(|c| c.findings[&AgentRole::Historian].artifacts.clone())
            .await;
        assert_eq!(artifacts["document_type"], "correspondence");
        assert_eq!(artifacts["figures"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_text_completes_with_no_input() {
        let agent = historian_with(ScriptedProvider::new("unused"));
        let ctx = context_with_text("");

        let messages = run(&agent, &ctx).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(
            messages.last().unwrap().section.as_deref(),
            Some(section::NO_INPUT)
        );
    }

    #[tokio::test]
    async fn outage_still_places_figures_from_the_table() {
        let provider = ScriptedProvider::new("unused");
        provider.push("historian-model", ScriptedOutcome::fail(None, "offline"));
        let agent = historian_with(provider);
        let ctx = context_with_text("signed by Lobengula at Bulawayo");

        let messages = run(&agent, &ctx).await;
        assert!(messages
            .iter()
            .any(|m| m.section.as_deref() == Some(section::FALLBACK)));
        let last = messages.last().unwrap();
        assert_eq!(last.confidence, Some(48.0));
    }
}
