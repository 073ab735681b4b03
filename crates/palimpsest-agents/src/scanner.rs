use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::json;
use tracing::warn;

use palimpsest_core::{
    EnhancedImage, ImageEnhancer, MessageEmitter, RestorationAgent, RoleBudgetConfig,
    SharedContext,
};
use palimpsest_providers::ModelInvoker;
use palimpsest_types::{AgentFindings, AgentMessage, AgentRole};

use crate::support::model_insight;

const OCR_SYSTEM_PROMPT: &str = "You are an OCR engine for degraded historical documents. \
Transcribe every legible character exactly as printed, preserving archaic orthography, \
line breaks, and uncertain readings in square brackets. Output the transcription only.";

/// Stage-A worker: enhances the submitted image and extracts raw text.
/// Everything downstream reads the fields this agent establishes.
pub struct ScannerAgent {
    invoker: Arc<ModelInvoker>,
    enhancer: Arc<dyn ImageEnhancer>,
    budget: RoleBudgetConfig,
}

impl ScannerAgent {
    pub fn new(
        invoker: Arc<ModelInvoker>,
        enhancer: Arc<dyn ImageEnhancer>,
        budget: RoleBudgetConfig,
    ) -> Self {
        Self {
            invoker,
            enhancer,
            budget,
        }
    }

    fn ocr_confidence(text: &str) -> f32 {
        let chars = text.chars().count();
        if chars == 0 {
            25.0
        } else if chars < 40 {
            64.0
        } else {
            82.0
        }
    }
}

#[async_trait]
impl RestorationAgent for ScannerAgent {
    fn role(&self) -> AgentRole {
        AgentRole::Scanner
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
            .activation("Scanner activated; inspecting the submitted plate")
            .await?;

        let (image, media_type) = ctx
            .read(|c| (c.image.clone(), c.image_media_type.clone()))
            .await;
        if image.is_empty() {
            emitter.no_input_completion("No image data to scan").await?;
            return Ok(());
        }

        let enhanced = match self.enhancer.enhance(&image).await {
            Ok(enhanced) => enhanced,
            Err(err) => {
                warn!(%err, "enhancement pass failed, continuing with the original image");
                emitter
                    .note("Enhancement pass failed; working from the original image")
                    .await?;
                EnhancedImage {
                    image: image.clone(),
                    applied: Vec::new(),
                }
            }
        };

        let encoded = STANDARD.encode(&enhanced.image);
        let applied = enhanced.applied.clone();
        ctx.update(|c| {
            c.enhanced_image_base64 = encoded.clone();
            c.applied_enhancements = applied.clone();
        })
        .await;

        if applied.is_empty() {
            emitter
                .note("Image accepted as submitted; no enhancement passes were required")
                .await?;
        } else {
            emitter
                .note(format!("Applied enhancement passes: {}", applied.join(", ")))
                .await?;
        }

        let cancel = emitter.cancellation().clone();
        let ocr = model_insight(
            &self.invoker,
            &self.budget,
            OCR_SYSTEM_PROMPT,
            "Transcribe the attached document image.",
            Some((encoded, media_type)),
            &cancel,
            emitter,
        )
        .await?;

        let (raw_text, confidence, assisted) = match ocr {
            Some(text) => {
                let text = text.trim().to_string();
                let confidence = Self::ocr_confidence(&text);
                (text, confidence, true)
            }
            None => {
                let confidence = if applied.is_empty() { 30.0 } else { 35.0 };
                (String::new(), confidence, false)
            }
        };

        let chars = raw_text.chars().count();
        if assisted && chars > 0 {
            let note = AgentMessage::new(
                AgentRole::Scanner,
                format!("Recovered {chars} characters of text"),
                Utc::now(),
            )
            .with_confidence(confidence)
            .with_metadata("ocr_chars", json!(chars));
            emitter.emit(note).await?;
        }

        let findings = AgentFindings {
            confidence,
            key_findings: if chars > 0 {
                vec![format!("recovered {chars} characters of legible text")]
            } else {
                vec!["no legible text recovered".to_string()]
            },
            artifacts: json!({
                "ocr_chars": chars,
                "enhancements": applied,
                "assisted": assisted,
            })
            .as_object()
            .cloned()
            .unwrap_or_default(),
        };
        let raw_for_ctx = raw_text.clone();
        ctx.update(|c| {
            c.raw_ocr_text = raw_for_ctx;
            c.record_findings(AgentRole::Scanner, findings);
        })
        .await;

        emitter
            .completion(
                format!("Scan complete; {chars} characters extracted"),
                confidence,
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palimpsest_core::{AnalysisContext, PassthroughEnhancer};
    use palimpsest_providers::{
        BudgetLedger, ProviderRegistry, ScriptedOutcome, ScriptedProvider,
    };
    use palimpsest_types::{section, AgentMessage};
    use std::collections::HashMap;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn scanner_with(provider: ScriptedProvider, cap_usd: f64) -> ScannerAgent {
        let mut rates = HashMap::new();
        rates.insert("scan-model".to_string(), 0.00001);
        let invoker = Arc::new(ModelInvoker::new(
            ProviderRegistry::with_providers(vec![Arc::new(provider)]),
            BudgetLedger::new(cap_usd, rates),
        ));
        ScannerAgent::new(
            invoker,
            Arc::new(PassthroughEnhancer),
            RoleBudgetConfig {
                model: "scan-model".to_string(),
                deadline_secs: 5,
                max_tokens: 200,
            },
        )
    }

    async fn run(agent: &ScannerAgent, ctx: &SharedContext) -> Vec<AgentMessage> {
        let (tx, mut rx) = mpsc::channel(32);
        let mut emitter = MessageEmitter::new(AgentRole::Scanner, tx, CancellationToken::new());
        agent.process(ctx, &mut emitter).await.unwrap();
        drop(emitter);
        let mut messages = Vec::new();
        while let Some(msg) = rx.recv().await {
            messages.push(msg);
        }
        messages
    }

    #[tokio::test]
    async fn successful_ocr_writes_text_and_scores_high() {
        let provider = ScriptedProvider::new("default");
        let long_text = "Kuna Nehanda, mambokadzi wedu. ".repeat(4);
        provider.push("scan-model", ScriptedOutcome::text(long_text, 900));
        let agent = scanner_with(provider, 5.0);
        let ctx = SharedContext::new(AnalysisContext::new(vec![1; 64], "image/png"));

        let messages = run(&agent, &ctx).await;
        let last = messages.last().unwrap();
        assert_eq!(last.section.as_deref(), Some(section::COMPLETION));
        assert_eq!(last.confidence, Some(82.0));

        assert!(ctx.read(|c| !c.raw_ocr_text.is_empty()).await);
        assert!(!ctx.read(|c| c.enhanced_image_base64.is_empty()).await);
        assert_eq!(
            ctx.read(|c| c.confidence_of(AgentRole::Scanner)).await,
            Some(82.0)
        );
    }

    #[tokio::test]
    async fn model_outage_falls_back_with_one_tagged_message() {
        let provider = ScriptedProvider::new("default");
        provider.push("scan-model", ScriptedOutcome::fail(Some(500), "down"));
        let agent = scanner_with(provider, 5.0);
        let ctx = SharedContext::new(AnalysisContext::new(vec![1; 64], "image/png"));

        let messages = run(&agent, &ctx).await;
        let fallbacks: Vec<_> = messages
            .iter()
            .filter(|m| m.section.as_deref() == Some(section::FALLBACK))
            .collect();
        assert_eq!(fallbacks.len(), 1);

        let last = messages.last().unwrap();
        assert_eq!(last.section.as_deref(), Some(section::COMPLETION));
        assert_eq!(last.confidence, Some(30.0));
        assert!(ctx.read(|c| c.raw_ocr_text.is_empty()).await);
    }

    #[tokio::test]
    async fn budget_exhaustion_also_falls_back() {
        let agent = scanner_with(ScriptedProvider::new("unreachable"), 0.0);
        let ctx = SharedContext::new(AnalysisContext::new(vec![1; 64], "image/png"));

        let messages = run(&agent, &ctx).await;
        assert!(messages
            .iter()
            .any(|m| m.section.as_deref() == Some(section::FALLBACK)));
        let last = messages.last().unwrap();
        assert_eq!(last.section.as_deref(), Some(section::COMPLETION));
    }

    #[tokio::test]
    async fn empty_image_completes_with_no_input_tag() {
        let agent = scanner_with(ScriptedProvider::new("x"), 5.0);
        let ctx = SharedContext::new(AnalysisContext::new(Vec::new(), "image/png"));

        let messages = run(&agent, &ctx).await;
        assert_eq!(messages.len(), 2);
        let last = messages.last().unwrap();
        assert_eq!(last.section.as_deref(), Some(section::NO_INPUT));
        assert_eq!(last.confidence, Some(0.0));
        assert!(ctx.read(|c| c.findings.is_empty()).await);
    }
}
