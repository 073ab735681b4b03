//! Drives the five agents over one analysis context in the prescribed
//! shape: Scanner alone, then Linguist + Historian + Validator fanned out
//! with a timestamp merge, then RepairAdvisor alone, then sealing.

mod merge;

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use palimpsest_agents::{build_roster, AgentDeps};
use palimpsest_core::{AnalysisContext, MessageEmitter, RestorationAgent, SharedContext};
use palimpsest_observability::{emit_event, PipelineEvent, ProcessKind};
use palimpsest_types::{
    AgentMessage, AgentRole, RestorationSummary, ResurrectionResult,
};

use merge::{merge_fan_out, MergeAbort, MergeSlot};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline cancelled")]
    Cancelled,
    #[error("pipeline invariant violated: {0}")]
    Invariant(String),
}

/// Capacity of each fan-out agent's private channel. An agent that races
/// ahead of the merge blocks here, bounding reorder memory.
const FAN_OUT_BUFFER: usize = 8;

/// Execute the full pipeline over one submission, streaming messages into
/// `tx` as they are produced. Returns the sealed result; the caller owns
/// emitting the terminal event and installing the cache entry.
pub async fn run_pipeline(
    deps: &AgentDeps,
    image: Vec<u8>,
    image_media_type: String,
    tx: mpsc::Sender<AgentMessage>,
    cancel: CancellationToken,
) -> Result<ResurrectionResult, PipelineError> {
    let run_id = Uuid::new_v4().to_string();
    let ctx = SharedContext::new(AnalysisContext::new(image, image_media_type));

    let roster = build_roster(deps);
    let scanner = roster[0].clone();
    let fan_out = [roster[1].clone(), roster[2].clone(), roster[3].clone()];
    let repair_advisor = roster[4].clone();

    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        PipelineEvent::new("pipeline.start", "orchestrator").run(&run_id),
    );

    // Stage A: the scanner runs alone and emits straight into the output
    // channel. Its completion is observed (process returned) before the
    // fan-out stage begins, so every scanner write happens-before Stage B.
    run_sequential_agent(&scanner, &ctx, &tx, &cancel, &run_id).await?;

    // Stage B: three agents on private channels, merged by timestamp.
    let mut slots = Vec::with_capacity(3);
    let mut handles = Vec::with_capacity(3);
    for agent in fan_out {
        let role = agent.role();
        let (agent_tx, agent_rx) = mpsc::channel(FAN_OUT_BUFFER);
        slots.push(MergeSlot::new(role, agent_rx));
        let ctx = ctx.clone();
        let cancel = cancel.clone();
        let run_id = run_id.clone();
        handles.push(tokio::spawn(async move {
            let mut emitter = MessageEmitter::new(role, agent_tx, cancel);
            emit_event(
                Level::INFO,
                ProcessKind::Engine,
                PipelineEvent::new("agent.start", "orchestrator")
                    .run(&run_id)
                    .role(role.as_str()),
            );
            agent.process(&ctx, &mut emitter).await
        }));
    }
    let slots: [MergeSlot; 3] = slots
        .try_into()
        .map_err(|_| PipelineError::Invariant("fan-out stage must have three slots".into()))?;

    let merge_outcome = merge_fan_out(slots, &tx, &cancel, AgentRole::Scanner).await;
    if merge_outcome.is_err() {
        // Unblock agents parked on their full private channels so the joins
        // below terminate.
        cancel.cancel();
    }

    let mut agent_failure: Option<String> = None;
    for handle in handles {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if !cancel.is_cancelled() {
                    agent_failure.get_or_insert(format!("fan-out agent failed: {err}"));
                }
            }
            Err(join_err) => {
                agent_failure.get_or_insert(format!("fan-out agent panicked: {join_err}"));
            }
        }
    }

    match merge_outcome {
        Err(MergeAbort::Cancelled) | Err(MergeAbort::OutputClosed) => {
            return Err(PipelineError::Cancelled);
        }
        Ok(()) if cancel.is_cancelled() => return Err(PipelineError::Cancelled),
        Ok(()) => {}
    }
    if let Some(failure) = agent_failure {
        return Err(PipelineError::Invariant(failure));
    }

    // Stage C: the repair advisor reads every prior finding.
    run_sequential_agent(&repair_advisor, &ctx, &tx, &cancel, &run_id).await?;

    let result = seal(&ctx).await;
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        PipelineEvent::new("pipeline.complete", "orchestrator")
            .run(&run_id)
            .status("sealed"),
    );
    Ok(result)
}

async fn run_sequential_agent(
    agent: &Arc<dyn RestorationAgent>,
    ctx: &SharedContext,
    tx: &mpsc::Sender<AgentMessage>,
    cancel: &CancellationToken,
    run_id: &str,
) -> Result<(), PipelineError> {
    let role = agent.role();
    emit_event(
        Level::INFO,
        ProcessKind::Engine,
        PipelineEvent::new("agent.start", "orchestrator")
            .run(run_id)
            .role(role.as_str()),
    );
    match agent.process(ctx, &mut MessageEmitter::new(role, tx.clone(), cancel.clone())).await
    {
        Ok(()) => Ok(()),
        Err(err) => {
            if cancel.is_cancelled() {
                Err(PipelineError::Cancelled)
            } else {
                Err(PipelineError::Invariant(format!(
                    "{role} agent failed: {err}"
                )))
            }
        }
    }
}

/// Build the immutable result from the final context.
async fn seal(ctx: &SharedContext) -> ResurrectionResult {
    ctx.read(|c| {
        let document_type = c
            .findings
            .get(&AgentRole::Historian)
            .and_then(|f| f.artifacts.get("document_type"))
            .and_then(|v| v.as_str())
            .unwrap_or("archival_document")
            .to_string();

        let issues_detected: Vec<String> = c
            .findings
            .get(&AgentRole::RepairAdvisor)
            .map(|f| f.key_findings.clone())
            .unwrap_or_default();

        let structural_flags: Vec<String> = c
            .findings
            .get(&AgentRole::Validator)
            .and_then(|f| f.artifacts.get("flags"))
            .and_then(|v| v.as_array())
            .map(|flags| {
                flags
                    .iter()
                    .filter_map(|f| f.as_str().map(String::from))
                    .collect()
            })
            .unwrap_or_default();

        ResurrectionResult {
            overall_confidence: c.overall_confidence,
            processing_time_ms: c.started.elapsed().as_millis() as u64,
            raw_ocr_text: c.raw_ocr_text.clone(),
            transliterated_text: c.transliterated_text.clone(),
            enhanced_image_base64: c.enhanced_image_base64.clone(),
            repair_recommendations: c.repair_recommendations.clone(),
            damage_hotspots: c.damage_hotspots.clone(),
            restoration_summary: RestorationSummary {
                document_type,
                issues_detected,
                enhancements_applied: c.applied_enhancements.clone(),
                quality_score: c.overall_confidence.round() / 100.0,
                structural_flags,
            },
        }
    })
    .await
}
