use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, Level};

use palimpsest_cache::{await_joined, content_hash, RunState, Submission};
use palimpsest_core::sniff_media_type;
use palimpsest_observability::{emit_event, PipelineEvent, ProcessKind};
use palimpsest_orchestrator::{run_pipeline, PipelineError};
use palimpsest_types::{
    BudgetSnapshot, CacheStats, CompletionEvent, ResurrectionResult, StreamEvent,
};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    use tower_http::cors::{Any, CorsLayer};

    Router::new()
        .route("/documents/restore", post(restore))
        .route("/budget", get(budget_snapshot))
        .route("/budget/cap", put(set_budget_cap))
        .route("/cache/stats", get(cache_stats))
        .route("/archive/{hash}", get(archive_lookup))
        .route("/healthz", get(healthz))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Capacity of the orchestrator's output channel. A stalled client fills it
/// and upstream agents block at their next emit; nothing is dropped.
const STREAM_BUFFER: usize = 64;

fn sse_event(event: &StreamEvent) -> Event {
    Event::default().data(serde_json::to_string(event).unwrap_or_default())
}

async fn restore(
    State(state): State<AppState>,
    body: Bytes,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(restore_stream(state, body))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(10)))
}

fn restore_stream(
    state: AppState,
    body: Bytes,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream! {
        let Some(media_type) = sniff_media_type(&body) else {
            yield Ok(sse_event(&StreamEvent::Complete(CompletionEvent::failed(
                "unsupported or missing image payload",
            ))));
            return;
        };

        let hash = content_hash(&body);
        match state.cache.begin(&hash) {
            Submission::Cached(result) => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    PipelineEvent::new("cache.hit", "server").detail(&hash),
                );
                yield Ok(sse_event(&StreamEvent::Complete(CompletionEvent::replayed(
                    (*result).clone(),
                ))));
            }
            Submission::Joined(rx) => {
                emit_event(
                    Level::INFO,
                    ProcessKind::Engine,
                    PipelineEvent::new("cache.joined", "server").detail(&hash),
                );
                match await_joined(rx).await {
                    RunState::Done(result) => {
                        yield Ok(sse_event(&StreamEvent::Complete(CompletionEvent::replayed(
                            (*result).clone(),
                        ))));
                    }
                    RunState::Failed(reason) => {
                        let reason = reason_of(&reason)
                            .unwrap_or_else(|| "restoration run failed".to_string());
                        yield Ok(sse_event(&StreamEvent::Complete(CompletionEvent::failed(
                            reason,
                        ))));
                    }
                    RunState::Running => {
                        yield Ok(sse_event(&StreamEvent::Complete(CompletionEvent::failed(
                            "restoration run failed",
                        ))));
                    }
                }
            }
            Submission::Primary(guard) => {
                // Dropping this stream (client disconnect) drops both guards:
                // the token cancels the pipeline, and the cache guard removes
                // the in-flight entry so the next submission re-runs.
                let cancel = CancellationToken::new();
                let _cancel_on_drop = cancel.clone().drop_guard();

                let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);
                let deps = state.deps.clone();
                let image = body.to_vec();
                let media = media_type.to_string();
                let pipeline_cancel = cancel.clone();
                let run = tokio::spawn(async move {
                    run_pipeline(&deps, image, media, tx, pipeline_cancel).await
                });

                while let Some(message) = rx.recv().await {
                    yield Ok(sse_event(&StreamEvent::Message(message)));
                }

                match run.await {
                    Ok(Ok(result)) => {
                        let result = Arc::new(result);
                        guard.complete(result.clone());
                        yield Ok(sse_event(&StreamEvent::Complete(CompletionEvent::fresh(
                            (*result).clone(),
                        ))));
                    }
                    Ok(Err(PipelineError::Cancelled)) => {
                        // No terminal event on cancellation; the stream just
                        // closes and the guard removes the in-flight entry.
                        guard.fail("cancelled");
                    }
                    Ok(Err(PipelineError::Invariant(detail))) => {
                        error!(%detail, "pipeline aborted on invariant violation");
                        guard.fail(detail.clone());
                        yield Ok(sse_event(&StreamEvent::Complete(CompletionEvent::failed(
                            detail,
                        ))));
                    }
                    Err(join_err) => {
                        error!(%join_err, "pipeline task failed to join");
                        guard.fail("internal pipeline failure");
                        yield Ok(sse_event(&StreamEvent::Complete(CompletionEvent::failed(
                            "internal pipeline failure",
                        ))));
                    }
                }
            }
        }
    }
}

fn reason_of(reason: &str) -> Option<String> {
    let trimmed = reason.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

async fn budget_snapshot(State(state): State<AppState>) -> Json<BudgetSnapshot> {
    Json(state.deps.invoker.ledger().snapshot())
}

#[derive(Debug, Deserialize)]
struct SetCapInput {
    daily_cap_usd: f64,
}

async fn set_budget_cap(
    State(state): State<AppState>,
    Json(input): Json<SetCapInput>,
) -> Result<Json<BudgetSnapshot>, StatusCode> {
    if !input.daily_cap_usd.is_finite() || input.daily_cap_usd < 0.0 {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    state
        .config
        .update(|c| c.daily_budget_usd = input.daily_cap_usd)
        .await
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    state.deps.invoker.ledger().set_cap(input.daily_cap_usd);
    Ok(Json(state.deps.invoker.ledger().snapshot()))
}

async fn cache_stats(State(state): State<AppState>) -> Json<CacheStats> {
    Json(state.cache.stats())
}

async fn archive_lookup(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> Result<Json<ResurrectionResult>, StatusCode> {
    state
        .cache
        .lookup(&hash)
        .map(|result| Json((*result).clone()))
        .ok_or(StatusCode::NOT_FOUND)
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use palimpsest_agents::AgentDeps;
    use palimpsest_cache::ArchiveCache;
    use palimpsest_core::{
        ConfigStore, EngineConfig, PassthroughEnhancer, ReferenceData, RoleBudgetConfig,
    };
    use palimpsest_providers::{
        BudgetLedger, ModelInvoker, ProviderRegistry, ScriptedOutcome, ScriptedProvider,
    };
    use palimpsest_types::AgentRole;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n";

    async fn test_state(tmp: &TempDir, provider: ScriptedProvider, cap_usd: f64) -> AppState {
        let mut config = EngineConfig::default();
        let mut rates = HashMap::new();
        for role in AgentRole::ALL {
            let model = format!("{role}-model");
            rates.insert(model.clone(), 0.000001);
            config.roles.insert(
                role,
                RoleBudgetConfig {
                    model,
                    deadline_secs: 2,
                    max_tokens: 200,
                },
            );
        }
        config.model_rates = rates.clone();
        config.daily_budget_usd = cap_usd;

        let store = ConfigStore::new(tmp.path().join("config.json")).await.unwrap();
        let invoker = Arc::new(ModelInvoker::new(
            ProviderRegistry::with_providers(vec![Arc::new(provider)]),
            BudgetLedger::new(cap_usd, rates),
        ));
        let deps = AgentDeps {
            invoker,
            enhancer: Arc::new(PassthroughEnhancer),
            reference: Arc::new(ReferenceData::default()),
            config,
        };
        AppState::with_parts(store, ArchiveCache::new(16), deps)
    }

    fn png_payload() -> Vec<u8> {
        let mut payload = PNG_MAGIC.to_vec();
        payload.extend_from_slice(&[42; 120]);
        payload
    }

    async fn post_restore(state: &AppState, payload: Vec<u8>) -> Vec<StreamEvent> {
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/documents/restore")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        text.lines()
            .filter_map(|line| line.strip_prefix("data: "))
            .map(|payload| serde_json::from_str(payload).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn healthz_responds_ok() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp, ScriptedProvider::new("ok"), 5.0).await;
        let response = router(state)
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn invalid_payload_yields_single_error_completion() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp, ScriptedProvider::new("ok"), 5.0).await;

        let events = post_restore(&state, b"not an image".to_vec()).await;
        assert_eq!(events.len(), 1);
        let StreamEvent::Complete(complete) = &events[0] else {
            panic!("expected a terminal event");
        };
        assert!(complete.error.is_some());
        assert!(complete.result.is_none());
    }

    #[tokio::test]
    async fn restore_streams_chatter_then_one_terminal_event() {
        let tmp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new("Agreed.");
        provider.push(
            "scanner-model",
            ScriptedOutcome::text("Kuna Sekuru Kaguvi, ɓasa rapera", 500),
        );
        let state = test_state(&tmp, provider, 5.0).await;

        let events = post_restore(&state, png_payload()).await;
        assert!(events.len() > 2);

        let terminals: Vec<_> = events.iter().filter(|e| e.is_terminal()).collect();
        assert_eq!(terminals.len(), 1);
        assert!(events.last().unwrap().is_terminal());

        let StreamEvent::Complete(complete) = events.last().unwrap() else {
            unreachable!();
        };
        assert!(!complete.cached);
        let result = complete.result.as_ref().unwrap();
        assert!(result.overall_confidence > 0.0);
        assert_eq!(result.raw_ocr_text, "Kuna Sekuru Kaguvi, ɓasa rapera");
    }

    #[tokio::test]
    async fn identical_resubmission_replays_from_cache() {
        let tmp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new("Agreed.");
        provider.push("scanner-model", ScriptedOutcome::text("mambo mukuru", 400));
        let state = test_state(&tmp, provider, 5.0).await;

        let first = post_restore(&state, png_payload()).await;
        let StreamEvent::Complete(first_terminal) = first.last().unwrap().clone() else {
            panic!("expected terminal");
        };

        let second = post_restore(&state, png_payload()).await;
        assert_eq!(second.len(), 1, "cache hit must be a single terminal event");
        let StreamEvent::Complete(replay) = &second[0] else {
            panic!("expected terminal");
        };
        assert!(replay.cached);
        assert_eq!(replay.result, first_terminal.result);
        assert_eq!(state.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn budget_cap_endpoint_updates_ledger_and_config() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp, ScriptedProvider::new("ok"), 5.0).await;

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/budget/cap")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"daily_cap_usd": 9.5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert_eq!(state.deps.invoker.ledger().snapshot().cap_usd, 9.5);
        assert_eq!(state.config.get().await.daily_budget_usd, 9.5);
    }

    #[tokio::test]
    async fn archive_lookup_finds_completed_runs_by_hash() {
        let tmp = TempDir::new().unwrap();
        let provider = ScriptedProvider::new("Agreed.");
        provider.push("scanner-model", ScriptedOutcome::text("gwaro guru", 400));
        let state = test_state(&tmp, provider, 5.0).await;

        let payload = png_payload();
        let hash = content_hash(&payload);
        let _ = post_restore(&state, payload).await;

        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri(format!("/archive/{hash}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let missing = router(state)
            .oneshot(
                Request::builder()
                    .uri(format!("/archive/{}", content_hash(b"never-submitted")))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
