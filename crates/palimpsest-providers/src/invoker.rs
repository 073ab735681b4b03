//! Single egress for outbound model calls.
//!
//! Every call reserves its estimated cost before sending and settles the
//! reservation exactly once afterwards, runs under an absolute deadline, and
//! observes the ambient cancellation token. There are no retries here;
//! recovery policy belongs to the agents.

use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::budget::{BudgetError, BudgetLedger};
use crate::{ModelCall, ProviderError, ProviderRegistry};

/// Callers truncate free-form document text to this many characters before
/// handing it to the invoker; the invoker clips again defensively so an
/// oversized prompt can never inflate a reservation.
pub const MAX_INPUT_CHARS: usize = 1_500;

/// Clip `input` to [`MAX_INPUT_CHARS`] characters on a char boundary.
pub fn clip_input(input: &str) -> &str {
    match input.char_indices().nth(MAX_INPUT_CHARS) {
        Some((byte_idx, _)) => &input[..byte_idx],
        None => input,
    }
}

#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("daily model budget exhausted")]
    BudgetExceeded,
    #[error("model call exceeded its deadline")]
    Timeout,
    #[error("model call failed: {reason}")]
    Model { status: Option<u16>, reason: String },
    #[error("model call cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct InvocationRequest {
    pub model_id: String,
    pub system_prompt: String,
    pub user_input: String,
    pub image_base64: Option<String>,
    pub image_media_type: Option<String>,
    pub max_tokens: u32,
    pub deadline: Instant,
}

#[derive(Clone)]
pub struct ModelInvoker {
    registry: ProviderRegistry,
    ledger: BudgetLedger,
}

impl ModelInvoker {
    pub fn new(registry: ProviderRegistry, ledger: BudgetLedger) -> Self {
        Self { registry, ledger }
    }

    pub fn ledger(&self) -> &BudgetLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Send one model call. Exactly one of record/release is applied to the
    /// reservation on every path out of this function.
    pub async fn invoke(
        &self,
        req: InvocationRequest,
        cancel: &CancellationToken,
    ) -> Result<String, InvokeError> {
        let input = clip_input(&req.user_input);

        let ticket = self
            .ledger
            .reserve(&req.model_id, input.chars().count(), req.max_tokens)
            .map_err(|err| match err {
                BudgetError::Exceeded { .. } => InvokeError::BudgetExceeded,
                BudgetError::UnknownModel(model) => InvokeError::Model {
                    status: None,
                    reason: format!("model `{model}` is not registered"),
                },
            })?;

        let Some(provider) = self.registry.for_model(&req.model_id).await else {
            self.ledger.release(ticket);
            return Err(InvokeError::Model {
                status: None,
                reason: format!("no configured provider serves model `{}`", req.model_id),
            });
        };

        if !provider.can_invoke() {
            self.ledger.release(ticket);
            return Err(InvokeError::Model {
                status: None,
                reason: format!(
                    "provider `{}` is missing credentials",
                    provider.info().id
                ),
            });
        }

        let call = ModelCall {
            model_id: req.model_id.clone(),
            system_prompt: req.system_prompt,
            user_input: input.to_string(),
            image_base64: req.image_base64,
            image_media_type: req.image_media_type,
            max_tokens: req.max_tokens,
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.ledger.release(ticket);
                return Err(InvokeError::Cancelled);
            }
            outcome = tokio::time::timeout_at(req.deadline, provider.complete(&call)) => outcome,
        };

        match outcome {
            // Deadline elapsed: dropping the future aborts the in-flight
            // request, and the reservation rolls back untouched.
            Err(_elapsed) => {
                self.ledger.release(ticket);
                Err(InvokeError::Timeout)
            }
            Ok(Err(ProviderError { status, reason })) => {
                self.ledger.release(ticket);
                Err(InvokeError::Model { status, reason })
            }
            Ok(Ok(completion)) => {
                debug!(
                    model = %req.model_id,
                    input_tokens = completion.usage.input_tokens,
                    output_tokens = completion.usage.output_tokens,
                    "model call settled"
                );
                self.ledger.record(ticket, completion.usage.total_tokens);
                Ok(completion.text)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripted::{ScriptedOutcome, ScriptedProvider};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn invoker_with(provider: ScriptedProvider, cap_usd: f64) -> ModelInvoker {
        let mut rates = HashMap::new();
        rates.insert("scripted-model".to_string(), 0.00001);
        let ledger = BudgetLedger::new(cap_usd, rates);
        let registry = ProviderRegistry::with_providers(vec![Arc::new(provider)]);
        ModelInvoker::new(registry, ledger)
    }

    fn request(deadline_in: Duration) -> InvocationRequest {
        InvocationRequest {
            model_id: "scripted-model".to_string(),
            system_prompt: "transliterate".to_string(),
            user_input: "ɓasa guru".to_string(),
            image_base64: None,
            image_media_type: None,
            max_tokens: 256,
            deadline: Instant::now() + deadline_in,
        }
    }

    #[test]
    fn clip_input_is_char_boundary_safe() {
        let long = "ŋ".repeat(MAX_INPUT_CHARS + 10);
        let clipped = clip_input(&long);
        assert_eq!(clipped.chars().count(), MAX_INPUT_CHARS);
        assert!(clip_input("short").eq("short"));
    }

    #[tokio::test]
    async fn successful_call_records_actual_cost() {
        let provider = ScriptedProvider::new("basa guru");
        provider.push(
            "scripted-model",
            ScriptedOutcome::text("basa guru", 2_000),
        );
        let invoker = invoker_with(provider, 1.0);

        let text = invoker
            .invoke(request(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "basa guru");

        let snap = invoker.ledger().snapshot();
        assert_eq!(snap.reserved_usd, 0.0);
        assert!((snap.spent_usd - 0.02).abs() < 1e-9);
        assert_eq!(snap.calls_today, 1);
    }

    #[tokio::test]
    async fn budget_exhaustion_rejects_without_sending() {
        let provider = ScriptedProvider::new("unreachable");
        let invoker = invoker_with(provider, 0.0);

        let err = invoker
            .invoke(request(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::BudgetExceeded));
        assert_eq!(invoker.ledger().snapshot().calls_today, 0);
    }

    #[tokio::test]
    async fn model_error_releases_the_reservation() {
        let provider = ScriptedProvider::new("ok");
        provider.push(
            "scripted-model",
            ScriptedOutcome::fail(Some(529), "overloaded"),
        );
        let invoker = invoker_with(provider, 1.0);

        let err = invoker
            .invoke(request(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Model { status: Some(529), .. }));

        let snap = invoker.ledger().snapshot();
        assert_eq!(snap.reserved_usd, 0.0);
        assert_eq!(snap.spent_usd, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_elapse_times_out_and_releases() {
        let provider = ScriptedProvider::new("late");
        provider.push(
            "scripted-model",
            ScriptedOutcome::stall(Duration::from_secs(60)),
        );
        let invoker = invoker_with(provider, 1.0);

        let err = invoker
            .invoke(
                request(Duration::from_millis(100)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Timeout));
        assert_eq!(invoker.ledger().snapshot().reserved_usd, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_releases_and_reports_cancelled() {
        let provider = ScriptedProvider::new("late");
        provider.push(
            "scripted-model",
            ScriptedOutcome::stall(Duration::from_secs(60)),
        );
        let invoker = invoker_with(provider, 1.0);

        let cancel = CancellationToken::new();
        let invoke = invoker.invoke(request(Duration::from_secs(120)), &cancel);
        tokio::pin!(invoke);

        tokio::select! {
            _ = &mut invoke => panic!("call resolved before cancellation"),
            _ = tokio::time::sleep(Duration::from_millis(10)) => cancel.cancel(),
        }

        let err = invoke.await.unwrap_err();
        assert!(matches!(err, InvokeError::Cancelled));
        assert_eq!(invoker.ledger().snapshot().reserved_usd, 0.0);
    }

    #[tokio::test]
    async fn unregistered_model_is_a_model_error() {
        let provider = ScriptedProvider::new("ok");
        let invoker = invoker_with(provider, 1.0);
        let mut req = request(Duration::from_secs(5));
        req.model_id = "unbudgeted-model".to_string();

        let err = invoker
            .invoke(req, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, InvokeError::Model { .. }));
    }
}
