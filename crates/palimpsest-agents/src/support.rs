use std::time::Duration;

use anyhow::anyhow;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{warn, Level};

use palimpsest_core::{MessageEmitter, RoleBudgetConfig};
use palimpsest_observability::{emit_event, PipelineEvent, ProcessKind};
use palimpsest_providers::{InvocationRequest, InvokeError, ModelInvoker};

/// Run one model call under the role's deadline and token budget.
///
/// `Ok(Some(text))` is the assisted path; `Ok(None)` means the call could not
/// complete and the single `fallback`-tagged message has already been
/// emitted, so the caller continues down its rule-based path. Cancellation
/// propagates as an error and the agent stops without a completion message.
pub(crate) async fn model_insight(
    invoker: &ModelInvoker,
    budget: &RoleBudgetConfig,
    system_prompt: &str,
    user_input: &str,
    image: Option<(String, String)>,
    cancel: &CancellationToken,
    emitter: &mut MessageEmitter,
) -> anyhow::Result<Option<String>> {
    let (image_base64, image_media_type) = match image {
        Some((data, media)) => (Some(data), Some(media)),
        None => (None, None),
    };
    let request = InvocationRequest {
        model_id: budget.model.clone(),
        system_prompt: system_prompt.to_string(),
        user_input: user_input.to_string(),
        image_base64,
        image_media_type,
        max_tokens: budget.max_tokens,
        deadline: Instant::now() + Duration::from_secs(budget.deadline_secs),
    };

    let role = emitter.role();
    match invoker.invoke(request, cancel).await {
        Ok(text) => Ok(Some(text)),
        Err(InvokeError::Cancelled) => Err(anyhow!("model call cancelled")),
        Err(err) => {
            let error_code = match &err {
                InvokeError::BudgetExceeded => "budget_exceeded",
                InvokeError::Timeout => "timeout",
                InvokeError::Model { .. } => "model_error",
                InvokeError::Cancelled => unreachable!("handled above"),
            };
            warn!(role = %role, model = %budget.model, %err, "model call failed, taking rule-based path");
            emit_event(
                Level::WARN,
                ProcessKind::Engine,
                PipelineEvent::new("model.fallback", "agents")
                    .role(role.as_str())
                    .model(&budget.model)
                    .error_code(error_code),
            );
            emitter
                .fallback(format!(
                    "Skipping AI-assisted insight ({}); continuing with the rule-based path",
                    fallback_reason(&err)
                ))
                .await?;
            Ok(None)
        }
    }
}

fn fallback_reason(err: &InvokeError) -> &'static str {
    match err {
        InvokeError::BudgetExceeded => "daily model budget exhausted",
        InvokeError::Timeout => "model deadline elapsed",
        InvokeError::Model { .. } => "model endpoint unavailable",
        InvokeError::Cancelled => "cancelled",
    }
}

/// First line of a model response, trimmed, for use in a chat message.
pub(crate) fn first_line(text: &str) -> &str {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_line_skips_leading_blank_lines() {
        assert_eq!(first_line("\n\n  the verdict  \nrest"), "the verdict");
        assert_eq!(first_line(""), "");
    }
}
