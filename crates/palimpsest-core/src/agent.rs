use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use palimpsest_types::{section, AgentMessage, AgentRole};

use crate::context::SharedContext;

#[derive(Debug, Error)]
pub enum EmitError {
    #[error("pipeline cancelled")]
    Cancelled,
    #[error("message channel closed")]
    Closed,
}

/// Uniform worker contract. Each agent emits an activation notice first, any
/// number of intermediate messages, and a completion notice carrying its
/// final confidence last; findings are written into the shared context
/// before the completion message goes out.
#[async_trait]
pub trait RestorationAgent: Send + Sync {
    fn role(&self) -> AgentRole;

    /// Wall-clock budget for this agent's model calls. Expiry cancels the
    /// outstanding call only; the agent still runs to completion.
    fn deadline(&self) -> Duration;

    /// Upper bound on completion tokens per invocation.
    fn token_budget(&self) -> u32;

    async fn process(
        &self,
        ctx: &SharedContext,
        emitter: &mut MessageEmitter,
    ) -> anyhow::Result<()>;
}

/// Sends one agent's messages into the orchestrator's channel.
///
/// Timestamps are clamped monotonically per agent, and every send observes
/// the ambient cancellation token: a blocked send (back-pressure) wakes up
/// and fails when the run is cancelled.
pub struct MessageEmitter {
    role: AgentRole,
    tx: mpsc::Sender<AgentMessage>,
    cancel: CancellationToken,
    last_timestamp: DateTime<Utc>,
}

impl MessageEmitter {
    pub fn new(role: AgentRole, tx: mpsc::Sender<AgentMessage>, cancel: CancellationToken) -> Self {
        Self {
            role,
            tx,
            cancel,
            last_timestamp: DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// The run's ambient cancellation token; agents pass a clone into their
    /// model calls so deadline expiry and client disconnect compose.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    fn stamp(&mut self) -> DateTime<Utc> {
        let ts = Utc::now().max(self.last_timestamp);
        self.last_timestamp = ts;
        ts
    }

    /// Low-level send for callers that build their own message (e.g. to
    /// attach metadata). The timestamp is clamped into this agent's
    /// monotonic sequence like every helper above.
    pub async fn emit(&mut self, mut message: AgentMessage) -> Result<(), EmitError> {
        message.timestamp = message.timestamp.max(self.last_timestamp);
        self.last_timestamp = message.timestamp;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(EmitError::Cancelled),
            sent = self.tx.send(message) => sent.map_err(|_| EmitError::Closed),
        }
    }

    /// First message of the run; carries no confidence.
    pub async fn activation(&mut self, text: impl Into<String>) -> Result<(), EmitError> {
        let msg =
            AgentMessage::new(self.role, text, self.stamp()).with_section(section::ACTIVATION);
        self.emit(msg).await
    }

    pub async fn note(&mut self, text: impl Into<String>) -> Result<(), EmitError> {
        let msg = AgentMessage::new(self.role, text, self.stamp());
        self.emit(msg).await
    }

    pub async fn note_scored(
        &mut self,
        text: impl Into<String>,
        confidence: f32,
    ) -> Result<(), EmitError> {
        let msg = AgentMessage::new(self.role, text, self.stamp()).with_confidence(confidence);
        self.emit(msg).await
    }

    /// The single `fallback`-tagged message an agent emits when a model call
    /// could not complete and the rule-based path takes over.
    pub async fn fallback(&mut self, text: impl Into<String>) -> Result<(), EmitError> {
        let msg = AgentMessage::new(self.role, text, self.stamp()).with_section(section::FALLBACK);
        self.emit(msg).await
    }

    /// Last message of the run; carries the agent's final confidence.
    pub async fn completion(
        &mut self,
        text: impl Into<String>,
        confidence: f32,
    ) -> Result<(), EmitError> {
        let msg = AgentMessage::new(self.role, text, self.stamp())
            .with_section(section::COMPLETION)
            .with_confidence(confidence);
        self.emit(msg).await
    }

    /// Terminal notice for an agent whose required upstream field is absent:
    /// confidence 0, `no_input` tag, no findings written.
    pub async fn no_input_completion(&mut self, text: impl Into<String>) -> Result<(), EmitError> {
        let msg = AgentMessage::new(self.role, text, self.stamp())
            .with_section(section::NO_INPUT)
            .with_confidence(0.0);
        self.emit(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emitter(capacity: usize) -> (MessageEmitter, mpsc::Receiver<AgentMessage>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            MessageEmitter::new(AgentRole::Scanner, tx, CancellationToken::new()),
            rx,
        )
    }

    #[tokio::test]
    async fn timestamps_are_monotonic_per_agent() {
        let (mut emitter, mut rx) = emitter(8);
        emitter.activation("waking").await.unwrap();
        emitter.note("reading").await.unwrap();
        emitter.completion("done", 80.0).await.unwrap();

        let mut last = DateTime::<Utc>::MIN_UTC;
        while let Ok(msg) = rx.try_recv() {
            assert!(msg.timestamp >= last);
            last = msg.timestamp;
        }
    }

    #[tokio::test]
    async fn activation_and_completion_are_tagged() {
        let (mut emitter, mut rx) = emitter(8);
        emitter.activation("waking").await.unwrap();
        emitter.completion("done", 55.0).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.section.as_deref(), Some(section::ACTIVATION));
        assert!(first.confidence.is_none());

        let last = rx.recv().await.unwrap();
        assert_eq!(last.section.as_deref(), Some(section::COMPLETION));
        assert_eq!(last.confidence, Some(55.0));
    }

    #[tokio::test]
    async fn cancelled_emitter_refuses_to_send() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mut emitter = MessageEmitter::new(AgentRole::Linguist, tx, cancel.clone());
        cancel.cancel();
        let err = emitter.note("too late").await.unwrap_err();
        assert!(matches!(err, EmitError::Cancelled));
    }

    #[tokio::test]
    async fn blocked_send_unblocks_on_cancellation() {
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let mut emitter = MessageEmitter::new(AgentRole::Historian, tx, cancel.clone());
        emitter.note("fills the channel").await.unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = emitter.note("blocked until cancel").await.unwrap_err();
        assert!(matches!(err, EmitError::Cancelled));
    }
}
