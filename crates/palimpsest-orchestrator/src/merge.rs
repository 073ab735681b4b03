//! Timestamp merge for the parallel fan-out stage.
//!
//! Each concurrent agent owns a private bounded channel. The merge holds at
//! most one head message per slot, yields whichever available head carries
//! the smallest `(timestamp, role priority)`, and when no head is available
//! waits for the next message from any open slot. A closed channel closes
//! its slot. Bounded buffers keep both memory and latency capped: an agent
//! that races ahead blocks on its own channel, not on its siblings.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use palimpsest_types::{AgentMessage, AgentRole};

pub(crate) struct MergeSlot {
    role: AgentRole,
    rx: mpsc::Receiver<AgentMessage>,
    head: Option<AgentMessage>,
    open: bool,
}

impl MergeSlot {
    pub(crate) fn new(role: AgentRole, rx: mpsc::Receiver<AgentMessage>) -> Self {
        Self {
            role,
            rx,
            head: None,
            open: true,
        }
    }

    fn fill(&mut self) {
        if !self.open || self.head.is_some() {
            return;
        }
        match self.rx.try_recv() {
            Ok(msg) => self.head = Some(msg),
            Err(mpsc::error::TryRecvError::Empty) => {}
            Err(mpsc::error::TryRecvError::Disconnected) => self.open = false,
        }
    }

    fn wants_recv(&self) -> bool {
        self.open && self.head.is_none()
    }

    fn settle(&mut self, received: Option<AgentMessage>) {
        match received {
            Some(msg) => self.head = Some(msg),
            None => self.open = false,
        }
    }
}

#[derive(Debug)]
pub(crate) enum MergeAbort {
    Cancelled,
    OutputClosed,
}

/// Drain three concurrent agents into `tx` in non-decreasing timestamp
/// order, ties broken by role priority. Sets the collaboration flag on every
/// message whose role differs from the previously emitted one.
pub(crate) async fn merge_fan_out(
    mut slots: [MergeSlot; 3],
    tx: &mpsc::Sender<AgentMessage>,
    cancel: &CancellationToken,
    mut last_role: AgentRole,
) -> Result<(), MergeAbort> {
    loop {
        let [a, b, c] = &mut slots;
        a.fill();
        b.fill();
        c.fill();

        let next = [&*a, &*b, &*c]
            .into_iter()
            .filter_map(|slot| {
                slot.head
                    .as_ref()
                    .map(|msg| (msg.timestamp, slot.role.merge_priority()))
            })
            .min();

        if let Some((_, priority)) = next {
            let slot = [&mut *a, &mut *b, &mut *c]
                .into_iter()
                .find(|slot| slot.role.merge_priority() == priority)
                .and_then(|slot| slot.head.take());
            let Some(mut msg) = slot else {
                return Err(MergeAbort::OutputClosed);
            };

            msg.collaboration = msg.role != last_role;
            last_role = msg.role;

            tokio::select! {
                _ = cancel.cancelled() => return Err(MergeAbort::Cancelled),
                sent = tx.send(msg) => {
                    if sent.is_err() {
                        return Err(MergeAbort::OutputClosed);
                    }
                }
            }
            continue;
        }

        if !a.open && !b.open && !c.open {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(MergeAbort::Cancelled),
            received = a.rx.recv(), if a.wants_recv() => a.settle(received),
            received = b.rx.recv(), if b.wants_recv() => b.settle(received),
            received = c.rx.recv(), if c.wants_recv() => c.settle(received),
        }
    }
}
