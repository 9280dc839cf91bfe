//! Outbound message queue.
//!
//! Unbounded by design: nothing is ever dropped to make room. Integrators who
//! need backpressure should bound the number of unsent messages before
//! calling `send`, using [`OutboundQueue::len`].

use std::collections::VecDeque;

use agentwire_core::{Envelope, SendFailure};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Where a flush delivers envelopes.
#[async_trait]
pub trait OutboundSink: Send {
    /// Attempt to transmit one envelope.
    async fn transmit(&mut self, envelope: &Envelope) -> Result<(), SendFailure>;
}

/// An envelope waiting to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub envelope: Envelope,
    pub enqueued_at: DateTime<Utc>,
    /// Transmit attempts made so far.
    pub attempts: u32,
}

/// Result of one flush.
#[derive(Debug, Default)]
pub struct FlushReport {
    /// Envelopes transmitted and removed.
    pub delivered: usize,
    /// Envelopes still queued.
    pub remaining: usize,
    /// The failure that halted the flush, if any.
    pub failure: Option<SendFailure>,
}

impl FlushReport {
    /// Whether the flush stopped on a failure.
    #[must_use]
    pub const fn halted(&self) -> bool {
        self.failure.is_some()
    }
}

/// FIFO queue of outbound envelopes.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedMessage>,
}

impl OutboundQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail. Returns the new length.
    pub fn enqueue(&mut self, envelope: Envelope) -> usize {
        tracing::trace!(kind = %envelope.kind, id = ?envelope.id, "Enqueued envelope");
        self.entries.push_back(QueuedMessage {
            envelope,
            enqueued_at: Utc::now(),
            attempts: 0,
        });
        self.entries.len()
    }

    /// Send head-to-tail until empty or the first failure.
    ///
    /// A failed entry stays at the head, followed by everything behind it in
    /// the original order.
    pub async fn flush<S>(&mut self, sink: &mut S) -> FlushReport
    where
        S: OutboundSink + ?Sized,
    {
        let mut delivered = 0;

        while let Some(front) = self.entries.front_mut() {
            front.attempts += 1;
            match sink.transmit(&front.envelope).await {
                Ok(()) => {
                    self.entries.pop_front();
                    delivered += 1;
                }
                Err(failure) => {
                    tracing::warn!(
                        delivered,
                        remaining = self.entries.len(),
                        "Flush halted: {failure}"
                    );
                    return FlushReport {
                        delivered,
                        remaining: self.entries.len(),
                        failure: Some(failure),
                    };
                }
            }
        }

        if delivered > 0 {
            tracing::debug!(delivered, "Flushed outbound queue");
        }
        FlushReport {
            delivered,
            remaining: 0,
            failure: None,
        }
    }

    /// Number of queued envelopes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshot of the queued entries, head first.
    #[must_use]
    pub fn pending(&self) -> Vec<QueuedMessage> {
        self.entries.iter().cloned().collect()
    }
}
