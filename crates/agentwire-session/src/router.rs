//! Inbound event router.
//!
//! Demultiplexes validated envelopes to one handler per discriminant. A
//! handler that errors or panics is contained here; the router keeps going
//! with the next envelope.

use std::{
    collections::HashMap,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use agentwire_core::{Consumer, Envelope, EnvelopeKind, HandlerError, ProtocolError};

/// Handler for one or more discriminants.
pub trait EventHandler: Send + Sync {
    /// Handle one envelope.
    ///
    /// # Errors
    /// Returns [`HandlerError`] if the envelope could not be handled. The
    /// error is logged by the router and does not affect later dispatches.
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&Envelope) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        self(envelope)
    }
}

/// What happened to one inbound envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A handler ran and succeeded.
    Handled,
    /// No handler registered for the discriminant.
    Unhandled,
    /// The frame was not a valid envelope.
    Malformed,
    /// The handler returned an error or panicked.
    HandlerFailed,
}

/// Cumulative dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub handled: u64,
    pub unhandled: u64,
    pub malformed: u64,
    pub failed: u64,
}

/// Routes envelopes to handlers by discriminant.
#[derive(Default)]
pub struct EventRouter {
    handlers: HashMap<EnvelopeKind, Arc<dyn EventHandler>>,
    stats: RouterStats,
}

impl fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.handlers.keys().map(EnvelopeKind::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("EventRouter")
            .field("kinds", &kinds)
            .field("stats", &self.stats)
            .finish()
    }
}

impl EventRouter {
    /// Create a router with no handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `kind`, replacing any previous binding.
    pub fn register_handler(
        &mut self,
        kind: impl Into<EnvelopeKind>,
        handler: impl EventHandler + 'static,
    ) {
        self.register_shared(kind.into(), Arc::new(handler));
    }

    /// Bind one handler to every discriminant routed to `consumer`.
    pub fn register_consumer(&mut self, consumer: Consumer, handler: impl EventHandler + 'static) {
        let handler: Arc<dyn EventHandler> = Arc::new(handler);
        for kind in consumer.kinds() {
            self.register_shared(kind, Arc::clone(&handler));
        }
    }

    fn register_shared(&mut self, kind: EnvelopeKind, handler: Arc<dyn EventHandler>) {
        if self.handlers.insert(kind.clone(), handler).is_some() {
            tracing::debug!(kind = %kind, "Replaced event handler");
        }
    }

    /// Remove the handler for `kind`. Returns whether one was bound.
    pub fn unregister(&mut self, kind: &EnvelopeKind) -> bool {
        self.handlers.remove(kind).is_some()
    }

    /// Whether a handler is bound to `kind`.
    #[must_use]
    pub fn has_handler(&self, kind: &EnvelopeKind) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Counters since the router was created.
    #[must_use]
    pub const fn stats(&self) -> RouterStats {
        self.stats
    }

    /// Parse one text frame and dispatch it.
    pub fn dispatch_frame(&mut self, text: &str) -> DispatchOutcome {
        match Envelope::parse(text) {
            Ok(envelope) => self.dispatch(&envelope),
            Err(error) => self.reject(&error),
        }
    }

    /// Record and log a frame that failed validation.
    pub fn reject(&mut self, error: &ProtocolError) -> DispatchOutcome {
        tracing::warn!("Dropping malformed envelope: {error}");
        self.stats.malformed += 1;
        DispatchOutcome::Malformed
    }

    /// Dispatch a validated envelope to its handler.
    pub fn dispatch(&mut self, envelope: &Envelope) -> DispatchOutcome {
        let Some(handler) = self.handlers.get(&envelope.kind) else {
            if envelope.kind.is_recognized() {
                tracing::debug!(kind = %envelope.kind, "No handler registered");
            } else {
                tracing::info!(kind = %envelope.kind, "Ignoring unrecognized envelope type");
            }
            self.stats.unhandled += 1;
            return DispatchOutcome::Unhandled;
        };

        match catch_unwind(AssertUnwindSafe(|| handler.handle(envelope))) {
            Ok(Ok(())) => {
                self.stats.handled += 1;
                DispatchOutcome::Handled
            }
            Ok(Err(error)) => {
                tracing::warn!(kind = %envelope.kind, id = ?envelope.id, "Handler failed: {error}");
                self.stats.failed += 1;
                DispatchOutcome::HandlerFailed
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    kind = %envelope.kind,
                    id = ?envelope.id,
                    "Handler panicked: {message}"
                );
                self.stats.failed += 1;
                DispatchOutcome::HandlerFailed
            }
        }
    }
}
