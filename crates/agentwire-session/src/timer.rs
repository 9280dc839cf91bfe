//! Cancellable scheduled tasks.

use std::time::Duration;

use tokio::{sync::mpsc, task::JoinHandle, time::Instant};

/// Stand-in deadline for delays too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A one-shot event posted to a channel after a delay.
///
/// Dropping or cancelling the task aborts it, so an abandoned timer can never
/// fire. Events also carry a generation chosen by the owner, which lets the
/// owner discard an event that was already in flight when it cancelled.
#[derive(Debug)]
pub struct ScheduledTask {
    generation: u64,
    delay: Duration,
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    /// Post `event` to `tx` after `delay`.
    pub fn schedule<T>(
        delay: Duration,
        generation: u64,
        tx: mpsc::UnboundedSender<T>,
        event: T,
    ) -> Self
    where
        T: Send + 'static,
    {
        let now = Instant::now();
        let deadline = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
        let handle = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = tx.send(event);
        });
        Self {
            generation,
            delay,
            handle,
        }
    }

    /// Generation this task was scheduled under.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Delay the task was scheduled with.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Whether the task already ran or was aborted.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the task.
    pub fn cancel(self) {
        drop(self);
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
