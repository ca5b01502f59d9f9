use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Delay applied before an upload goes back into the queue after a
/// transient failure. Attempts are unbounded; only the log shows how many
/// there were.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }

    /// Sleeps for the delay of `attempt`; returns `false` if `cancel` fired
    /// first.
    pub async fn wait(&self, attempt: u32, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.delay(attempt)) => true,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}
