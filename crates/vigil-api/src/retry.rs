//! Backoff for outbound HTTP calls.
//!
//! Only transport errors (refused connections, timeouts) are retried. Any
//! HTTP answer, including 5xx, is handed back to the caller, which decides
//! what the status means for its own protocol.

use std::future::Future;
use std::time::Duration;

/// Exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Backoff {
    /// Attempts after the first one.
    pub retries: u32,
    /// Delay before the first retry; doubled for each later one.
    pub base: Duration,
}

impl Backoff {
    /// Schedule for webhook delivery: 200ms, 400ms, 800ms.
    pub(crate) const WEBHOOK: Backoff = Backoff {
        retries: 3,
        base: Duration::from_millis(200),
    };

    /// Delay before retry number `attempt` (zero-based).
    pub(crate) fn delay(&self, attempt: u32) -> Duration {
        self.base.saturating_mul(1u32 << attempt.min(16))
    }

    /// Call `send` until it yields a response or the schedule runs out.
    pub(crate) async fn send<F, Fut>(
        &self,
        target: &str,
        send: F,
    ) -> Result<reqwest::Response, reqwest::Error>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut attempt = 0;
        loop {
            match send().await {
                Ok(resp) => return Ok(resp),
                Err(e) if attempt < self.retries => {
                    let delay = self.delay(attempt);
                    attempt += 1;
                    tracing::warn!(
                        target_service = target,
                        attempt,
                        retries = self.retries,
                        error = %e,
                        "outbound request failed, retrying in {delay:?}"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
