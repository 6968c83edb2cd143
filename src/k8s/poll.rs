//! Readiness polling
//!
//! Polls a status check until it reports ready. Read errors count as "not
//! ready yet". There is no deadline unless one is configured.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Delay between attempts and an optional overall deadline
#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub interval: Duration,
    pub deadline: Option<Duration>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(2),
            deadline: None,
        }
    }
}

impl PollConfig {
    /// No delay between attempts; for tests
    pub fn immediate() -> Self {
        Self {
            interval: Duration::ZERO,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Run `check` until it returns `Ok(true)`.
///
/// Returns the number of attempts it took. Fails only when a deadline is
/// configured and has passed.
pub async fn poll_until<F, Fut>(config: &PollConfig, what: &str, mut check: F) -> Result<u32>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match check().await {
            Ok(true) => {
                debug!(what, attempt, "Ready");
                return Ok(attempt);
            }
            Ok(false) => debug!(what, attempt, "Not ready yet"),
            Err(e) => warn!(
                what,
                attempt,
                error = %e,
                "An error occurred while waiting. Ignore and keep on trying.."
            ),
        }

        if let Some(deadline) = config.deadline {
            if started.elapsed() >= deadline {
                return Err(Error::Timeout(what.to_string()));
            }
        }

        if config.interval.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(config.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn test_retries_through_transient_errors() {
        let calls = AtomicU32::new(0);

        let attempts = assert_ok!(
            poll_until(&PollConfig::immediate(), "deployment svc1", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    match n {
                        0 => Err(api_error(500, "InternalError")),
                        1 => Ok(false),
                        _ => Ok(true),
                    }
                }
            })
            .await
        );

        assert_eq!(attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_is_honoured() {
        let config = PollConfig::default().with_deadline(Duration::from_secs(5));

        let err = assert_err!(
            poll_until(&config, "daemonset network-control", || async { Ok(false) }).await
        );

        assert!(matches!(err, Error::Timeout(_)));
    }
}
