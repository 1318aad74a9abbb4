//! Retry and deadline policy around command calls.

use std::future::Future;
use std::time::Duration;

use scopelink_transport::TransportError;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, SessionError};

/// Publish retry and call deadline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallPolicy {
    /// Maximum publish attempts per command
    #[serde(default = "default_publish_attempts")]
    pub publish_attempts: u32,
    /// Fixed delay between publish attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Deadline for the whole exchange in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_publish_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    2000
}
fn default_call_timeout_ms() -> u64 {
    10_000
}

impl Default for CallPolicy {
    fn default() -> Self {
        Self {
            publish_attempts: default_publish_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl CallPolicy {
    pub fn with_publish_attempts(mut self, attempts: u32) -> Self {
        self.publish_attempts = attempts.max(1);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Whether another publish attempt can help.
    pub fn is_retryable(error: &TransportError) -> bool {
        !matches!(
            error,
            TransportError::InvalidTopic(_)
                | TransportError::InvalidTopicFilter { .. }
                | TransportError::Serialization(_)
                | TransportError::Closed
        )
    }
}

/// Run `publish` until it succeeds or the attempts are used up.
///
/// The last transport error is returned inside [`SessionError::PublishFailed`].
pub async fn retry_publish<F, Fut>(policy: &CallPolicy, mut publish: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<(), TransportError>>,
{
    let max_attempts = policy.publish_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match publish().await {
            Ok(()) => {
                if attempt > 1 {
                    info!("Publish succeeded on attempt {}/{}", attempt, max_attempts);
                }
                return Ok(());
            }
            Err(e) if attempt < max_attempts && CallPolicy::is_retryable(&e) => {
                warn!(
                    "Publish attempt {}/{} failed: {}; retrying in {:?}",
                    attempt,
                    max_attempts,
                    e,
                    policy.retry_delay()
                );
                tokio::time::sleep(policy.retry_delay()).await;
            }
            Err(e) => {
                warn!("Publish failed after {} attempt(s): {}", attempt, e);
                return Err(SessionError::PublishFailed {
                    attempts: attempt,
                    last_error: e,
                });
            }
        }
    }
}

/// Run `call` under the policy's deadline. The call is not repeated on expiry.
pub async fn with_deadline<T, Fut>(policy: &CallPolicy, call: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let deadline = policy.call_timeout();
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::Timeout(deadline)),
    }
}
