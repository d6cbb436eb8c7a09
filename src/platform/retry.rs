use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tracing::warn;

use super::BackendError;
use crate::config::BackendConfig;

/// Timeout and retry budget applied to every backend call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_retries: config.max_retries,
            backoff: config.backoff(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&BackendConfig::default())
    }
}

/// Run `op` with a per-attempt timeout, retrying with exponential backoff.
///
/// The first attempt plus `max_retries` retries are made; after that the
/// operation is abandoned with [`BackendError::RetriesExhausted`]. A 4xx
/// rejection is returned at once since repeating the request cannot help.
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_retries + 1;
    let mut backoff = policy.backoff;
    let mut last = String::new();

    for attempt in 1..=attempts {
        let outcome = match tokio::time::timeout(policy.timeout, op()).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout {
                operation: operation.to_string(),
                after: policy.timeout,
            }
            .into()),
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(e) if is_permanent(&e) => {
                warn!("{} rejected, not retrying: {:#}", operation, e);
                return Err(e);
            }
            Err(e) => {
                last = format!("{:#}", e);
                if attempt < attempts {
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, attempt, attempts, last, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    Err(BackendError::RetriesExhausted {
        operation: operation.to_string(),
        attempts,
        last,
    }
    .into())
}

fn is_permanent(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<BackendError>(),
        Some(BackendError::Rejected { status, .. }) if *status < 500
    )
}
