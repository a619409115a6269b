//! Bounded exponential-backoff retry for outbound calls.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Sleep before the retry that follows failed attempt `attempt` (0-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

#[derive(Error, Debug)]
pub enum RetryError {
    #[error("operation cancelled")]
    Cancelled,

    #[error("max retry count {attempts} reached: {last}")]
    Exhausted { attempts: u32, last: anyhow::Error },
}

/// Run `op` until it succeeds, the attempts run out, or `cancel` fires.
pub async fn with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    let mut last = anyhow::anyhow!("no attempt made");
    for attempt in 0..policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => last = err,
        }
        if attempt + 1 == policy.max_attempts {
            break;
        }
        let backoff = policy.backoff_for(attempt);
        warn!("encountered error, retrying in {backoff:?}: {last:#}");
        tokio::select! {
            _ = cancel.cancelled() => return Err(RetryError::Cancelled),
            _ = tokio::time::sleep(backoff) => {}
        }
    }
    Err(RetryError::Exhausted {
        attempts: policy.max_attempts,
        last,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_up_to_ceiling() {
        let policy = RetryPolicy::default();
        let sleeps: Vec<Duration> = (0..12).map(|n| policy.backoff_for(n)).collect();
        assert_eq!(sleeps[0], Duration::from_secs(1));
        assert_eq!(sleeps[1], Duration::from_secs(2));
        assert_eq!(sleeps[5], Duration::from_secs(32));
        assert_eq!(sleeps[6], Duration::from_secs(60));
        assert!(sleeps.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(policy.backoff_for(40), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = with_retry(&CancellationToken::new(), fast_policy(5), || {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 3 {
                    anyhow::bail!("transient {n}");
                }
                Ok(n)
            }
        })
        .await
        .expect("eventual success");
        assert_eq!(result, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn exhaustion_names_attempt_count() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = with_retry(&CancellationToken::new(), fast_policy(3), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(anyhow::anyhow!("still down"))
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.to_string(), "max retry count 3 reached: still down");
    }

    #[tokio::test]
    async fn cancelled_token_aborts_without_calling() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let err = with_retry(&cancel, fast_policy(3), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Cancelled));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_during_backoff_stops_retrying() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(30),
            max_backoff: Duration::from_secs(30),
        };
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let err = with_retry(&cancel, policy, || async {
            Err::<(), _>(anyhow::anyhow!("down"))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, RetryError::Cancelled));
    }
}
