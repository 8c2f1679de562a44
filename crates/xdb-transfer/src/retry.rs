//! Command timeouts and bounded exponential-backoff retry.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::{MigrateError, Result};

/// Timeout ceiling classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// Catalog queries, row counts, DDL.
    Metadata,
    /// Row streaming and batch inserts.
    Transfer,
}

/// Retry and timeout policy shared by the exporter and importer.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub metadata_timeout: Duration,
    pub transfer_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            metadata_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries and never times out. Useful in tests.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            metadata_timeout: Duration::from_secs(u32::MAX as u64),
            transfer_timeout: Duration::from_secs(u32::MAX as u64),
        }
    }

    pub fn timeout_for(&self, class: OperationClass) -> Duration {
        match class {
            OperationClass::Metadata => self.metadata_timeout,
            OperationClass::Transfer => self.transfer_timeout,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` under the class timeout, retrying transient failures.
    ///
    /// Non-idempotent operations get exactly one attempt so a retry can never
    /// create a duplicate object.
    pub async fn run<T, F, Fut>(
        &self,
        class: OperationClass,
        idempotent: bool,
        label: &str,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let limit = self.timeout_for(class);
        let max_attempts = if idempotent { self.max_retries + 1 } else { 1 };
        let mut attempt = 0;

        loop {
            let outcome = match tokio::time::timeout(limit, op()).await {
                Ok(result) => result,
                Err(_) => Err(MigrateError::Timeout {
                    operation: label.to_string(),
                    seconds: limit.as_secs_f64(),
                }),
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt + 1 < max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "{}: transient failure (attempt {}/{}), retrying in {:?}: {}",
                        label,
                        attempt + 1,
                        max_attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            metadata_timeout: Duration::from_millis(50),
            transfer_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let p = RetryPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            ..RetryPolicy::default()
        };
        assert_eq!(p.backoff(0), Duration::from_millis(100));
        assert_eq!(p.backoff(1), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(800));
        assert_eq!(p.backoff(4), Duration::from_millis(1000));
        assert_eq!(p.backoff(40), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = fast_policy()
            .run(OperationClass::Transfer, true, "insert", move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(MigrateError::Transient("reset".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let err = fast_policy()
            .run(OperationClass::Transfer, true, "insert", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MigrateError::Transient("reset".into()))
                }
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_non_idempotent_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let _ = fast_policy()
            .run(OperationClass::Metadata, false, "create table", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MigrateError::Transient("reset".into()))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_becomes_timeout_error() {
        let policy = RetryPolicy {
            max_retries: 0,
            ..fast_policy()
        };
        let err = policy
            .run(OperationClass::Metadata, true, "row count", || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_permanent_error_returns_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let _ = fast_policy()
            .run(OperationClass::Transfer, true, "insert", move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MigrateError::ConstraintViolation("dup".into()))
                }
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
