//! Rate-limit retry decorator for any [`SharedStore`].

use async_trait::async_trait;

use crate::address::{CellAddress, CellRange};
use crate::retry::RetryPolicy;
use crate::store::{SharedStore, StoreError};

/// Wraps a store and retries [`StoreError::RateLimited`] with backoff.
///
/// Other errors pass through untouched. A backend-supplied `retry_after`
/// hint is honoured when it is longer than the policy delay.
#[derive(Debug)]
pub struct RetryingStore<S> {
    inner: S,
    policy: RetryPolicy,
}

impl<S: SharedStore> RetryingStore<S> {
    /// Wraps `inner` with `policy`.
    pub fn new(inner: S, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, StoreError>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(StoreError::RateLimited { retry_after }) if self.policy.should_retry(attempt) => {
                    let delay = self
                        .policy
                        .jittered_delay_for(attempt)
                        .max(retry_after.unwrap_or_default());
                    tracing::warn!(
                        op = op_name,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "store rate limited, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<S: SharedStore> SharedStore for RetryingStore<S> {
    async fn read_cell(&self, address: &CellAddress) -> Result<String, StoreError> {
        self.with_retry("read_cell", move || self.inner.read_cell(address))
            .await
    }

    async fn write_cell(&self, address: &CellAddress, value: &str) -> Result<(), StoreError> {
        self.with_retry("write_cell", move || self.inner.write_cell(address, value))
            .await
    }

    async fn read_range(&self, range: &CellRange) -> Result<Vec<Vec<String>>, StoreError> {
        self.with_retry("read_range", move || self.inner.read_range(range))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{FaultKind, FaultTarget};
    use crate::store::InMemoryStore;
    use std::time::Duration;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::fixed(max_attempts, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn rate_limits_are_absorbed() {
        let inner = InMemoryStore::new();
        inner.inject(FaultTarget::Writes, FaultKind::RateLimited, 2);
        let store = RetryingStore::new(inner, policy(3));
        let cell: CellAddress = "A1".parse().unwrap();
        store.write_cell(&cell, "v").await.unwrap();
        assert_eq!(store.inner().get(&cell), "v");
    }

    #[tokio::test]
    async fn exhausted_retries_surface_rate_limit() {
        let inner = InMemoryStore::new();
        inner.inject(FaultTarget::Reads, FaultKind::RateLimited, 5);
        let store = RetryingStore::new(inner, policy(2));
        let err = store.read_cell(&"A1".parse().unwrap()).await.unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let inner = InMemoryStore::new();
        inner.inject(FaultTarget::Reads, FaultKind::Backend, 1);
        let store = RetryingStore::new(inner, policy(5));
        assert!(matches!(
            store.read_range(&"A1:A2".parse().unwrap()).await,
            Err(StoreError::Backend { .. })
        ));
        assert_eq!(store.inner().read_count(), 0);
    }
}
