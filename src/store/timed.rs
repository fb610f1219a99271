//! Per-call timeout around a lock store.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use super::LockStore;
use crate::error::{LimiterError, Result};

/// Bounds every call to the inner store.
///
/// A call that does not finish within the timeout fails with
/// [`LimiterError::StoreUnavailable`]. The in-flight call is abandoned, not
/// cancelled at the store.
pub struct TimedLockStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: LockStore> TimedLockStore<S> {
    /// Wrap `inner`, bounding each call by `timeout`.
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: LockStore> LockStore for TimedLockStore<S> {
    async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        match tokio::time::timeout(self.timeout, self.inner.acquire(key, value, ttl)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, timeout = ?self.timeout, "Lock acquire timed out");
                Err(LimiterError::StoreUnavailable(format!(
                    "acquire {} timed out after {:?}",
                    key, self.timeout
                )))
            }
        }
    }

    async fn release(&self, key: &str) -> Result<()> {
        match tokio::time::timeout(self.timeout, self.inner.release(key)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(key = %key, timeout = ?self.timeout, "Lock release timed out");
                Err(LimiterError::StoreUnavailable(format!(
                    "release {} timed out after {:?}",
                    key, self.timeout
                )))
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
