//! Lock store strategy.
//!
//! The lock store is the only shared mutable state of the limiter. Every
//! gate decision is serialized by the store's atomic set-if-absent; the gates
//! themselves hold no locks across a store call.

mod memory;
mod timed;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::clock::SystemClock;
use crate::error::{LimiterError, Result};

pub use memory::InMemoryLockStore;
pub use timed::TimedLockStore;

/// Name of the built-in in-memory backend.
pub const MEMORY_BACKEND: &str = "memory";

/// Trait for lock store implementations.
///
/// Implementations must make `acquire` a single atomic check-and-set; the
/// protocol is not correct against a store that checks and sets separately.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Create `key` with `value` and the given TTL if it does not exist.
    ///
    /// Returns `true` iff this call created the key. A live key is never
    /// overwritten.
    async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Delete `key` if present. Releasing a missing key is not an error.
    async fn release(&self, key: &str) -> Result<()>;

    /// Backend name for logging.
    fn name(&self) -> &'static str;
}

#[async_trait]
impl<S: LockStore + ?Sized> LockStore for Arc<S> {
    async fn acquire(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        (**self).acquire(key, value, ttl).await
    }

    async fn release(&self, key: &str) -> Result<()> {
        (**self).release(key).await
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Resolve a configured backend name to a lock store.
///
/// Called once at startup. `timeout` bounds every store call; a call that
/// runs past it fails as [`LimiterError::StoreUnavailable`].
pub fn connect(backend: &str, timeout: Option<Duration>) -> Result<Arc<dyn LockStore>> {
    let store: Arc<dyn LockStore> = match backend {
        MEMORY_BACKEND => match timeout {
            Some(timeout) => Arc::new(TimedLockStore::new(
                InMemoryLockStore::new(SystemClock),
                timeout,
            )),
            None => Arc::new(InMemoryLockStore::new(SystemClock)),
        },
        other => return Err(LimiterError::UnsupportedBackend(other.to_string())),
    };

    info!(backend = %backend, timeout = ?timeout, "Lock store initialized");
    Ok(store)
}
