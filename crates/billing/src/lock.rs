//! TTL-bound distributed locks on top of the counter store
//!
//! A lock is a key holding a random token. Only the holder of the token can
//! release it, and the TTL bounds how long a crashed holder can keep it.
//! The guard releases on drop if [`DistributedLock::release`] was never called.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::counter::CounterStore;
use crate::error::BillingResult;

pub struct DistributedLock {
    store: Arc<dyn CounterStore>,
    key: String,
    token: String,
    released: bool,
}

impl DistributedLock {
    /// Try to take the lock. `None` means someone else holds it.
    pub async fn acquire(
        store: Arc<dyn CounterStore>,
        key: impl Into<String>,
        ttl: Duration,
    ) -> BillingResult<Option<Self>> {
        let key = key.into();
        let token = Uuid::new_v4().to_string();

        if !store.try_acquire_lock(&key, &token, ttl).await? {
            tracing::debug!(key = %key, "Lock held elsewhere");
            return Ok(None);
        }

        Ok(Some(Self {
            store,
            key,
            token,
            released: false,
        }))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release now. A lock that already expired is not an error.
    pub async fn release(mut self) -> BillingResult<()> {
        self.released = true;
        if !self.store.release_lock(&self.key, &self.token).await? {
            tracing::warn!(key = %self.key, "Lock expired before release");
        }
        Ok(())
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.release_lock(&key, &token).await {
                        tracing::error!(key = %key, error = %e, "Failed to release dropped lock");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(key = %key, "No runtime to release dropped lock; it will expire");
            }
        }
    }
}
