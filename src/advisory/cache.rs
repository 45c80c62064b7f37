use std::future::Future;
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::warn;

use super::Advisory;

/// The slow refresh collaborator: external sensor/weather fetches plus model
/// inference. Must be idempotent and safe to retry.
pub trait AdvisoryProvider {
    fn refresh(&self, occupancy: usize) -> impl Future<Output = Result<Advisory>> + Send;
}

/// Time-debounced wrapper around an [`AdvisoryProvider`].
///
/// The current value is an `Arc` swapped wholesale under a short write lock,
/// so concurrent readers either see the previous advisory or the new one,
/// never a torn mix. Refresh failures degrade to the last good value (or a
/// neutral fallback before any success) instead of surfacing to the caller;
/// a stale advisory beats a stalled aggregation loop.
pub struct AdvisoryCache<P> {
    provider: P,
    ttl: Duration,
    current: RwLock<Option<Arc<Advisory>>>,
}

impl<P: AdvisoryProvider> AdvisoryCache<P> {
    pub fn new(provider: P, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            current: RwLock::new(None),
        }
    }

    /// Latest advisory without triggering a refresh.
    pub fn peek(&self) -> Option<Arc<Advisory>> {
        self.current.read().unwrap().clone()
    }

    pub async fn get(&self, occupancy: usize, now: DateTime<Utc>) -> Arc<Advisory> {
        if let Some(cached) = self.peek() {
            if now - cached.fetched_at < self.ttl {
                return cached;
            }
        }

        // Lock is not held across the refresh; a concurrent get may race to
        // refresh too, which is harmless (the provider is idempotent).
        match self.provider.refresh(occupancy).await {
            Ok(advisory) => {
                let advisory = Arc::new(advisory);
                *self.current.write().unwrap() = Some(advisory.clone());
                advisory
            }
            Err(err) => {
                warn!("advisory refresh failed, serving last good value: {err:#}");
                self.peek().unwrap_or_else(|| Arc::new(Advisory::fallback(now)))
            }
        }
    }
}
