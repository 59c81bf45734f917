//! Rate limiting for outbound provider calls

use governor::{DefaultDirectRateLimiter, Quota};
use std::collections::HashMap;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::warn;

/// Independent budgets for the upstreams with hard rate ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimiterId {
    /// Enhanced transaction detail API
    DetailLookup,
    /// Solana JSON-RPC
    Rpc,
    /// Jupiter quote, swap and price APIs
    Aggregator,
}

/// Token-bucket dispatcher. Callers over budget wait; they never fail.
#[derive(Clone)]
pub struct RateLimitedDispatcher {
    limiters: HashMap<LimiterId, Arc<DefaultDirectRateLimiter>>,
}

impl RateLimitedDispatcher {
    pub fn new(detail_per_sec: u32, rpc_per_sec: u32, aggregator_per_sec: u32) -> Self {
        let mut dispatcher = Self {
            limiters: HashMap::new(),
        };
        dispatcher.configure(LimiterId::DetailLookup, detail_per_sec);
        dispatcher.configure(LimiterId::Rpc, rpc_per_sec);
        dispatcher.configure(LimiterId::Aggregator, aggregator_per_sec);
        dispatcher
    }

    /// Dispatcher with no budgets, every acquire resolves immediately
    pub fn unlimited() -> Self {
        Self {
            limiters: HashMap::new(),
        }
    }

    pub fn configure(&mut self, id: LimiterId, per_second: u32) {
        match NonZeroU32::try_from(per_second) {
            Ok(rate) => {
                let limiter = Arc::new(DefaultDirectRateLimiter::direct(Quota::per_second(rate)));
                self.limiters.insert(id, limiter);
            }
            Err(_) => {
                warn!("Invalid rate limit for {:?}: {} (leaving unlimited)", id, per_second);
                self.limiters.remove(&id);
            }
        }
    }

    /// Waits until a slot in `id`'s budget is available
    pub async fn acquire(&self, id: LimiterId) {
        if let Some(limiter) = self.limiters.get(&id) {
            limiter.until_ready().await;
        }
    }

    /// Acquires a slot, then runs the call
    pub async fn dispatch<F, Fut, T>(&self, id: LimiterId, call: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire(id).await;
        call().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_excess_callers_wait() {
        let dispatcher = RateLimitedDispatcher::new(2, 10, 2);
        let start = Instant::now();
        for _ in 0..3 {
            dispatcher.acquire(LimiterId::DetailLookup).await;
        }
        // Burst of 2, the third slot refills after ~500ms
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_limiters_are_independent() {
        let dispatcher = RateLimitedDispatcher::new(1, 10, 1);
        dispatcher.acquire(LimiterId::DetailLookup).await;

        let blocked = timeout(Duration::from_millis(100), dispatcher.acquire(LimiterId::DetailLookup)).await;
        assert!(blocked.is_err());
        let rpc = timeout(Duration::from_millis(100), dispatcher.acquire(LimiterId::Rpc)).await;
        assert!(rpc.is_ok());
        let aggregator = timeout(Duration::from_millis(100), dispatcher.acquire(LimiterId::Aggregator)).await;
        assert!(aggregator.is_ok());
    }

    #[tokio::test]
    async fn test_dispatch_returns_call_output() {
        let dispatcher = RateLimitedDispatcher::unlimited();
        let value = dispatcher.dispatch(LimiterId::Rpc, || async { 42 }).await;
        assert_eq!(value, 42);
    }
}
