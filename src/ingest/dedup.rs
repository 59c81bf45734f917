/// Trailing-window duplicate suppression for notification signatures
///
/// Keys are remembered from first sight until the retention window elapses.
/// Membership is checked and recorded in one step under the shard lock, so
/// concurrent notification sources cannot both win the same key.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::debug;

pub struct Deduplicator {
    /// key -> first time it was seen
    seen: DashMap<String, Instant>,
    retention: Duration,
}

impl Deduplicator {
    pub fn new(retention: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            retention,
        }
    }

    /// Returns true the first time `key` is seen within the retention window
    pub fn should_process(&self, key: &str) -> bool {
        self.should_process_at(key, Instant::now())
    }

    fn should_process_at(&self, key: &str, now: Instant) -> bool {
        match self.seen.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if now.saturating_duration_since(*entry.get()) >= self.retention {
                    // Expired but not swept yet: a late redelivery counts as new
                    entry.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Drops every entry older than the retention window
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.seen.len();
        self.seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) < self.retention);
        before.saturating_sub(self.seen.len())
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Periodically evicts expired keys until shutdown
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.evict_expired();
                        if evicted > 0 {
                            debug!(evicted, live = self.len(), "Dedup window swept");
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
        })
    }
}
