//! Recurring sweep that evicts idle entries from a [`Registry`].

use crate::registry::Registry;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

/// Idle is implemented by registry values that track their own activity
pub trait Idle {
    /// idle_for returns how long the entry has been inactive as of `now`
    fn idle_for(&self, now: Instant) -> Duration;

    /// release frees whatever the entry holds once it has been evicted
    fn release(&self);
}

/// IdleEvictionScheduler owns the background sweep task. Dropping it
/// stops the sweep.
#[derive(Debug)]
pub struct IdleEvictionScheduler {
    handle: JoinHandle<()>,
}

impl IdleEvictionScheduler {
    /// spawn starts sweeping `registry` every `interval`, evicting entries
    /// idle for longer than `threshold`. Must be called inside a runtime.
    pub fn spawn<K, V>(registry: Arc<Registry<K, V>>, interval: Duration, threshold: Duration) -> Self
    where
        K: Eq + Hash + Clone + std::fmt::Debug + Send + Sync + 'static,
        V: Idle + Clone + Send + Sync + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                sweep(&registry, threshold);
            }
        });

        Self { handle }
    }
}

impl Drop for IdleEvictionScheduler {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// sweep evicts every entry idle for longer than `threshold` and returns
/// how many were evicted.
///
/// Candidates are picked from a snapshot, then each one is re-checked
/// against its current timestamp under the shard lock before removal, so
/// an entry refreshed mid-sweep is never evicted.
pub fn sweep<K, V>(registry: &Registry<K, V>, threshold: Duration) -> usize
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Idle + Clone,
{
    let now = Instant::now();
    let candidates: Vec<K> = registry
        .snapshot()
        .into_iter()
        .filter(|(_, value)| value.idle_for(now) > threshold)
        .map(|(key, _)| key)
        .collect();

    let mut evicted = 0;
    for key in candidates {
        if let Some(value) = registry.remove_if(&key, |value| value.idle_for(Instant::now()) > threshold) {
            value.release();
            evicted += 1;
            debug!("evicted idle entry {key:?}");
        }
    }

    evicted
}
