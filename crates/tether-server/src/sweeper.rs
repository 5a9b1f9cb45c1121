//! Periodic eviction of expired groups.

use crate::metrics;
use std::sync::Arc;
use std::time::Duration;
use tether_core::{unix_millis, Relay};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Spawn the sweeper task.
///
/// The first sweep runs one `interval` after start.
pub fn spawn(relay: Arc<Relay>, interval: Duration, max_age: Duration) -> JoinHandle<()> {
    info!(
        interval_secs = interval.as_secs(),
        max_age_secs = max_age.as_secs(),
        "Starting group sweeper"
    );

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            ticker.tick().await;
            sweep_once(&relay, max_age);
        }
    })
}

/// Run one sweep and return the number of groups evicted.
pub fn sweep_once(relay: &Relay, max_age: Duration) -> usize {
    let evicted = relay.sweep(unix_millis(), max_age);
    let stats = relay.registry().stats();

    if evicted.is_empty() {
        debug!(groups = stats.group_count, "Sweep found nothing to evict");
    } else {
        info!(
            evicted = evicted.len(),
            remaining = stats.group_count,
            "Evicted expired groups"
        );
        metrics::record_groups_evicted(evicted.len());
    }
    metrics::set_active_groups(stats.group_count);

    evicted.len()
}
