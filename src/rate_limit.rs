//! Client-side sliding-window rate limiting.
//!
//! Admitted queries are remembered as epoch-millisecond timestamps.  A timestamp
//! counts against the quota while it is strictly younger than the window; one that
//! is exactly a window old is pruned.  The window is persisted under
//! [`RATE_LIMIT_KEY`](crate::storage::RATE_LIMIT_KEY) so restarting the client does
//! not reset the quota.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Error;
use crate::storage::{KeyValueStore, RATE_LIMIT_KEY};
use crate::utils::Clock;

/// Queries admitted per window.
pub const MAX_QUERIES: usize = 10;

/// Length of the sliding window in seconds.
pub const WINDOW_SECONDS: u64 = 60;

/// How often the background sweep re-prunes the window, in seconds.
pub const SWEEP_INTERVAL_SECONDS: u64 = 5;

/// Tunables for a [`RateLimiter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Queries admitted per window.
    pub max_queries: usize,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Background sweep period in seconds.
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_queries: MAX_QUERIES,
            window_secs: WINDOW_SECONDS,
            sweep_interval_secs: SWEEP_INTERVAL_SECONDS,
        }
    }
}

impl RateLimitConfig {
    /// Returns the window length.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Returns the sweep period.  Never zero.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    fn window_millis(&self) -> u64 {
        self.window_secs.saturating_mul(1000)
    }
}

/// A snapshot of the limiter, as published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RateLimitStatus {
    /// True if the next query would be refused.
    pub limited: bool,
    /// Seconds until a slot frees up; zero when not limited.
    pub wait_seconds: u64,
    /// Queries still available in the current window.
    pub remaining: usize,
}

/// Sliding-window admission control for queries.
pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
    timestamps: Mutex<Vec<u64>>,
    status: watch::Sender<RateLimitStatus>,
}

impl RateLimiter {
    /// Creates a limiter, restoring and pruning any persisted window.
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        config: RateLimitConfig,
    ) -> Self {
        let timestamps = load_timestamps(store.as_ref());
        let (status, _) = watch::channel(RateLimitStatus::default());
        let limiter = Self {
            store,
            clock,
            config,
            timestamps: Mutex::new(timestamps),
            status,
        };
        limiter.sweep();
        limiter
    }

    /// Returns the limiter's configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Records an admitted query at the current time.
    pub fn record_query(&self) {
        let now = self.clock.now_millis();
        let snapshot = {
            let mut timestamps = self.timestamps();
            timestamps.push(now);
            self.prune(&mut timestamps, now);
            timestamps.clone()
        };
        self.persist(&snapshot);
        self.publish();
    }

    /// Returns whether the quota is exhausted and, if so, how many seconds to wait.
    ///
    /// The wait is never less than one second while limited.
    pub fn is_limited(&self) -> (bool, u64) {
        let status = self.status();
        (status.limited, status.wait_seconds)
    }

    /// Prunes the window and returns the resulting status.
    pub fn status(&self) -> RateLimitStatus {
        let now = self.clock.now_millis();
        let mut timestamps = self.timestamps();
        self.prune(&mut timestamps, now);
        self.compute(&timestamps, now)
    }

    /// Returns how many more queries the current window admits.
    pub fn remaining_queries(&self) -> usize {
        self.status().remaining
    }

    /// Returns how many queries count against the current window.
    pub fn queries_in_window(&self) -> usize {
        let now = self.clock.now_millis();
        let mut timestamps = self.timestamps();
        self.prune(&mut timestamps, now);
        timestamps.len()
    }

    /// Forgets every recorded query.
    pub fn reset(&self) {
        self.timestamps().clear();
        self.persist(&[]);
        self.publish();
    }

    /// Re-prunes the window, persists it if anything aged out, and publishes the
    /// resulting status.
    pub fn sweep(&self) -> RateLimitStatus {
        let now = self.clock.now_millis();
        let pruned = {
            let mut timestamps = self.timestamps();
            let before = timestamps.len();
            self.prune(&mut timestamps, now);
            (timestamps.len() != before).then(|| timestamps.clone())
        };
        if let Some(snapshot) = pruned {
            self.persist(&snapshot);
        }
        self.publish()
    }

    /// Subscribes to status changes.
    pub fn subscribe(&self) -> watch::Receiver<RateLimitStatus> {
        self.status.subscribe()
    }

    /// Starts a background task that keeps the published status current.
    ///
    /// The task wakes every sweep interval, or exactly when the oldest timestamp
    /// leaves the window if that comes sooner.  It stops when the returned handle is
    /// dropped or the limiter itself is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> SweepHandle {
        let limiter: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let delay = match limiter.upgrade() {
                    Some(limiter) => {
                        limiter.sweep();
                        limiter.next_wake()
                    }
                    None => break,
                };
                tokio::time::sleep(delay).await;
            }
        });
        SweepHandle { handle }
    }

    fn next_wake(&self) -> Duration {
        let sweep = self.config.sweep_interval();
        let now = self.clock.now_millis();
        let timestamps = self.timestamps();
        if timestamps.len() < self.config.max_queries {
            return sweep;
        }
        match timestamps.iter().min() {
            Some(oldest) => {
                let unblock = (oldest + self.config.window_millis()).saturating_sub(now);
                sweep.min(Duration::from_millis(unblock.max(1)))
            }
            None => sweep,
        }
    }

    fn timestamps(&self) -> MutexGuard<'_, Vec<u64>> {
        self.timestamps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn prune(&self, timestamps: &mut Vec<u64>, now: u64) {
        let window = self.config.window_millis();
        timestamps.retain(|ts| ts.saturating_add(window) > now);
    }

    fn compute(&self, timestamps: &[u64], now: u64) -> RateLimitStatus {
        let count = timestamps.len();
        let remaining = self.config.max_queries.saturating_sub(count);
        if count < self.config.max_queries {
            return RateLimitStatus {
                limited: false,
                wait_seconds: 0,
                remaining,
            };
        }
        let oldest = timestamps.iter().copied().min().unwrap_or(now);
        let wait_millis = (oldest + self.config.window_millis()).saturating_sub(now);
        RateLimitStatus {
            limited: true,
            wait_seconds: wait_millis.div_ceil(1000).max(1),
            remaining,
        }
    }

    fn publish(&self) -> RateLimitStatus {
        let status = self.status();
        self.status.send_if_modified(|current| {
            if *current == status {
                false
            } else {
                *current = status;
                true
            }
        });
        status
    }

    fn persist(&self, timestamps: &[u64]) {
        let result = serde_json::to_string(timestamps)
            .map_err(Error::from)
            .and_then(|json| self.store.set(RATE_LIMIT_KEY, &json));
        if let Err(err) = result {
            warn!(error = %err, "failed to persist rate-limit window");
        }
    }
}

/// Owns the background sweep task; aborts it on drop.
#[derive(Debug)]
pub struct SweepHandle {
    handle: JoinHandle<()>,
}

impl SweepHandle {
    /// Stops the sweep task.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

impl Drop for SweepHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn load_timestamps(store: &dyn KeyValueStore) -> Vec<u64> {
    let raw = match store.get(RATE_LIMIT_KEY) {
        Ok(Some(raw)) => raw,
        Ok(None) => return Vec::new(),
        Err(err) => {
            warn!(error = %err, "failed to read rate-limit window");
            return Vec::new();
        }
    };
    match serde_json::from_str::<Vec<u64>>(&raw) {
        Ok(timestamps) => timestamps,
        Err(err) => {
            debug!(error = %err, "discarding unreadable rate-limit window");
            Vec::new()
        }
    }
}
