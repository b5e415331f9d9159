//! Periodically stops following files that haven't changed in a long time.

use std::time::{Duration, SystemTime};

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::follower::join_all;
use crate::options::MIN_INTERVAL;
use crate::policy::age;
use crate::pool::FollowerPool;

pub(crate) struct Sweeper {
    pool: FollowerPool,
    max_age: Duration,
    interval: Duration,
    shutdown: CancellationToken,
}

impl Sweeper {
    pub(crate) fn new(
        pool: FollowerPool,
        max_age: Duration,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Sweeper {
            pool,
            max_age,
            // `interval_at` panics on a zero period.
            interval: interval.max(MIN_INTERVAL),
            shutdown,
        }
    }

    /// Sweeps every `interval` until the trail shuts down. The first sweep
    /// happens one interval after start.
    pub(crate) async fn run(self) {
        debug!(max_age = ?self.max_age, interval = ?self.interval, "staleness sweeper started");

        let mut ticks = time::interval_at(Instant::now() + self.interval, self.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticks.tick() => {
                    self.sweep().await;
                }
            }
        }

        debug!("staleness sweeper stopped");
    }

    /// Stops following every file last modified at least `max_age` ago, and
    /// returns how many were dropped. Files that can't be stat'ed are kept.
    pub(crate) async fn sweep(&self) -> usize {
        let now = SystemTime::now();
        let mut stale = Vec::new();

        for (path, id) in self.pool.snapshot() {
            if self.shutdown.is_cancelled() {
                break;
            }

            let modified = match tokio::fs::metadata(&path).await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to stat followed file");
                    continue;
                }
            };

            if age(modified, now) < self.max_age {
                trace!(path = %path.display(), "still fresh");
                continue;
            }

            // The path may have been removed or re-followed since the snapshot.
            if let Some(follower) = self.pool.evict(&path, id) {
                debug!(
                    path = %path.display(),
                    followed_for = ?age(follower.created_at(), now),
                    "unfollowing stale file"
                );
                stale.push(follower);
            }
        }

        let count = stale.len();
        join_all(stale).await;
        count
    }
}
