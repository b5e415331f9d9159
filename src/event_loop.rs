//! Turns filesystem events into changes to the set of followed files.

use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::events::{FileEvent, Op, Watcher};
use crate::follower::{join_all, FollowContext};
use crate::policy::PolicyFilter;
use crate::reader::TailMode;

pub(crate) struct EventLoop<W> {
    watcher: W,
    events: mpsc::UnboundedReceiver<FileEvent>,
    policy: PolicyFilter,
    ctx: FollowContext,
}

impl<W: Watcher> EventLoop<W> {
    pub(crate) fn new(
        watcher: W,
        events: mpsc::UnboundedReceiver<FileEvent>,
        policy: PolicyFilter,
        ctx: FollowContext,
    ) -> Self {
        EventLoop {
            watcher,
            events,
            policy,
            ctx,
        }
    }

    /// Runs until the trail shuts down, then ends the watcher and stops every
    /// follower. Once this returns the pool is closed for good.
    pub(crate) async fn run(mut self) {
        let shutdown = self.ctx.shutdown.clone();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => {
                        warn!("watcher stopped sending events");
                        shutdown.cancelled().await;
                        break;
                    }
                },
            }
        }

        self.watcher.end();

        let followers = self.ctx.pool.close();
        info!(count = followers.len(), "stopping followers");
        join_all(followers).await;
    }

    async fn handle(&mut self, event: FileEvent) {
        let FileEvent { path, op } = event;

        match op {
            Op::Create => {
                debug!(path = %path.display(), "created");
                // Recreated under a followed path: its follower reopens it.
                if self.ctx.pool.wake(&path) {
                    return;
                }
                if self.policy.should_ignore(&path) {
                    trace!(path = %path.display(), "ignoring");
                    return;
                }
                self.ctx.follow(path, TailMode::New).await;
            }
            Op::Remove => {
                debug!(path = %path.display(), "removed");
                if let Some(follower) = self.ctx.pool.remove(&path) {
                    follower.join().await;
                    debug!(path = %path.display(), "unfollowed");
                }
            }
            Op::Rename => {
                debug!(path = %path.display(), "renamed");
                // Both ends of a rename are reported; either may be followed.
                self.ctx.pool.wake(&path);
            }
            Op::Write => {
                trace!(path = %path.display(), "written");
                self.ctx.pool.wake(&path);
            }
            Op::Other => trace!(path = %path.display(), "other event"),
        }
    }
}
