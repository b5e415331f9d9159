//! The trail: following every file a [`Watcher`] knows about.

use std::fmt;
use std::io;
use std::mem;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, Instrument};

use crate::event_loop::EventLoop;
use crate::events::Watcher;
use crate::follower::{join_all, FollowContext};
use crate::line::{BoxError, Line, SharedHandler};
use crate::policy::PolicyFilter;
use crate::pool::FollowerPool;
use crate::reader::TailMode;
use crate::sweeper::Sweeper;
use crate::TrailOptions;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to list files to follow: {0}")]
    Walk(#[source] io::Error),
    #[error("trail is already being followed")]
    AlreadyFollowing,
    #[error("trail has ended")]
    Ended,
}

enum State<W> {
    Idle(W),
    Following {
        event_loop: JoinHandle<()>,
        sweeper: Option<JoinHandle<()>>,
    },
    Ended,
}

/// A log trail that can be followed for new lines.
///
/// Following a trail tails every file its [`Watcher`] lists, then keeps the
/// set of followed files in step with the watcher's events: created files
/// are followed from their first line, removed files are dropped, and files
/// that stop changing for too long are dropped by a periodic sweep.
///
/// Failures never retry: a file that can't be opened is skipped, a file that
/// can't be read ends its follower, and a handler error is logged and the
/// next line delivered regardless.
///
/// A trail is followed at most once and ended at most once. Dropping it
/// signals every task it started to stop.
pub struct Trail<W> {
    options: TrailOptions,
    shutdown: CancellationToken,
    pool: FollowerPool,
    state: Mutex<State<W>>,
}

impl<W> fmt::Debug for Trail<W> {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Trail")
            .field("options", &self.options)
            .field("followed", &self.pool.len())
            .field("ended", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl<W: Watcher> Trail<W> {
    /// Creates a trail over `watcher` with [`TrailOptions::default`].
    pub fn new(watcher: W) -> Self {
        Self::with_options(watcher, TrailOptions::default())
    }

    /// Creates a trail over `watcher`. Nothing happens until
    /// [`follow`](Self::follow) is called.
    pub fn with_options(watcher: W, options: TrailOptions) -> Self {
        Trail {
            options,
            shutdown: CancellationToken::new(),
            pool: FollowerPool::default(),
            state: Mutex::new(State::Idle(watcher)),
        }
    }

    /// Returns the options this trail was built with.
    pub fn options(&self) -> &TrailOptions {
        &self.options
    }

    /// Starts following the trail, handing every line to `handler`.
    ///
    /// Files already present are read from their end, so only lines appended
    /// from now on are seen. Returns once everything is running; fails only
    /// when the watcher can't list the existing files, in which case nothing
    /// is followed and the trail may be followed again later.
    ///
    /// `handler` is called from the follower's task, once per line, in file
    /// order. It should not block for long.
    ///
    /// Dropping the returned future before it completes stops whatever it
    /// already started and leaves the trail idle, as if never followed.
    pub async fn follow<F, E>(&self, handler: F) -> Result<(), Error>
    where
        F: Fn(Line) -> Result<(), E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        let span = self.options.span.clone();
        let mut state = self.state.lock().await;

        // The watcher stays in place until nothing is awaited anymore, so a
        // `follow` cancelled halfway leaves the trail idle.
        let watcher = match &mut *state {
            State::Idle(watcher) => watcher,
            State::Following { .. } => return Err(Error::AlreadyFollowing),
            State::Ended => return Err(Error::Ended),
        };

        let files = span
            .in_scope(|| {
                info!("following trail");
                watcher.walk()
            })
            .map_err(|e| {
                error!(parent: &span, error = %e, "failed to list files");
                Error::Walk(e)
            })?;

        let handler: SharedHandler = Arc::new(move |line: Line| -> Result<(), BoxError> {
            handler(line).map_err(Into::into)
        });
        let ctx = FollowContext {
            handler,
            pool: self.pool.clone(),
            shutdown: self.shutdown.clone(),
            poll_interval: self.options.tail_poll_interval(),
            span: span.clone(),
        };
        let policy = PolicyFilter::from(&self.options);

        let mut abandoned = Abandoned(Some(&self.pool));
        async {
            for path in files {
                if policy.should_ignore(&path) {
                    trace!(path = %path.display(), "ignoring");
                    continue;
                }
                ctx.follow(path, TailMode::Existing).await;
            }
            info!(count = self.pool.len(), "following existing files");
        }
        .instrument(span.clone())
        .await;
        abandoned.0 = None;

        let (tx, rx) = mpsc::unbounded_channel();
        watcher.watch(tx);

        if let State::Idle(watcher) = mem::replace(&mut *state, State::Ended) {
            let event_loop = tokio::spawn(
                EventLoop::new(watcher, rx, policy, ctx)
                    .run()
                    .instrument(span.clone()),
            );

            let sweeper = self.options.unfollow_if_older_than.map(|max_age| {
                let sweeper = Sweeper::new(
                    self.pool.clone(),
                    max_age,
                    self.options.sweep_interval,
                    self.shutdown.child_token(),
                );
                tokio::spawn(sweeper.run().instrument(span.clone()))
            });

            *state = State::Following {
                event_loop,
                sweeper,
            };
        }
        Ok(())
    }

    /// Stops following the trail.
    ///
    /// Once this returns no follower of this trail is running, and the
    /// handler won't be called again. Calling it more than once is harmless.
    pub async fn end(&self) {
        let mut state = self.state.lock().await;

        match mem::replace(&mut *state, State::Ended) {
            State::Idle(mut watcher) => {
                self.shutdown.cancel();
                watcher.end();
                join_all(self.pool.close()).await;
                info!(parent: &self.options.span, "trail ended before being followed");
            }
            State::Following {
                event_loop,
                sweeper,
            } => {
                info!(parent: &self.options.span, "stopping trail");
                self.shutdown.cancel();

                if let Some(sweeper) = sweeper {
                    if let Err(e) = sweeper.await {
                        error!(parent: &self.options.span, error = %e, "staleness sweeper failed");
                    }
                }
                if let Err(e) = event_loop.await {
                    error!(parent: &self.options.span, error = %e, "event loop failed");
                }

                // Normally already done by the event loop; repeated in case it
                // never got there.
                join_all(self.pool.close()).await;
                info!(parent: &self.options.span, "trail stopped");
            }
            State::Ended => debug!(parent: &self.options.span, "trail already ended"),
        }
    }

    /// Returns the paths currently followed, sorted.
    pub fn followed(&self) -> Vec<PathBuf> {
        self.pool.paths()
    }

    /// Returns `true` once [`end`](Self::end) has been called or the trail
    /// is being dropped.
    pub fn is_ended(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Stops the followers started by a `follow` that was dropped before it
/// finished, so none of them keeps calling that call's handler.
struct Abandoned<'a>(Option<&'a FollowerPool>);

impl Drop for Abandoned<'_> {
    fn drop(&mut self) {
        if let Some(pool) = self.0 {
            let stopped = pool.clear();
            debug!(count = stopped.len(), "follow cancelled, stopped its followers");
        }
    }
}

impl<W> Drop for Trail<W> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
