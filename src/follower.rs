//! A follower is the task reading one file and handing its lines on.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn, Instrument, Span};

use crate::line::{deliver, Line, SharedHandler};
use crate::pool::FollowerPool;
use crate::reader::{FileTail, TailMode};

/// How long stopping a follower may take before its task is aborted.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Identifies one follower among all those ever started, so that a late
/// decision about a path never removes a newer follower for the same path.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub(crate) struct FollowerId(u64);

impl FollowerId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);

        FollowerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// The file could not be opened for tailing; it is simply not followed.
#[derive(Debug, Error)]
#[error("failed to follow {}", path.display())]
pub struct SpawnError {
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Everything a follower needs besides its file.
#[derive(Clone)]
pub(crate) struct FollowContext {
    pub(crate) handler: SharedHandler,
    pub(crate) pool: FollowerPool,
    pub(crate) shutdown: CancellationToken,
    pub(crate) poll_interval: Option<Duration>,
    pub(crate) span: Span,
}

impl FollowContext {
    /// Starts following `path` unless it is already followed.
    ///
    /// Returns `true` if a new follower was added to the pool.
    pub(crate) async fn follow(&self, path: PathBuf, mode: TailMode) -> bool {
        if self.pool.contains(&path) {
            debug!(path = %path.display(), "already following");
            return false;
        }

        let tail = match FileTail::open(&path, mode, self.poll_interval).await {
            Ok(tail) => tail,
            // Directories show up in recursive create events too.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {
                debug!(path = %path.display(), "not a regular file, skipping");
                return false;
            }
            Err(source) => {
                let e = SpawnError { path, source };
                error!(error = %e, cause = %e.source, "not following file");
                return false;
            }
        };

        // The task starts while the pool is locked, so it can't try to remove
        // itself before it has been inserted.
        let inserted = self
            .pool
            .insert_with(path.clone(), || Follower::start(tail, self));

        if inserted {
            debug!(path = %path.display(), ?mode, "following file");
        }
        inserted
    }
}

/// Handle to a running follower task. At most one exists per path in the
/// pool.
pub(crate) struct Follower {
    path: PathBuf,
    id: FollowerId,
    created_at: SystemTime,
    /// Set for tails that wait on filesystem events instead of polling.
    changed: Option<Arc<Notify>>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl fmt::Debug for Follower {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("Follower")
            .field("path", &self.path)
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .field("stopped", &self.cancel.is_cancelled())
            .finish()
    }
}

impl Follower {
    fn start(tail: FileTail, ctx: &FollowContext) -> Self {
        let path = tail.path().to_path_buf();
        let id = FollowerId::next();
        let cancel = ctx.shutdown.child_token();
        let changed = tail.change_signal();

        let task = tokio::spawn(
            run(tail, id, cancel.clone(), ctx.clone()).instrument(ctx.span.clone()),
        );

        Follower {
            path,
            id,
            created_at: SystemTime::now(),
            changed,
            cancel,
            task,
        }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn id(&self) -> FollowerId {
        self.id
    }

    pub(crate) fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Tells the task its file may have changed. Polling followers ignore
    /// this.
    pub(crate) fn wake(&self) {
        if let Some(changed) = &self.changed {
            changed.notify_one();
        }
    }

    /// Tells the task to stop. No line is delivered once this returns and
    /// the task has observed it; [`join`](Self::join) waits for that.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stops the task and waits for it to finish.
    pub(crate) async fn join(self) {
        self.stop();

        let Follower { path, mut task, .. } = self;
        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!(path = %path.display(), "follower panicked"),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(path = %path.display(), "follower did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

/// Stops and waits for every follower in `followers`.
pub(crate) async fn join_all(followers: Vec<Follower>) {
    futures_util::future::join_all(followers.into_iter().map(Follower::join)).await;
}

async fn run(mut tail: FileTail, id: FollowerId, cancel: CancellationToken, ctx: FollowContext) {
    let path = tail.path().to_path_buf();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(path = %path.display(), "follower stopped");
                return;
            }
            next = tail.next_line() => next,
        };

        match next {
            Some(Ok(text)) => deliver(&ctx.handler, Line::new(path.clone(), text)),
            Some(Err(e)) => {
                error!(path = %path.display(), error = %e, "failed to read file");
                deliver(&ctx.handler, Line::failed(path.clone(), e));
                break;
            }
            None => break,
        }
    }

    if ctx.pool.forget(&path, id) {
        debug!(path = %path.display(), "follower finished, no longer following");
    }
}

#[cfg(test)]
impl Follower {
    /// A follower whose task does nothing but wait to be stopped.
    pub(crate) fn idle(path: impl Into<PathBuf>) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        Follower {
            path: path.into(),
            id: FollowerId::next(),
            created_at: SystemTime::now(),
            changed: None,
            cancel,
            task: tokio::spawn(async move { token.cancelled().await }),
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::line::BoxError;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn context(pool: FollowerPool) -> (FollowContext, mpsc::UnboundedReceiver<Line>) {
        context_with(pool, Some(Duration::from_millis(10)))
    }

    fn context_with(
        pool: FollowerPool,
        poll_interval: Option<Duration>,
    ) -> (FollowContext, mpsc::UnboundedReceiver<Line>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = FollowContext {
            handler: Arc::new(move |line: Line| -> Result<(), BoxError> {
                tx.send(line).map_err(Into::into)
            }),
            pool,
            shutdown: CancellationToken::new(),
            poll_interval,
            span: Span::none(),
        };
        (ctx, rx)
    }

    fn append(path: &Path, data: &str) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        file.write_all(data.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_follow_delivers_lines_in_order() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("a.log");
        append(&path, "one\ntwo\n");

        let pool = FollowerPool::default();
        let (ctx, mut rx) = context(pool.clone());

        assert!(ctx.follow(path.clone(), TailMode::New).await);
        assert!(!ctx.follow(path.clone(), TailMode::New).await);
        assert_eq!(pool.len(), 1);

        for expected in ["one", "two"] {
            let line = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
            assert_eq!(line.source(), path);
            assert_eq!(line.line(), expected);
        }

        pool.remove(&path).unwrap().join().await;
    }

    #[tokio::test]
    async fn test_follow_missing_file_is_skipped() {
        let tmp_dir = tempdir().unwrap();
        let pool = FollowerPool::default();
        let (ctx, _rx) = context(pool.clone());

        assert!(!ctx.follow(tmp_dir.path().join("nope.log"), TailMode::New).await);
        assert_eq!(pool.len(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_directory_is_skipped() {
        let tmp_dir = tempdir().unwrap();
        let nested = tmp_dir.path().join("nested");
        std::fs::create_dir(&nested).unwrap();

        let pool = FollowerPool::default();
        let (ctx, _rx) = context(pool.clone());

        assert!(!ctx.follow(nested, TailMode::New).await);
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_wake_delivers_without_polling() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("woken.log");
        append(&path, "");

        let pool = FollowerPool::default();
        let (ctx, mut rx) = context_with(pool.clone(), None);
        assert!(ctx.follow(path.clone(), TailMode::Existing).await);

        // Give the follower time to reach its wait.
        tokio::time::sleep(Duration::from_millis(50)).await;
        append(&path, "hello\n");
        assert!(pool.wake(&path));

        // The unsignalled re-check would take a full second.
        let line = timeout(Duration::from_millis(500), rx.recv()).await.unwrap().unwrap();
        assert_eq!(line.line(), "hello");

        pool.remove(&path).unwrap().join().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_read_error_ends_follower() {
        let tmp_dir = tempdir().unwrap();
        let dir = tmp_dir.path().join("logs");
        std::fs::create_dir(&dir).unwrap();
        let path = dir.join("a.log");
        append(&path, "");

        let pool = FollowerPool::default();
        let (ctx, mut rx) = context(pool.clone());
        assert!(ctx.follow(path.clone(), TailMode::Existing).await);

        // Replace the parent directory with a plain file: looking the path up
        // now fails with something other than "not found".
        std::fs::remove_file(&path).unwrap();
        std::fs::remove_dir(&dir).unwrap();
        std::fs::File::create(&dir).unwrap();

        let line = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert!(line.is_error());
        assert_eq!(line.source(), path);
        assert_ne!(line.error().unwrap().kind(), io::ErrorKind::NotFound);

        timeout(Duration::from_secs(2), async {
            while pool.contains(&path) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_finished_follower_leaves_pool() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("short-lived.log");
        append(&path, "");

        let pool = FollowerPool::default();
        let (ctx, _rx) = context(pool.clone());
        assert!(ctx.follow(path.clone(), TailMode::Existing).await);

        std::fs::remove_file(&path).unwrap();

        timeout(Duration::from_secs(2), async {
            while pool.contains(&path) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_follower_delivers_nothing() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("quiet.log");
        append(&path, "");

        let pool = FollowerPool::default();
        let (ctx, mut rx) = context(pool.clone());
        assert!(ctx.follow(path.clone(), TailMode::Existing).await);

        let follower = pool.remove(&path).unwrap();
        follower.join().await;

        append(&path, "too late\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }
}
