//! Everything related to discovering files and watching a directory tree for
//! creations, deletions, renames and writes.

use std::fmt::{self, Debug, Formatter};
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use notify::event::{EventKind, ModifyKind, RenameMode};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// The kind of change a [`FileEvent`] reports.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Op {
    Create,
    Remove,
    Rename,
    Write,
    Other,
}

/// A change observed for a single path inside a watched directory.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub op: Op,
}

impl FileEvent {
    pub fn new(path: impl Into<PathBuf>, op: Op) -> Self {
        FileEvent {
            path: path.into(),
            op,
        }
    }
}

/// Source of the files a [`Trail`](crate::Trail) follows.
///
/// A watcher first lists what already exists (`walk`), then reports changes
/// through the channel handed to `watch` until `end` is called.
pub trait Watcher: Send + 'static {
    /// Lists every file currently present under the watched location.
    fn walk(&mut self) -> io::Result<Vec<PathBuf>>;

    /// Starts delivering events to `events`.
    fn watch(&mut self, events: mpsc::UnboundedSender<FileEvent>);

    /// Stops delivering events and releases any resources held.
    fn end(&mut self);
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{} is not a directory", .0.display())]
    NotADirectory(PathBuf),
    #[error("failed to resolve {}: {source}", path.display())]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to watch {}: {source}", path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

enum Backend {
    Native(notify::RecommendedWatcher),
    Poll(notify::PollWatcher),
}

/// Where translated events go. Creations and removals seen before `watch`
/// are held so that files created while the initial listing runs are not
/// missed; only the latest of them is kept per path.
enum Sink {
    Buffering(Vec<FileEvent>),
    Forwarding(mpsc::UnboundedSender<FileEvent>),
    Closed,
}

impl Sink {
    fn push(&mut self, event: FileEvent) {
        match self {
            Sink::Buffering(pending) => {
                // Writes only matter to followers, and none exist yet.
                if !matches!(event.op, Op::Create | Op::Remove) {
                    return;
                }
                pending.retain(|held| held.path != event.path);
                pending.push(event);
            }
            Sink::Forwarding(tx) => {
                // The receiver only disappears once the trail has stopped, at
                // which point events are meaningless anyway.
                let _ = tx.send(event);
            }
            Sink::Closed => {}
        }
    }
}

/// Recursively watches a directory using [`notify`].
///
/// The notify watch is registered on construction, so anything happening
/// between `new` and [`Watcher::watch`] is buffered rather than lost.
pub struct DirectoryWatcher {
    root: PathBuf,
    backend: Option<Backend>,
    sink: Arc<Mutex<Sink>>,
}

impl Debug for DirectoryWatcher {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        let backend = match self.backend {
            Some(Backend::Native(_)) => "native",
            Some(Backend::Poll(_)) => "poll",
            None => "ended",
        };
        f.debug_struct("DirectoryWatcher")
            .field("root", &self.root)
            .field("backend", &backend)
            .finish()
    }
}

impl DirectoryWatcher {
    /// Watches `dir` with the platform's native notification mechanism.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let root = absolutify_dir(dir.into())?;
        let sink = Arc::new(Mutex::new(Sink::Buffering(Vec::new())));

        let mut inner = notify::recommended_watcher(forward_to(sink.clone())).map_err(|source| {
            Error::Watch {
                path: root.clone(),
                source,
            }
        })?;
        notify::Watcher::watch(&mut inner, &root, notify::RecursiveMode::Recursive).map_err(
            |source| Error::Watch {
                path: root.clone(),
                source,
            },
        )?;

        Ok(DirectoryWatcher {
            root,
            backend: Some(Backend::Native(inner)),
            sink,
        })
    }

    /// Watches `dir` by rescanning it every `interval`, for filesystems that
    /// don't deliver change notifications (network mounts and the like).
    pub fn polling(dir: impl Into<PathBuf>, interval: Duration) -> Result<Self, Error> {
        let root = absolutify_dir(dir.into())?;
        let sink = Arc::new(Mutex::new(Sink::Buffering(Vec::new())));

        let config = notify::Config::default().with_poll_interval(interval);
        let mut inner = notify::PollWatcher::new(forward_to(sink.clone()), config).map_err(
            |source| Error::Watch {
                path: root.clone(),
                source,
            },
        )?;
        notify::Watcher::watch(&mut inner, &root, notify::RecursiveMode::Recursive).map_err(
            |source| Error::Watch {
                path: root.clone(),
                source,
            },
        )?;

        Ok(DirectoryWatcher {
            root,
            backend: Some(Backend::Poll(inner)),
            sink,
        })
    }

    /// Returns the canonicalized directory being watched. Paths reported by
    /// `walk` and by events are rooted here.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Watcher for DirectoryWatcher {
    fn walk(&mut self) -> io::Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        for entry in walkdir::WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                // Failing to read the root itself means there is nothing to follow.
                Err(e) if e.depth() == 0 => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };

            if entry.file_type().is_file() {
                files.push(entry.into_path());
            }
        }

        debug!(root = %self.root.display(), count = files.len(), "walked directory");
        Ok(files)
    }

    fn watch(&mut self, events: mpsc::UnboundedSender<FileEvent>) {
        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);

        if matches!(*sink, Sink::Closed) {
            return;
        }

        if let Sink::Buffering(pending) = mem::replace(&mut *sink, Sink::Closed) {
            for event in pending {
                let _ = events.send(event);
            }
        }
        *sink = Sink::Forwarding(events);
    }

    fn end(&mut self) {
        // Dropping the notify watcher removes its watches and joins its thread.
        self.backend = None;
        *self.sink.lock().unwrap_or_else(PoisonError::into_inner) = Sink::Closed;
        debug!(root = %self.root.display(), "watcher ended");
    }
}

fn forward_to(
    sink: Arc<Mutex<Sink>>,
) -> impl FnMut(Result<notify::Event, notify::Error>) + Send + 'static {
    move |res| match res {
        Ok(event) => {
            let mut sink = sink.lock().unwrap_or_else(PoisonError::into_inner);
            for file_event in file_events(event) {
                sink.push(file_event);
            }
        }
        Err(e) => error!(error = %e, "watch error"),
    }
}

fn op_for(kind: &EventKind) -> Op {
    match kind {
        EventKind::Create(_) => Op::Create,
        // A file moved into the tree looks like a creation to us.
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Op::Create,
        EventKind::Modify(ModifyKind::Name(_)) => Op::Rename,
        EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Metadata(_)) => Op::Write,
        EventKind::Remove(_) => Op::Remove,
        _ => Op::Other,
    }
}

/// Splits a notify event into one [`FileEvent`] per affected path.
pub(crate) fn file_events(event: notify::Event) -> impl Iterator<Item = FileEvent> {
    let op = op_for(&event.kind);
    event
        .paths
        .into_iter()
        .map(move |path| FileEvent { path, op })
}

fn absolutify_dir(path: PathBuf) -> Result<PathBuf, Error> {
    let dir = path
        .canonicalize()
        .map_err(|source| Error::Resolve { path, source })?;

    if !dir.is_dir() {
        return Err(Error::NotADirectory(dir));
    }

    Ok(dir)
}
