#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use logtrail::{FileEvent, Line, Op, TrailOptions, Watcher};
use tokio::sync::mpsc;
use tokio::time;

pub const TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
struct FeedState {
    sender: Option<mpsc::UnboundedSender<FileEvent>>,
    fail_walk: bool,
    ended: bool,
}

/// Test side of a [`FeedWatcher`]: injects events by hand.
#[derive(Clone, Debug, Default)]
pub struct Feed {
    state: Arc<Mutex<FeedState>>,
}

impl Feed {
    pub fn send(&self, path: impl Into<PathBuf>, op: Op) {
        let state = self.state.lock().unwrap();
        let sender = state.sender.as_ref().expect("watcher is not watching");
        sender.send(FileEvent::new(path, op)).unwrap();
    }

    pub fn fail_walk(&self, fail: bool) {
        self.state.lock().unwrap().fail_walk = fail;
    }

    pub fn is_ended(&self) -> bool {
        self.state.lock().unwrap().ended
    }
}

/// Lists a directory for real, but only reports the events fed to it.
#[derive(Debug)]
pub struct FeedWatcher {
    dir: PathBuf,
    feed: Feed,
}

impl FeedWatcher {
    pub fn new(dir: &Path) -> (Self, Feed) {
        let feed = Feed::default();
        let watcher = FeedWatcher {
            dir: dir.to_path_buf(),
            feed: feed.clone(),
        };
        (watcher, feed)
    }
}

impl Watcher for FeedWatcher {
    fn walk(&mut self) -> io::Result<Vec<PathBuf>> {
        if self.feed.state.lock().unwrap().fail_walk {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "walk refused"));
        }

        let mut files = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
        Ok(files)
    }

    fn watch(&mut self, events: mpsc::UnboundedSender<FileEvent>) {
        self.feed.state.lock().unwrap().sender = Some(events);
    }

    fn end(&mut self) {
        let mut state = self.feed.state.lock().unwrap();
        state.sender = None;
        state.ended = true;
    }
}

/// Options for tests: tails poll quickly instead of waiting on notify.
pub fn options() -> TrailOptions {
    TrailOptions::new()
        .poll_changes(true)
        .poll_interval(Duration::from_millis(10))
}

/// A handler forwarding every line into a channel.
pub fn collector() -> (
    impl Fn(Line) -> Result<(), mpsc::error::SendError<Line>> + Send + Sync + 'static,
    mpsc::UnboundedReceiver<Line>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |line: Line| tx.send(line), rx)
}

pub async fn recv(rx: &mut mpsc::UnboundedReceiver<Line>) -> Line {
    time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for a line")
        .expect("line channel closed")
}

/// Asserts that no line shows up for a little while.
pub async fn assert_quiet(rx: &mut mpsc::UnboundedReceiver<Line>) {
    if let Ok(Some(line)) = time::timeout(Duration::from_millis(150), rx.recv()).await {
        panic!("unexpected line {:?}", line);
    }
}

pub async fn eventually(mut check: impl FnMut() -> bool) {
    time::timeout(TIMEOUT, async {
        while !check() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not met in time");
}

pub fn append(path: &Path, data: &str) {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(data.as_bytes()).unwrap();
    file.sync_all().unwrap();
}
