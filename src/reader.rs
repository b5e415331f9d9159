//! Everything related to reading appended lines from a single file.

use std::fmt;
use std::fs::Metadata;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::fs::{metadata, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::Notify;
use tracing::debug;

use crate::options::MIN_INTERVAL;

/// How long a signal-driven tail sleeps before re-checking the file on its
/// own. Rotation by rename can happen without any event for the followed
/// path, so it has to be looked at periodically regardless.
const NOTIFY_FALLBACK: Duration = Duration::from_secs(1);

/// How long a path must stay missing before the file counts as removed.
/// Covers the gap between rename and re-create during rotation.
const REMOVAL_GRACE: Duration = Duration::from_millis(200);

/// Where a [`FileTail`] starts reading.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TailMode {
    /// The file existed before following began: start at end-of-file so that
    /// only appended content is seen.
    Existing,
    /// The file appeared while following: read it from the start.
    New,
}

async fn new_linereader(
    path: &Path,
    start: TailMode,
) -> io::Result<(BufReader<File>, u64, Option<FileId>)> {
    let mut file = File::open(path).await?;
    let meta = file.metadata().await?;

    if !meta.is_file() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"));
    }

    let pos = match start {
        TailMode::Existing => file.seek(io::SeekFrom::Start(meta.len())).await?,
        TailMode::New => 0,
    };

    Ok((BufReader::new(file), pos, file_id(&meta)))
}

#[cfg(unix)]
type FileId = (u64, u64);

#[cfg(unix)]
fn file_id(meta: &Metadata) -> Option<FileId> {
    use std::os::unix::fs::MetadataExt;

    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
type FileId = ();

#[cfg(not(unix))]
fn file_id(_meta: &Metadata) -> Option<FileId> {
    None
}

enum Wakeup {
    Poll(Duration),
    Signal(Arc<Notify>),
}

impl Wakeup {
    async fn wait(&self) {
        match self {
            Wakeup::Poll(interval) => tokio::time::sleep(*interval).await,
            Wakeup::Signal(changed) => {
                // A stored permit stands for any number of signals sent meanwhile.
                let _ = tokio::time::timeout(NOTIFY_FALLBACK, changed.notified()).await;
            }
        }
    }
}

/// Follows a single file, producing each complete line appended to it.
///
/// Truncation (the file shrinking below what has been read) restarts reading
/// at offset 0. A different file appearing under the same path is read from
/// its start once the old one is drained. The sequence ends when the path no
/// longer exists.
pub struct FileTail {
    path: PathBuf,
    reader: BufReader<File>,
    pos: u64,
    identity: Option<FileId>,
    /// Bytes of a line whose newline hasn't been written yet.
    partial: Vec<u8>,
    missing_since: Option<Instant>,
    wakeup: Wakeup,
}

impl fmt::Debug for FileTail {
    fn fmt(&self, f: &mut fmt::Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("FileTail")
            .field("path", &self.path)
            .field("pos", &self.pos)
            .field("partial", &self.partial.len())
            .finish()
    }
}

impl FileTail {
    /// Opens `path` for tailing.
    ///
    /// With `poll_interval` set the file is re-checked on that interval.
    /// Otherwise the tail sleeps until its [`change_signal`](Self::change_signal)
    /// is notified, re-checking once a second at most.
    pub async fn open(
        path: impl Into<PathBuf>,
        mode: TailMode,
        poll_interval: Option<Duration>,
    ) -> io::Result<Self> {
        let path = path.into();
        let (reader, pos, identity) = new_linereader(&path, mode).await?;
        let wakeup = match poll_interval {
            Some(interval) => Wakeup::Poll(interval.max(MIN_INTERVAL)),
            None => Wakeup::Signal(Arc::new(Notify::new())),
        };

        Ok(FileTail {
            path,
            reader,
            pos,
            identity,
            partial: Vec::new(),
            missing_since: None,
            wakeup,
        })
    }

    /// Returns the path being followed.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the handle to notify when the file may have changed, or
    /// `None` for a polling tail.
    ///
    /// The directory watcher already sees every write, so its events are
    /// routed here instead of each tail watching its own file.
    pub fn change_signal(&self) -> Option<Arc<Notify>> {
        match &self.wakeup {
            Wakeup::Signal(changed) => Some(changed.clone()),
            Wakeup::Poll(_) => None,
        }
    }

    /// Waits for the next complete line.
    ///
    /// Returns `None` once the file has been removed, and `Some(Err(_))` when
    /// reading fails; the tail should not be polled after either.
    pub async fn next_line(&mut self) -> Option<io::Result<String>> {
        loop {
            match self.read_line().await {
                Ok(Some(line)) => return Some(Ok(line)),
                Ok(None) => {}
                Err(e) => return Some(Err(e)),
            }

            match self.reopen_if_rotated().await {
                Ok(false) => self.missing_since = None,
                Ok(true) => {
                    self.missing_since = None;
                    // Whatever was left unterminated belonged to the old file.
                    if !self.partial.is_empty() {
                        return Some(Ok(self.take_partial()));
                    }
                    continue;
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    let since = *self.missing_since.get_or_insert_with(Instant::now);
                    if since.elapsed() >= REMOVAL_GRACE {
                        debug!(path = %self.path.display(), "file removed");
                        return None;
                    }
                }
                Err(e) => return Some(Err(e)),
            }

            self.wakeup.wait().await;
        }
    }

    /// Reads up to the next newline. `Ok(None)` means end-of-file was hit
    /// first; the partial bytes are kept for the next attempt.
    async fn read_line(&mut self) -> io::Result<Option<String>> {
        let read = self.reader.read_until(b'\n', &mut self.partial).await?;
        self.pos += read as u64;

        if self.partial.last() == Some(&b'\n') {
            self.partial.pop();
            if self.partial.last() == Some(&b'\r') {
                self.partial.pop();
            }
            return Ok(Some(self.take_partial()));
        }

        Ok(None)
    }

    fn take_partial(&mut self) -> String {
        let bytes = mem::take(&mut self.partial);
        match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        }
    }

    async fn reopen_if_rotated(&mut self) -> io::Result<bool> {
        let meta = metadata(&self.path).await?;

        let replaced = file_id(&meta) != self.identity;
        let truncated = !replaced && meta.len() < self.pos;

        if !replaced && !truncated {
            return Ok(false);
        }

        debug!(path = %self.path.display(), replaced, truncated, "file rotated, reading from start");

        if truncated {
            // The unterminated tail was overwritten along with the rest.
            self.partial.clear();
        }

        let (reader, pos, identity) = new_linereader(&self.path, TailMode::New).await?;
        self.reader = reader;
        self.pos = pos;
        self.identity = identity;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;
    use tokio::time::timeout;

    const POLL: Option<Duration> = Some(Duration::from_millis(10));
    const WAIT: Duration = Duration::from_secs(2);

    fn append(path: &Path, data: &str) {
        let mut file = OpenOptions::new().create(true).append(true).open(path).unwrap();
        file.write_all(data.as_bytes()).unwrap();
        file.sync_all().unwrap();
    }

    async fn next(tail: &mut FileTail) -> String {
        timeout(WAIT, tail.next_line()).await.unwrap().unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_existing_mode_skips_history() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("current.log");
        append(&path, "old line\n");

        let mut tail = FileTail::open(&path, TailMode::Existing, POLL).await.unwrap();
        append(&path, "hello\n");

        assert_eq!(next(&mut tail).await, "hello");
    }

    #[tokio::test]
    async fn test_new_mode_reads_everything() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("rotated.log");
        append(&path, "first\nsecond\r\n");

        let mut tail = FileTail::open(&path, TailMode::New, POLL).await.unwrap();

        assert_eq!(next(&mut tail).await, "first");
        assert_eq!(next(&mut tail).await, "second");
    }

    #[tokio::test]
    async fn test_partial_line_waits_for_newline() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("partial.log");
        append(&path, "");

        let mut tail = FileTail::open(&path, TailMode::New, POLL).await.unwrap();
        append(&path, "foo ");

        assert!(timeout(Duration::from_millis(100), tail.next_line()).await.is_err());

        append(&path, "bar\n");
        assert_eq!(next(&mut tail).await, "foo bar");
    }

    #[tokio::test]
    async fn test_change_signal_wakes_tail() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("signalled.log");
        append(&path, "");

        let mut tail = FileTail::open(&path, TailMode::Existing, None).await.unwrap();
        let changed = tail.change_signal().unwrap();

        let writer = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            append(&writer, "woken\n");
            changed.notify_one();
        });

        // Well under the one second fallback re-check.
        let line = timeout(Duration::from_millis(500), tail.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(line, "woken");
    }

    #[tokio::test]
    async fn test_polling_tail_has_no_signal() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("polled.log");
        append(&path, "");

        let tail = FileTail::open(&path, TailMode::Existing, POLL).await.unwrap();
        assert!(tail.change_signal().is_none());
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("truncated.log");
        append(&path, "a fairly long line that will be truncated away\n");

        let mut tail = FileTail::open(&path, TailMode::New, POLL).await.unwrap();
        assert_eq!(
            next(&mut tail).await,
            "a fairly long line that will be truncated away"
        );

        std::fs::write(&path, "short\n").unwrap();
        assert_eq!(next(&mut tail).await, "short");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_replaced_file_is_reopened() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("app.log");
        append(&path, "");

        let mut tail = FileTail::open(&path, TailMode::Existing, POLL).await.unwrap();
        append(&path, "before\n");
        assert_eq!(next(&mut tail).await, "before");

        std::fs::rename(&path, tmp_dir.path().join("app.log.1")).unwrap();
        append(&path, "after\n");

        assert_eq!(next(&mut tail).await, "after");
    }

    #[tokio::test]
    async fn test_removed_file_ends_sequence() {
        let tmp_dir = tempdir().unwrap();
        let path = tmp_dir.path().join("gone.log");
        append(&path, "");

        let mut tail = FileTail::open(&path, TailMode::Existing, POLL).await.unwrap();
        std::fs::remove_file(&path).unwrap();

        assert!(timeout(WAIT, tail.next_line()).await.unwrap().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_directory_fails() {
        let tmp_dir = tempdir().unwrap();

        let err = FileTail::open(tmp_dir.path(), TailMode::New, POLL)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
