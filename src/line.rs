//! Lines handed to the caller, and the plumbing around the caller's handler.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use regex::Regex;
use tracing::{error, warn};

/// Error type a line handler may return.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub(crate) type SharedHandler = Arc<dyn Fn(Line) -> Result<(), BoxError> + Send + Sync>;

/// A line read from a followed file.
///
/// When the underlying file can no longer be read, one final `Line` carrying
/// the error is delivered for that path and its follower stops.
#[derive(Debug)]
pub struct Line {
    /// The path from where the line was read.
    source: PathBuf,
    line: String,
    timestamp: SystemTime,
    error: Option<io::Error>,
}

impl Line {
    pub(crate) fn new(source: PathBuf, line: String) -> Self {
        Line {
            source,
            line,
            timestamp: SystemTime::now(),
            error: None,
        }
    }

    pub(crate) fn failed(source: PathBuf, error: io::Error) -> Self {
        Line {
            source,
            line: String::new(),
            timestamp: SystemTime::now(),
            error: Some(error),
        }
    }

    /// Returns a reference to the file from where the line was read.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    /// Returns the text of the line, without its line terminator.
    pub fn line(&self) -> &str {
        self.line.as_str()
    }

    /// Returns when the line was read.
    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Returns the read error that ended this file's follower, if any.
    pub fn error(&self) -> Option<&io::Error> {
        self.error.as_ref()
    }

    /// Returns `true` if this line only reports a read error.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Returns the source path and the line text.
    pub fn into_inner(self) -> (PathBuf, String) {
        let Line { source, line, .. } = self;

        (source, line)
    }
}

/// Hands `line` to the handler. Neither a returned error nor a panic stops
/// the caller; both are logged and delivery continues with the next line.
pub(crate) fn deliver(handler: &SharedHandler, line: Line) {
    let source = line.source.clone();

    match panic::catch_unwind(AssertUnwindSafe(|| handler(line))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(path = %source.display(), error = %e, "line handler failed"),
        Err(_) => error!(path = %source.display(), "line handler panicked"),
    }
}

/// Selects lines by their text.
///
/// A line passes when it matches the include pattern (if any) and does not
/// match the exclude pattern (if any). Lines carrying an error always pass.
#[derive(Clone, Debug, Default)]
pub struct LineFilter {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl LineFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn include(mut self, pattern: Regex) -> Self {
        self.include = Some(pattern);
        self
    }

    pub fn exclude(mut self, pattern: Regex) -> Self {
        self.exclude = Some(pattern);
        self
    }

    /// Returns whether a line with this text passes the filter.
    pub fn matches(&self, text: &str) -> bool {
        if self.exclude.as_ref().is_some_and(|re| re.is_match(text)) {
            return false;
        }
        self.include.as_ref().map_or(true, |re| re.is_match(text))
    }

    /// Wraps `handler` so that it only sees lines passing this filter.
    pub fn wrap<F, E>(self, handler: F) -> impl Fn(Line) -> Result<(), E> + Send + Sync + 'static
    where
        F: Fn(Line) -> Result<(), E> + Send + Sync + 'static,
    {
        move |line: Line| {
            if line.is_error() || self.matches(line.line()) {
                handler(line)
            } else {
                Ok(())
            }
        }
    }
}
