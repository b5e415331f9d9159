use std::time::Duration;

use regex::Regex;
use tracing::Span;

/// Age past which files are neither picked up nor kept, unless configured.
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How often followed files are checked for staleness, unless configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(10);

/// How often a polling tail re-reads its file, unless configured.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Shortest poll or sweep interval accepted; anything below is raised to it.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Options for a [`Trail`](crate::Trail).
///
/// Options are fixed once the trail is built. Regexes are compiled by the
/// caller; see [`TrailConfig`](crate::TrailConfig) for building these from
/// plain strings.
#[derive(Clone, Debug)]
pub struct TrailOptions {
    pub(crate) poll: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) file_include: Option<Regex>,
    pub(crate) file_exclude: Option<Regex>,
    pub(crate) path_include: Option<Regex>,
    pub(crate) ignore_if_older_than: Option<Duration>,
    pub(crate) unfollow_if_older_than: Option<Duration>,
    pub(crate) sweep_interval: Duration,
    pub(crate) span: Span,
}

impl Default for TrailOptions {
    fn default() -> Self {
        TrailOptions {
            poll: false,
            poll_interval: DEFAULT_POLL_INTERVAL,
            file_include: None,
            file_exclude: None,
            path_include: None,
            ignore_if_older_than: Some(DEFAULT_MAX_AGE),
            unfollow_if_older_than: Some(DEFAULT_MAX_AGE),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            span: tracing::info_span!("trail"),
        }
    }
}

impl TrailOptions {
    /// Creates options with the defaults: notify-driven tails, no name
    /// patterns, and both age rules at [`DEFAULT_MAX_AGE`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Poll followed files for changes instead of relying on filesystem
    /// notifications.
    pub fn poll_changes(mut self, poll: bool) -> Self {
        self.poll = poll;
        self
    }

    /// How often polling tails re-read their file. Only used together with
    /// [`poll_changes`](Self::poll_changes); raised to [`MIN_INTERVAL`].
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Only follow files whose name matches `pattern`.
    pub fn file_include(mut self, pattern: Regex) -> Self {
        self.file_include = Some(pattern);
        self
    }

    /// Never follow files whose name matches `pattern`.
    pub fn file_exclude(mut self, pattern: Regex) -> Self {
        self.file_exclude = Some(pattern);
        self
    }

    /// Only follow files whose parent directory matches `pattern`.
    pub fn path_include(mut self, pattern: Regex) -> Self {
        self.path_include = Some(pattern);
        self
    }

    /// Skip discovered files last modified at least `age` ago. `None`
    /// disables the check.
    pub fn ignore_if_older_than(mut self, age: Option<Duration>) -> Self {
        self.ignore_if_older_than = age;
        self
    }

    /// Stop following files last modified at least `age` ago. `None`
    /// disables the staleness sweep altogether.
    pub fn unfollow_if_older_than(mut self, age: Option<Duration>) -> Self {
        self.unfollow_if_older_than = age;
        self
    }

    /// How often followed files are checked against
    /// [`unfollow_if_older_than`](Self::unfollow_if_older_than); raised to
    /// [`MIN_INTERVAL`].
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Span every log event of the trail is recorded under.
    pub fn span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub(crate) fn tail_poll_interval(&self) -> Option<Duration> {
        self.poll.then_some(self.poll_interval)
    }
}
