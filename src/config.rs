//! Plain-data configuration, as read from a config file.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use crate::{LineFilter, TrailOptions};

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid {field} `{pattern}`: {source}")]
    Pattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Settings for watching one set of directories.
///
/// Patterns are regular expressions; durations use the humantime format
/// (`"36h"`, `"7days"`). Empty patterns and zero durations count as unset.
///
/// ```toml
/// paths = ["/var/log/app"]
/// file_pattern = '\.log$'
/// file_ignore_pattern = '\.gz$'
/// file_follow_duration = "2days"
/// line_ignore_pattern = "healthcheck"
/// ```
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct TrailConfig {
    pub paths: Vec<PathBuf>,
    pub poll: bool,
    pub file_pattern: Option<String>,
    pub file_ignore_pattern: Option<String>,
    pub path_pattern: Option<String>,
    pub line_pattern: Option<String>,
    pub line_ignore_pattern: Option<String>,
    #[serde(with = "humantime_serde")]
    pub file_ignore_duration: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub file_follow_duration: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Option<Duration>,
    pub desc: Option<String>,
}

impl TrailConfig {
    /// Builds the options for a trail over any of the configured paths.
    pub fn options(&self) -> Result<TrailOptions, Error> {
        let mut options = TrailOptions::new().poll_changes(self.poll);

        if let Some(re) = compile("file_pattern", &self.file_pattern)? {
            options = options.file_include(re);
        }
        if let Some(re) = compile("file_ignore_pattern", &self.file_ignore_pattern)? {
            options = options.file_exclude(re);
        }
        if let Some(re) = compile("path_pattern", &self.path_pattern)? {
            options = options.path_include(re);
        }
        if let Some(age) = non_zero(self.file_ignore_duration) {
            options = options.ignore_if_older_than(Some(age));
        }
        if let Some(age) = non_zero(self.file_follow_duration) {
            options = options.unfollow_if_older_than(Some(age));
        }
        if let Some(interval) = non_zero(self.sweep_interval) {
            options = options.sweep_interval(interval);
        }

        Ok(options)
    }

    /// Builds the filter for the configured line patterns.
    pub fn line_filter(&self) -> Result<LineFilter, Error> {
        let mut filter = LineFilter::new();

        if let Some(re) = compile("line_pattern", &self.line_pattern)? {
            filter = filter.include(re);
        }
        if let Some(re) = compile("line_ignore_pattern", &self.line_ignore_pattern)? {
            filter = filter.exclude(re);
        }

        Ok(filter)
    }
}

fn compile(field: &'static str, pattern: &Option<String>) -> Result<Option<Regex>, Error> {
    match pattern.as_deref() {
        None | Some("") => Ok(None),
        Some(pattern) => Regex::new(pattern).map(Some).map_err(|source| Error::Pattern {
            field,
            pattern: pattern.to_string(),
            source,
        }),
    }
}

fn non_zero(duration: Option<Duration>) -> Option<Duration> {
    duration.filter(|d| !d.is_zero())
}
