//! Deciding which files are worth following.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::error;

use crate::TrailOptions;

/// Returns how long ago `modified` was. Timestamps in the future count as
/// no age at all.
pub(crate) fn age(modified: SystemTime, now: SystemTime) -> Duration {
    now.duration_since(modified).unwrap_or_default()
}

/// Decides whether a path should be ignored.
///
/// A path is ignored when any of these hold:
///   1. a path pattern is set and the parent directory doesn't match it,
///   2. a file pattern is set and the file name doesn't match it,
///   3. an exclude pattern is set and the file name matches it,
///   4. the file was last modified at least `ignore_if_older_than` ago.
///
/// If the file can't be stat'ed, rule 4 does not apply: the failure is
/// logged and the file is judged on its name alone.
#[derive(Clone, Debug, Default)]
pub struct PolicyFilter {
    path_include: Option<Regex>,
    file_include: Option<Regex>,
    file_exclude: Option<Regex>,
    ignore_if_older_than: Option<Duration>,
}

impl From<&TrailOptions> for PolicyFilter {
    fn from(options: &TrailOptions) -> Self {
        PolicyFilter {
            path_include: options.path_include.clone(),
            file_include: options.file_include.clone(),
            file_exclude: options.file_exclude.clone(),
            ignore_if_older_than: options.ignore_if_older_than,
        }
    }
}

impl PolicyFilter {
    /// Applies every rule; the age rule stats `path`.
    pub fn should_ignore(&self, path: &Path) -> bool {
        self.ignored_by_name(path) || self.ignored_by_age(path, SystemTime::now())
    }

    /// Applies rules 1 to 3, which never touch the filesystem.
    pub fn ignored_by_name(&self, path: &Path) -> bool {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let name = path.file_name().unwrap_or(path.as_os_str()).to_string_lossy();

        if let Some(re) = &self.path_include {
            if !re.is_match(&dir.to_string_lossy()) {
                return true;
            }
        }
        if let Some(re) = &self.file_include {
            if !re.is_match(&name) {
                return true;
            }
        }
        self.file_exclude.as_ref().is_some_and(|re| re.is_match(&name))
    }

    fn ignored_by_age(&self, path: &Path, now: SystemTime) -> bool {
        let Some(max_age) = self.ignore_if_older_than else {
            return false;
        };

        match fs::metadata(path).and_then(|meta| meta.modified()) {
            Ok(modified) => age(modified, now) >= max_age,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to stat file, not ignoring it");
                false
            }
        }
    }
}
