//! The set of files currently followed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::follower::{Follower, FollowerId};

#[derive(Debug, Default)]
struct Inner {
    followers: HashMap<PathBuf, Follower>,
    /// Set once the trail has shut down; nothing is admitted afterwards.
    closed: bool,
}

/// Followers keyed by path, shared between the event loop, the staleness
/// sweeper and the followers themselves.
///
/// Every structural change happens under one lock, and the lock is never
/// held across an `.await`. Removal always stops the follower before taking
/// it out of the map; waiting for its task to end is left to the caller, with
/// the lock released.
#[derive(Clone, Debug, Default)]
pub(crate) struct FollowerPool {
    inner: Arc<Mutex<Inner>>,
}

impl FollowerPool {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Nothing in here can be left half-updated by a panic.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn contains(&self, path: &Path) -> bool {
        self.lock().followers.contains_key(path)
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().followers.len()
    }

    /// Returns the followed paths, sorted.
    pub(crate) fn paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.lock().followers.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Returns each followed path with the id of its follower, for passes
    /// that decide outside the lock and act later with [`evict`](Self::evict).
    pub(crate) fn snapshot(&self) -> Vec<(PathBuf, FollowerId)> {
        self.lock()
            .followers
            .iter()
            .map(|(path, follower)| (path.clone(), follower.id()))
            .collect()
    }

    /// Adds the follower built by `start`, unless `path` is already followed
    /// or the pool is closed, in which case `start` is never called.
    pub(crate) fn insert_with(&self, path: PathBuf, start: impl FnOnce() -> Follower) -> bool {
        let mut inner = self.lock();

        if inner.closed || inner.followers.contains_key(&path) {
            return false;
        }

        let follower = start();
        debug_assert_eq!(follower.path(), path.as_path());
        inner.followers.insert(path, follower);
        true
    }

    /// Tells the follower for `path`, if any, that its file may have changed.
    pub(crate) fn wake(&self, path: &Path) -> bool {
        match self.lock().followers.get(path) {
            Some(follower) => {
                follower.wake();
                true
            }
            None => false,
        }
    }

    /// Stops and removes the follower for `path`.
    pub(crate) fn remove(&self, path: &Path) -> Option<Follower> {
        let mut inner = self.lock();

        inner.followers.get(path)?.stop();
        inner.followers.remove(path)
    }

    /// Stops and removes the follower for `path` if it is still the one
    /// identified by `id`.
    pub(crate) fn evict(&self, path: &Path, id: FollowerId) -> Option<Follower> {
        let mut inner = self.lock();

        let follower = inner.followers.get(path)?;
        if follower.id() != id {
            return None;
        }
        follower.stop();
        inner.followers.remove(path)
    }

    /// Drops the entry of a follower that has already finished on its own.
    pub(crate) fn forget(&self, path: &Path, id: FollowerId) -> bool {
        let mut inner = self.lock();

        match inner.followers.get(path) {
            Some(follower) if follower.id() == id => {
                inner.followers.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Stops and removes every follower, leaving the pool open.
    pub(crate) fn clear(&self) -> Vec<Follower> {
        self.lock()
            .followers
            .drain()
            .map(|(_, follower)| {
                follower.stop();
                follower
            })
            .collect()
    }

    /// Stops every follower and refuses any new one from now on. Returns the
    /// stopped followers so their tasks can be waited for.
    pub(crate) fn close(&self) -> Vec<Follower> {
        let mut inner = self.lock();

        inner.closed = true;
        inner
            .followers
            .drain()
            .map(|(_, follower)| {
                follower.stop();
                follower
            })
            .collect()
    }
}
