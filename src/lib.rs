//! A library for following every log file under a directory tree.
//!
//! A [`Trail`] tails the files its [`Watcher`] lists, follows files created
//! afterwards, drops files that are removed or stop changing, and hands each
//! appended line to a caller-supplied handler.
//!
//! ## Example
//!
//! ```no_run
//! use logtrail::{DirectoryWatcher, Trail};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let watcher = DirectoryWatcher::new("/var/log/app")?;
//!     let trail = Trail::new(watcher);
//!
//!     // Lines already in the files are skipped; only new ones show up here.
//!     trail
//!         .follow(|line: logtrail::Line| {
//!             println!("[{}] {}", line.source().display(), line.line());
//!             Ok::<_, std::io::Error>(())
//!         })
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     trail.end().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! Nothing is retried. A file that can't be opened is not followed, a file
//! that fails mid-read delivers one [`Line`] carrying the error and is then
//! dropped, and a handler error is logged without affecting delivery.
//!
//! Stat calls made while checking file ages run on the calling task without
//! a timeout, so a filesystem that hangs will stall the event loop or the
//! staleness sweep along with it.
//!
//! Stopping a follower waits a few seconds for its task and then aborts it,
//! but an abort only takes effect at an `.await`. A handler that blocks the
//! thread for longer than that keeps running, so [`Trail::end`] may return
//! while that one call is still in progress.
//!
//! Without [`TrailOptions::poll_changes`], followers are woken by the
//! watcher's write events for their path. A [`Watcher`] that reports no
//! writes still works, with each file re-checked about once a second.

mod config;
mod event_loop;
mod events;
mod follower;
mod line;
mod options;
mod policy;
mod pool;
mod reader;
mod sweeper;
mod trail;

pub use config::{Error as ConfigError, TrailConfig};
pub use events::{DirectoryWatcher, Error as WatchError, FileEvent, Op, Watcher};
pub use follower::SpawnError;
pub use line::{BoxError, Line, LineFilter};
pub use options::{
    TrailOptions, DEFAULT_MAX_AGE, DEFAULT_POLL_INTERVAL, DEFAULT_SWEEP_INTERVAL, MIN_INTERVAL,
};
pub use policy::PolicyFilter;
pub use reader::{FileTail, TailMode};
pub use trail::{Error, Trail};

#[cfg(doctest)]
doc_comment::doctest!("../README.md");
