//! Prints every line appended to the files under the given directories.
//!
//! Usage:
//!     follow /path/to/dir1 /path/to/dir2 ...
//!
//! Set `RUST_LOG=logtrail=debug` to see files being picked up and dropped.

use logtrail::{DirectoryWatcher, Line, Trail};
use tracing::info_span;
use tracing_subscriber::EnvFilter;

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut trails = Vec::new();
    for dir in args {
        let watcher = DirectoryWatcher::new(&dir)?;
        let options = logtrail::TrailOptions::new().span(info_span!("trail", dir = %dir));
        let trail = Trail::with_options(watcher, options);

        trail
            .follow(|line: Line| {
                match line.error() {
                    Some(e) => eprintln!("({}) error: {}", line.source().display(), e),
                    None => println!("({}) {}", line.source().display(), line.line()),
                }
                Ok::<_, std::io::Error>(())
            })
            .await?;
        trails.push(trail);
    }

    tokio::signal::ctrl_c().await?;

    for trail in &trails {
        trail.end().await;
    }

    Ok(())
}
