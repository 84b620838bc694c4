//! A file-backed snapshot source for local and test deployments: parses the
//! routes file, then re-reads it on every change. Parse failures keep the
//! last-known-good snapshot serving; read failures retry with capped
//! exponential backoff.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use notify::RecursiveMode;
use notify_debouncer_full::new_debouncer;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::RouteSnapshot;

const DEBOUNCE: Duration = Duration::from_millis(200);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

pub struct LocalFileSource {
	path: PathBuf,
	// Versions are assigned locally when the file omits them.
	next_version: u64,
	last_sent: u64,
}

impl LocalFileSource {
	pub fn new(path: PathBuf) -> Self {
		Self {
			path,
			next_version: 1,
			last_sent: 0,
		}
	}

	/// Watches the file until the subscriber goes away.
	pub async fn run(mut self, tx: mpsc::Sender<RouteSnapshot>) -> anyhow::Result<()> {
		// First load retries with backoff so the engine can start before
		// the control plane has written anything.
		let mut backoff = BACKOFF_INITIAL;
		loop {
			match self.load() {
				Ok(snapshot) => {
					if tx.send(snapshot).await.is_err() {
						return Ok(());
					}
					break;
				},
				Err(e) => {
					warn!(path = %self.path.display(), "initial routes load failed, retrying in {backoff:?}: {e:#}");
					tokio::time::sleep(backoff).await;
					backoff = (backoff * 2).min(BACKOFF_MAX);
				},
			}
		}

		let (events_tx, mut events_rx) = mpsc::unbounded_channel();
		let mut debouncer = new_debouncer(DEBOUNCE, None, move |event| {
			let _ = events_tx.send(event);
		})
		.context("starting file watcher")?;
		// Watch the parent so file replacement (the common atomic-write
		// pattern) is observed.
		let watch_target = self
			.path
			.parent()
			.filter(|p| !p.as_os_str().is_empty())
			.unwrap_or(Path::new("."));
		debouncer
			.watch(watch_target, RecursiveMode::NonRecursive)
			.with_context(|| format!("watching {}", watch_target.display()))?;
		info!(path = %self.path.display(), "watching routes file");

		while let Some(event) = events_rx.recv().await {
			if let Err(e) = event {
				debug!("watch error: {e:?}");
				continue;
			}
			match self.load() {
				Ok(snapshot) => {
					if tx.send(snapshot).await.is_err() {
						break;
					}
				},
				Err(e) => {
					warn!(path = %self.path.display(), "routes reload failed, keeping last snapshot: {e:#}");
				},
			}
		}
		Ok(())
	}

	fn load(&mut self) -> anyhow::Result<RouteSnapshot> {
		let contents = fs_err::read_to_string(&self.path)?;
		let mut snapshot: RouteSnapshot =
			serde_yaml::from_str(&contents).context("parsing routes file")?;
		if snapshot.version == 0 {
			snapshot.version = self.next_version;
		}
		// Files rewritten without bumping the version still take effect.
		if snapshot.version <= self.last_sent {
			snapshot.version = self.last_sent + 1;
		}
		self.last_sent = snapshot.version;
		self.next_version = snapshot.version + 1;
		Ok(snapshot)
	}
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	fn write_routes(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
		let path = dir.path().join("routes.yaml");
		let mut f = fs_err::File::create(&path).unwrap();
		f.write_all(contents.as_bytes()).unwrap();
		path
	}

	#[test]
	fn versions_are_assigned_when_omitted() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_routes(&dir, "routes: []");
		let mut source = LocalFileSource::new(path);
		assert_eq!(source.load().unwrap().version, 1);
		assert_eq!(source.load().unwrap().version, 2);
	}

	#[test]
	fn explicit_versions_are_kept_and_never_regress() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_routes(&dir, "version: 7\nroutes: []");
		let mut source = LocalFileSource::new(path.clone());
		assert_eq!(source.load().unwrap().version, 7);
		// Same version on disk still produces a newer snapshot.
		assert_eq!(source.load().unwrap().version, 8);
	}

	#[test]
	fn parse_errors_surface() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_routes(&dir, "routes: {not: [valid");
		let mut source = LocalFileSource::new(path);
		assert!(source.load().is_err());
	}

	#[tokio::test]
	async fn run_delivers_initial_snapshot_and_reloads_on_change() {
		let dir = tempfile::tempdir().unwrap();
		let path = write_routes(&dir, "routes: []");
		let (tx, mut rx) = mpsc::channel(4);
		let source = LocalFileSource::new(path.clone());
		let handle = tokio::spawn(source.run(tx));

		let first = rx.recv().await.unwrap();
		assert_eq!(first.version, 1);
		assert!(first.routes.is_empty());

		// Rewrite the file; the watcher should deliver a newer snapshot.
		fs_err::write(&path, "routes:\n  - route: r1\n").unwrap();
		let second = tokio::time::timeout(Duration::from_secs(10), rx.recv())
			.await
			.expect("watcher delivered a reload")
			.unwrap();
		assert!(second.version > first.version);
		assert_eq!(second.routes.len(), 1);

		drop(rx);
		handle.abort();
	}
}
