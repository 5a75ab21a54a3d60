//! Wires a `notify` watcher to a [`Coalescer`] and a periodic drain tick.
//!
//! Grounded on the `notify::recommended_watcher` + channel + coalescing-task
//! pattern seen across the example pack (e.g. the cortex VFS watcher):
//! the OS callback only converts and forwards, all coalescing state lives
//! in the spawned task.

use std::path::Path;
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::coalescer::{Coalescer, RawEvent, RawEventKind, ScanRequest, REPORT_EVENTS_TO_WORKER_INTERVAL_IN_MS};
use crate::error::ZiError;

/// A live watch on one tree root: owns the OS watcher and the task that
/// drains the coalescer on the worker's cadence.
pub struct RootWatcher {
	_watcher: RecommendedWatcher,
	drain_task: JoinHandle<()>,
	requests: mpsc::UnboundedReceiver<ScanRequest>,
}

impl RootWatcher {
	/// Start watching `root` recursively, emitting [`ScanRequest`]s on the
	/// returned receiver.
	pub fn start(root: &Path) -> Result<Self, ZiError> {
		let root_display = root.to_string_lossy().to_string();
		let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<RawEvent>();
		let (req_tx, req_rx) = mpsc::unbounded_channel::<ScanRequest>();

		let root_for_cb = root.to_path_buf();
		let tx_for_errors = raw_tx.clone();
		let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
			match res {
				Ok(event) => {
					for raw in convert_event(&root_for_cb, &event) {
						let _ = tx_for_errors.send(raw);
					}
				}
				Err(e) => {
					warn!(error = %e, "watch error, requesting full refresh");
				}
			}
		})
		.map_err(|e| ZiError::OsIo(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

		watcher
			.watch(root, RecursiveMode::Recursive)
			.map_err(|e| ZiError::OsIo(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))?;

		let drain_task = tokio::spawn(async move {
			let mut coalescer = Coalescer::new(root_display);
			let mut ticker =
				tokio::time::interval(Duration::from_millis(REPORT_EVENTS_TO_WORKER_INTERVAL_IN_MS));

			loop {
				tokio::select! {
					event = raw_rx.recv() => {
						match event {
							Some(event) => coalescer.observe(event, Instant::now()),
							None => break,
						}
					}
					_ = ticker.tick() => {
						if !coalescer.is_empty() {
							let request = coalescer.drain_due(Instant::now());
							if !request.paths.is_empty() && req_tx.send(request).is_err() {
								break;
							}
						}
					}
				}
			}
			debug!("watcher drain task exiting");
		});

		Ok(RootWatcher { _watcher: watcher, drain_task, requests: req_rx })
	}

	/// Receive the next batch of paths the scanner should re-check.
	pub async fn recv(&mut self) -> Option<ScanRequest> {
		self.requests.recv().await
	}
}

impl Drop for RootWatcher {
	fn drop(&mut self) {
		self.drain_task.abort();
	}
}

fn convert_event(root: &Path, event: &Event) -> Vec<RawEvent> {
	let kind = match event.kind {
		EventKind::Create(_) => RawEventKind::Create,
		EventKind::Modify(notify::event::ModifyKind::Metadata(_)) => RawEventKind::Attrib,
		EventKind::Modify(notify::event::ModifyKind::Name(notify::event::RenameMode::From)) => {
			RawEventKind::MoveFrom
		}
		EventKind::Modify(notify::event::ModifyKind::Name(notify::event::RenameMode::To)) => {
			RawEventKind::MoveTo
		}
		EventKind::Modify(_) => RawEventKind::Modify,
		EventKind::Remove(_) => RawEventKind::Delete,
		_ => return Vec::new(),
	};

	let cookie = event.attrs.tracker().map(|t| t as u64);

	event
		.paths
		.iter()
		.filter_map(|path| relative_to(root, path))
		.map(|rel| RawEvent { kind, path: rel, cookie })
		.collect()
}

fn relative_to(root: &Path, path: &Path) -> Option<String> {
	path.strip_prefix(root)
		.ok()
		.map(|p| p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
		.filter(|s| !s.is_empty())
		.or_else(|| {
			if path == root {
				None
			} else {
				Some(path.to_string_lossy().to_string())
			}
		})
}

// vim: ts=4
