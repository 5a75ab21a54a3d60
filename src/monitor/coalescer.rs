//! Per-root event coalescing state machine.
//!
//! Grounded on `cache.rs`'s table-of-latest-state idiom, generalized from a
//! single cached value per key to a pending-event-per-path table with two
//! release timers (plain coalescing, move pairing) plus a slower drain tick.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::scanner::is_reserved_metadata_path;

pub const CREATE_OR_MODIFY_WAIT_TIME_IN_MS: u64 = 100;
pub const FILE_MOVE_WAIT_TIME_IN_MS: u64 = 100;
pub const REPORT_EVENTS_TO_WORKER_INTERVAL_IN_MS: u64 = 2000;

/// Raw event kind as reported by the OS watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RawEventKind {
	Create,
	Modify,
	Delete,
	Attrib,
	MoveFrom,
	MoveTo,
}

/// One raw event observed on a watched root.
#[derive(Debug, Clone)]
pub struct RawEvent {
	pub kind: RawEventKind,
	/// Path relative to the tree root.
	pub path: String,
	/// Present for MOVE_FROM/MOVE_TO; used to pair the two halves of a rename.
	pub cookie: Option<u64>,
}

/// A batch of paths the coalescer is asking the FS Scanner to re-check.
/// An empty `paths` list means "full refresh" (miss recovery).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRequest {
	pub tree_root: String,
	pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingKind {
	CreateModifyOrAttrib,
	Delete,
}

#[derive(Debug, Clone)]
struct Pending {
	kind: PendingKind,
	last_seen: Instant,
}

#[derive(Debug, Clone, Default)]
struct MovePair {
	from: Option<String>,
	to: Option<String>,
	first_seen: Option<Instant>,
}

/// Coalesces raw filesystem events for one watched tree root.
pub struct Coalescer {
	tree_root: String,
	pending: HashMap<String, Pending>,
	moves: HashMap<u64, MovePair>,
	last_drain: Option<Instant>,
}

impl Coalescer {
	pub fn new(tree_root: impl Into<String>) -> Self {
		Coalescer { tree_root: tree_root.into(), pending: HashMap::new(), moves: HashMap::new(), last_drain: None }
	}

	/// Record one raw event. Events on reserved metadata paths are dropped
	/// at the source and never reach the pending table.
	pub fn observe(&mut self, event: RawEvent, now: Instant) {
		if is_ignored(&event.path) {
			return;
		}

		match event.kind {
			RawEventKind::Create | RawEventKind::Modify | RawEventKind::Attrib => {
				self.pending.insert(
					event.path,
					Pending { kind: PendingKind::CreateModifyOrAttrib, last_seen: now },
				);
			}
			RawEventKind::Delete => {
				self.pending.insert(event.path, Pending { kind: PendingKind::Delete, last_seen: now });
			}
			RawEventKind::MoveFrom => {
				let cookie = event.cookie.unwrap_or(0);
				let entry = self.moves.entry(cookie).or_default();
				entry.from = Some(event.path);
				entry.first_seen.get_or_insert(now);
			}
			RawEventKind::MoveTo => {
				let cookie = event.cookie.unwrap_or(0);
				let entry = self.moves.entry(cookie).or_default();
				entry.to = Some(event.path);
				entry.first_seen.get_or_insert(now);
			}
		}
	}

	/// Drain everything that is due for release as of `now`: plain
	/// create/modify/delete events past their wait window, paired moves
	/// (released as soon as both halves arrive), and unmatched moves past
	/// their own wait window (released as their original half only, which
	/// the scanner's merge-join then treats as a delete or subtree insert).
	///
	/// Should be called no more often than once per
	/// [`REPORT_EVENTS_TO_WORKER_INTERVAL_IN_MS`]; callers that want the
	/// scheduler cadence enforced should use [`crate::monitor::watcher`].
	pub fn drain_due(&mut self, now: Instant) -> ScanRequest {
		self.last_drain = Some(now);
		let mut paths = Vec::new();

		let wait = Duration::from_millis(CREATE_OR_MODIFY_WAIT_TIME_IN_MS);
		let due_paths: Vec<String> = self
			.pending
			.iter()
			.filter(|(_, p)| now.saturating_duration_since(p.last_seen) >= wait)
			.map(|(path, _)| path.clone())
			.collect();
		for path in due_paths {
			self.pending.remove(&path);
			paths.push(path);
		}

		let move_wait = Duration::from_millis(FILE_MOVE_WAIT_TIME_IN_MS);
		let mut settled_cookies = Vec::new();
		for (cookie, pair) in self.moves.iter() {
			let both_present = pair.from.is_some() && pair.to.is_some();
			let timed_out = pair
				.first_seen
				.map(|t| now.saturating_duration_since(t) >= move_wait)
				.unwrap_or(false);
			if both_present || timed_out {
				settled_cookies.push(*cookie);
			}
		}
		for cookie in settled_cookies {
			if let Some(pair) = self.moves.remove(&cookie) {
				if let Some(from) = pair.from {
					paths.push(from);
				}
				if let Some(to) = pair.to {
					paths.push(to);
				}
			}
		}

		paths.sort();
		paths.dedup();
		ScanRequest { tree_root: self.tree_root.clone(), paths }
	}

	/// Whether there is nothing pending release (neither plain events nor
	/// unsettled moves).
	pub fn is_empty(&self) -> bool {
		self.pending.is_empty() && self.moves.is_empty()
	}

	/// The watcher lost events (buffer overflow, backend error): request a
	/// full refresh of this root instead of trying to reconcile partial state.
	pub fn on_watch_error(&mut self) -> ScanRequest {
		self.pending.clear();
		self.moves.clear();
		ScanRequest { tree_root: self.tree_root.clone(), paths: Vec::new() }
	}
}

fn is_ignored(rel_path: &str) -> bool {
	let basename = rel_path.rsplit('/').next().unwrap_or(rel_path);
	is_reserved_metadata_path(basename)
}


// vim: ts=4
