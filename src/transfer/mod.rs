//! File transfer: one TCP connection per task, blake3-verified on receipt.
//! `client` pulls bytes from a peer's [`server`]; both sides report progress
//! through [`TaskMonitor`].

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

/// One file within a transfer task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
	/// Path relative to the remote tree root.
	pub remote_path: String,
	/// Destination path on the local filesystem (a temp path the caller
	/// will atomically rename into place after verification).
	pub local_temp_path: String,
	pub length: u64,
	/// Expected content hash (blake3, see DESIGN.md for the `sha1` naming).
	pub expected_hash: String,
}

/// An ordered list of files to fetch in one streamed connection.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransferTask {
	pub items: Vec<TransferItem>,
}

/// Per-item transfer outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
	Transferred,
	/// Hash mismatch, truncated stream, or I/O error; caller retries next session.
	Failed { message: String },
}

/// Progress callbacks for a running transfer task. Default methods are
/// no-ops so callers only implement what they need.
pub trait TaskMonitor: Send + Sync {
	fn on_byte_transferred(&self, _task_id: u64, _item: &str, _bytes: u64) {}
	fn on_file_transferred(&self, _task_id: u64, _item: &str) {}
	fn on_file_skipped(&self, _task_id: u64, _item: &str, _reason: &str) {}
}

/// A [`TaskMonitor`] that does nothing; used where no progress reporting
/// is wired up.
pub struct NullMonitor;
impl TaskMonitor for NullMonitor {}

// vim: ts=4
