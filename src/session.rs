//! Sync Session: drives one round of the sync protocol between a local
//! tree and one remote tree — `Find`, column remap, per-path reconcile,
//! batched transfer, Path Store apply, `last_seen_remote_usn` advancement.
//!
//! Grounded on the node-loop/phase-sequencing shape of a typical sync
//! driver (send request, process reply, apply), adapted from the teacher's
//! connection-oriented node loop to the RPC + reconciler pipeline this
//! design calls for.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{SessionError, ZiError};
use crate::reconciler::{self, Action, ReconcileCtx};
use crate::rpc::{self, FindReply, FindRequest, Message};
use crate::scanner::HistorySink;
use crate::store::path_store::{PathOp, PathStore};
use crate::transfer::{self, TaskMonitor, TransferItem, TransferTask};
use crate::types::{EntryType, FileRecord, HistoryCode, HistoryEntry, RecordStatus};
use crate::vclock;

/// `Find`-time page size (§4.6); sessions round-trip while the reply is
/// capped at this size.
pub const FIND_LIMIT: usize = 5000;

/// Static facts describing the local side of one session, beyond what
/// [`ReconcileCtx`] already carries.
#[derive(Debug, Clone)]
pub struct SessionConfig {
	pub local_tree_uuid: Uuid,
	pub remote_tree_uuid: Uuid,
	pub sync_uuid: Uuid,
	pub tree_root: PathBuf,
	pub is_rdonly: bool,
	pub is_backup_dst: bool,
	pub is_backup_src: bool,
}

/// Result of one `run_round` call.
#[derive(Debug, Default)]
pub struct SessionOutcome {
	pub last_seen_remote_usn: u64,
	/// True when the reply was capped at [`FIND_LIMIT`] and another round
	/// should be scheduled immediately.
	pub should_continue: bool,
	pub applied: usize,
	pub conflicts: usize,
	/// New peer tree columns discovered this round (placeholder VCLOCK
	/// trees should be created for these by the caller/orchestrator).
	pub new_columns: Vec<Uuid>,
}

/// Run one round: contact the peer, reconcile every reported path, ship
/// the bytes any outcome needs, and apply the resulting Path Store ops.
///
/// `addr` is the peer's RPC (`route_port`) address; `transfer_addr` is its
/// data (`data_port`) address, a separate connection per §3's Device fields.
#[allow(clippy::too_many_arguments)]
pub async fn run_round(
	addr: &str,
	transfer_addr: &str,
	config: &SessionConfig,
	path_store: &PathStore,
	local_columns: &mut Vec<Uuid>,
	since_usn: u64,
	modifier: &str,
	time_stamp: u64,
	monitor: &Arc<dyn TaskMonitor>,
	history: &HistorySink,
) -> Result<SessionOutcome, ZiError> {
	let request = FindRequest {
		since_usn,
		limit: FIND_LIMIT,
		local_tree_uuid: config.local_tree_uuid,
		remote_tree_uuid: config.remote_tree_uuid,
		sync_uuid: config.sync_uuid,
	};

	let reply = match rpc::call(addr, Message::Find(request)).await? {
		Message::FindReply(reply) => reply,
		_ => {
			return Err(ZiError::Session(SessionError::SyncUuidMismatch {
				expected: config.sync_uuid.to_string(),
				got: "non-Find reply".to_string(),
			}))
		}
	};

	if reply.uuids.first() != Some(&config.remote_tree_uuid) {
		return Err(ZiError::Session(SessionError::SyncUuidMismatch {
			expected: config.remote_tree_uuid.to_string(),
			got: reply.uuids.first().map(|u| u.to_string()).unwrap_or_default(),
		}));
	}

	reconcile_reply(
		transfer_addr,
		config,
		path_store,
		local_columns,
		reply,
		modifier,
		time_stamp,
		monitor,
		history,
	)
	.await
}

#[allow(clippy::too_many_arguments)]
async fn reconcile_reply(
	transfer_addr: &str,
	config: &SessionConfig,
	path_store: &PathStore,
	local_columns: &mut Vec<Uuid>,
	reply: FindReply,
	modifier: &str,
	time_stamp: u64,
	monitor: &Arc<dyn TaskMonitor>,
	history: &HistorySink,
) -> Result<SessionOutcome, ZiError> {
	let mut outcome = SessionOutcome::default();
	let should_continue = reply.stats.len() >= FIND_LIMIT;
	let mut decisions = Vec::with_capacity(reply.stats.len());

	for stat in &reply.stats {
		let remapped = vclock::remap(&stat.vclock, &reply.uuids, local_columns)?;
		for new_col in &remapped.new_columns {
			if !local_columns.contains(new_col) {
				local_columns.push(*new_col);
				outcome.new_columns.push(*new_col);
			}
		}

		let mut remote_record = stat.record.clone();
		remote_record.local_vclock = remapped.local_clock.first().copied().unwrap_or(0);
		remote_record.remote_vclock = remapped.local_clock.get(1..).unwrap_or(&[]).to_vec();
		if remote_record.usn > outcome.last_seen_remote_usn {
			outcome.last_seen_remote_usn = remote_record.usn;
		}

		let local_record = path_store.get(&stat.path)?;
		let ctx = ReconcileCtx {
			local_tree_uuid: &config.local_tree_uuid,
			remote_tree_uuid: &config.remote_tree_uuid,
			is_rdonly: config.is_rdonly,
			is_backup_dst: config.is_backup_dst,
			is_backup_src: config.is_backup_src,
		};
		let action = reconciler::reconcile(local_record.as_ref(), &remote_record, &ctx);
		decisions.push((stat.clone(), local_record, remote_record, action));
	}

	let task_id = time_stamp;
	let mut temp_paths = std::collections::HashMap::new();
	let mut items = Vec::new();
	for (stat, _, remote_record, action) in &decisions {
		if action.needs_fetch() {
			let temp_path = config.tree_root.join(format!(".zstm-{}", Uuid::new_v4()));
			items.push(TransferItem {
				remote_path: stat.path.clone(),
				local_temp_path: temp_path.to_string_lossy().into_owned(),
				length: remote_record.length.unwrap_or(0),
				expected_hash: remote_record.sha1.clone().unwrap_or_default(),
			});
			temp_paths.insert(stat.path.clone(), temp_path);
		}
	}

	if !items.is_empty() {
		let task = TransferTask { items };
		let results = transfer::client::run_task(
			task_id,
			transfer_addr,
			config.remote_tree_uuid,
			&task,
			monitor,
		)
		.await?;
		let failed: std::collections::HashSet<String> = results
			.into_iter()
			.filter(|(_, outcome)| matches!(outcome, transfer::ItemOutcome::Failed { .. }))
			.map(|(path, _)| path)
			.collect();
		decisions.retain(|(stat, ..)| !failed.contains(&stat.path));
	}

	for (stat, local_record, remote_record, action) in decisions {
		let temp_path = temp_paths.get(&stat.path);
		match apply_action(&config.tree_root, path_store, local_record.as_ref(), &remote_record, &action, temp_path.map(|p| p.as_path()), modifier, time_stamp, history) {
			Ok(applied) => {
				if applied {
					outcome.applied += 1;
				}
				if matches!(action, Action::Conflict { .. }) {
					outcome.conflicts += 1;
				}
			}
			Err(e) => {
				tracing::warn!(path = %stat.path, error = %e, "failed to apply session action; will retry next round");
			}
		}
	}

	outcome.should_continue = should_continue;
	Ok(outcome)
}

/// Execute one reconciled [`Action`] against the filesystem and the Path
/// Store. Returns whether anything was actually applied.
#[allow(clippy::too_many_arguments)]
fn apply_action(
	tree_root: &Path,
	path_store: &PathStore,
	local: Option<&FileRecord>,
	remote: &FileRecord,
	action: &Action,
	fetched_temp_path: Option<&Path>,
	modifier: &str,
	time_stamp: u64,
	history: &HistorySink,
) -> Result<bool, ZiError> {
	let path = remote.path.clone();
	let full_path = tree_root.join(&path);

	match action {
		Action::NoOp => Ok(false),

		Action::UpdateVClockOnly { vclock } => {
			apply_vclock_only(path_store, local, remote, vclock, modifier, time_stamp)?;
			Ok(true)
		}

		Action::Suppressed { vclock } => {
			apply_vclock_only(path_store, local, remote, vclock, modifier, time_stamp)?;
			Ok(true)
		}

		Action::CreateFile { vclock } | Action::ReplaceDataUpdateMeta { vclock } => {
			let temp = fetched_temp_path
				.ok_or_else(|| reconcile_failed(&path, "missing fetched bytes"))?;
			install_fetched_file(temp, &full_path, remote)?;
			upsert_record(path_store, local, remote, &path, RecordStatus::Normal, EntryType::File, vclock.clone(), modifier, time_stamp)?;
			Ok(true)
		}

		Action::Mkdir => {
			if let Some(local) = local {
				if local.ty == EntryType::File {
					std::fs::remove_file(&full_path).ok();
				}
			}
			std::fs::create_dir_all(&full_path)?;
			let vclock = remote.vclock();
			upsert_record(path_store, local, remote, &path, RecordStatus::Normal, EntryType::Dir, vclock, modifier, time_stamp)?;
			Ok(true)
		}

		Action::Tombstone { vclock } => {
			remove_path_best_effort(&full_path);
			upsert_record(path_store, local, remote, &path, RecordStatus::Remove, remote.ty, vclock.clone(), modifier, time_stamp)?;
			Ok(true)
		}

		Action::DeleteFileMkdir { vclock } | Action::DeleteDirWriteFile { vclock } => {
			remove_path_best_effort(&full_path);
			if let Some(temp) = fetched_temp_path {
				install_fetched_file(temp, &full_path, remote)?;
				upsert_record(path_store, local, remote, &path, RecordStatus::Normal, EntryType::File, vclock.clone(), modifier, time_stamp)?;
			} else {
				std::fs::create_dir_all(&full_path)?;
				upsert_record(path_store, local, remote, &path, RecordStatus::Normal, EntryType::Dir, vclock.clone(), modifier, time_stamp)?;
			}
			Ok(true)
		}

		Action::DeleteFile { vclock } => {
			remove_path_best_effort(&full_path);
			upsert_record(path_store, local, remote, &path, RecordStatus::Remove, remote.ty, vclock.clone(), modifier, time_stamp)?;
			Ok(true)
		}

		Action::RemoveSubtree { .. } => {
			// `remove_subtree` tombstones the directory row itself plus every
			// descendant in one batch; it stamps fresh usns but does not carry
			// the reconciler's merged vclock onto descendants, which is an
			// accepted simplification (see DESIGN.md).
			remove_path_best_effort(&full_path);
			path_store.remove_subtree(&path, modifier, time_stamp)?;
			Ok(true)
		}

		Action::MetaMerge { vclock } => {
			upsert_record(path_store, local, remote, &path, RecordStatus::Normal, remote.ty, vclock.clone(), modifier, time_stamp)?;
			Ok(true)
		}

		Action::FetchAndCreate { vclock } => {
			let temp = fetched_temp_path
				.ok_or_else(|| reconcile_failed(&path, "missing fetched bytes"))?;
			install_fetched_file(temp, &full_path, remote)?;
			upsert_record(path_store, local, remote, &path, RecordStatus::Normal, EntryType::File, vclock.clone(), modifier, time_stamp)?;
			Ok(true)
		}

		Action::Conflict { winner_is_local, conflict_path: _, vclock } => {
			let exists = |candidate: &str| tree_root.join(candidate).exists();
			let conflict_name = reconciler::conflict_name(&path, exists)?;
			let conflict_full_path = tree_root.join(&conflict_name);

			if *winner_is_local {
				// local bytes stay at `path`; remote (loser) bytes land at
				// the conflict name, fetched from the peer.
				if let Some(temp) = fetched_temp_path {
					install_fetched_file(temp, &conflict_full_path, remote)?;
				}
				path_store.apply_batch(
					vec![PathOp::Insert(conflict_record(&conflict_name, remote))],
					modifier,
					time_stamp,
				)?;
				upsert_record(path_store, local, remote, &path, local.map(|l| l.status).unwrap_or(RecordStatus::Normal), local.map(|l| l.ty).unwrap_or(remote.ty), vclock.clone(), modifier, time_stamp)?;
			} else {
				// remote wins at `path`; local (loser) bytes are renamed aside.
				if full_path.exists() {
					std::fs::rename(&full_path, &conflict_full_path).ok();
				}
				if let Some(local) = local {
					path_store.apply_batch(
						vec![PathOp::Insert(conflict_record(&conflict_name, local))],
						modifier,
						time_stamp,
					)?;
				}
				if let Some(temp) = fetched_temp_path {
					install_fetched_file(temp, &full_path, remote)?;
				}
				upsert_record(path_store, local, remote, &path, RecordStatus::Normal, remote.ty, vclock.clone(), modifier, time_stamp)?;
			}
			history.content_store.append_history(&HistoryEntry {
				modifier: modifier.to_string(),
				tree_id: history.tree_uuid,
				backup_type: history.backup_type,
				time_stamp,
				path: path.clone(),
				code: HistoryCode::Conflict,
				rename_target: Some(conflict_name),
			})?;
			Ok(true)
		}
	}
}

fn reconcile_failed(path: &str, message: &str) -> ZiError {
	ZiError::Reconcile(crate::error::ReconcileError::FetchCreateFailed {
		path: path.to_string(),
		message: message.to_string(),
	})
}

fn install_fetched_file(temp: &Path, dest: &Path, remote: &FileRecord) -> Result<(), ZiError> {
	if let Some(parent) = dest.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let mtime = filetime::FileTime::from_unix_time(remote.mtime, 0);
	filetime::set_file_mtime(temp, mtime).ok();
	std::fs::rename(temp, dest)?;
	Ok(())
}

fn remove_path_best_effort(path: &Path) {
	if path.is_dir() {
		std::fs::remove_dir_all(path).ok();
	} else {
		std::fs::remove_file(path).ok();
	}
}

fn apply_vclock_only(
	path_store: &PathStore,
	local: Option<&FileRecord>,
	remote: &FileRecord,
	vclock: &[i32],
	modifier: &str,
	time_stamp: u64,
) -> Result<(), ZiError> {
	let status = local.map(|l| l.status).unwrap_or(remote.status);
	let ty = local.map(|l| l.ty).unwrap_or(remote.ty);
	upsert_record(path_store, local, remote, &remote.path, status, ty, vclock.to_vec(), modifier, time_stamp)
}

fn upsert_record(
	path_store: &PathStore,
	local: Option<&FileRecord>,
	remote: &FileRecord,
	path: &str,
	status: RecordStatus,
	ty: EntryType,
	vclock: Vec<i32>,
	modifier: &str,
	time_stamp: u64,
) -> Result<(), ZiError> {
	let local_vclock = vclock.first().copied().unwrap_or(0);
	let remote_vclock = vclock.get(1..).unwrap_or(&[]).to_vec();

	let op = match local {
		Some(existing) => PathOp::Update {
			id: existing.id,
			expected_usn: existing.usn,
			record: FileRecord {
				id: existing.id,
				path: path.to_string(),
				ty,
				status,
				mtime: remote.mtime,
				length: if status == RecordStatus::Remove { None } else { remote.length },
				usn: existing.usn,
				sha1: if status == RecordStatus::Remove { None } else { remote.sha1.clone() },
				attrs: remote.attrs.clone(),
				local_vclock,
				remote_vclock,
				modifier: modifier.to_string(),
				time_stamp,
			},
		},
		None => PathOp::Insert(FileRecord {
			id: next_local_id(),
			path: path.to_string(),
			ty,
			status,
			mtime: remote.mtime,
			length: if status == RecordStatus::Remove { None } else { remote.length },
			usn: 0,
			sha1: if status == RecordStatus::Remove { None } else { remote.sha1.clone() },
			attrs: remote.attrs.clone(),
			local_vclock,
			remote_vclock,
			modifier: modifier.to_string(),
			time_stamp,
		}),
	};

	let outcomes = path_store.apply_batch(vec![op], modifier, time_stamp)?;
	if matches!(outcomes.first(), Some(crate::store::path_store::ApplyOutcome::Skipped)) {
		return Err(ZiError::Store(crate::error::StoreError::PreconditionFailed {
			id: local.map(|l| l.id).unwrap_or(0),
			expected_usn: local.map(|l| l.usn).unwrap_or(0),
		}));
	}
	Ok(())
}

fn conflict_record(conflict_path: &str, origin: &FileRecord) -> FileRecord {
	FileRecord {
		id: next_local_id(),
		path: conflict_path.to_string(),
		ty: origin.ty,
		status: RecordStatus::Normal,
		mtime: origin.mtime,
		length: origin.length,
		usn: 0,
		sha1: origin.sha1.clone(),
		attrs: origin.attrs.clone(),
		local_vclock: 1,
		remote_vclock: vec![],
		modifier: String::new(),
		time_stamp: 0,
	}
}

/// Ids for rows created by the session (inserts arriving from a peer) are
/// allocated from a process-local counter distinct from the scanner's,
/// since the authoritative identity is the `path` key, not `id`.
fn next_local_id() -> u64 {
	use std::sync::atomic::{AtomicU64, Ordering};
	static COUNTER: AtomicU64 = AtomicU64::new(1);
	COUNTER.fetch_add(1, Ordering::SeqCst)
}


// vim: ts=4
