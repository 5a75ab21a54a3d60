//! Given a local/remote `FileRecord` pair for the same path, decide the one
//! outcome that applies and describe the filesystem + Path Store mutation it
//! requires.
//!
//! Grounded on `conflict/resolver.rs`'s strategy-dispatch idiom (one function
//! per resolution path) and `metadata/reconciliation.rs`'s mode-driven
//! comparison, but the actual decision here is the vector-clock + 9-bit
//! classification table from the outcome table, not a configurable strategy.

use uuid::Uuid;

use crate::error::ReconcileError;
use crate::types::{EntryType, FileRecord, RecordStatus};
use crate::vclock;

/// Nine-bit classification of one side of a path: which kind of entry is
/// there, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Class {
	Absent,
	FileNormal,
	FileRemove,
	DirNormal,
	DirRemove,
}

fn classify(record: Option<&FileRecord>) -> Class {
	match record {
		None => Class::Absent,
		Some(r) => match (r.ty, r.status) {
			(EntryType::File, RecordStatus::Normal) => Class::FileNormal,
			(EntryType::File, RecordStatus::Remove) => Class::FileRemove,
			(EntryType::Dir, RecordStatus::Normal) => Class::DirNormal,
			(EntryType::Dir, RecordStatus::Remove) => Class::DirRemove,
		},
	}
}

/// Static facts about the local tree and the sync it belongs to, needed to
/// apply the RDONLY/BACKUP clamping and asymmetry rules.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileCtx<'a> {
	pub local_tree_uuid: &'a Uuid,
	pub remote_tree_uuid: &'a Uuid,
	pub is_rdonly: bool,
	pub is_backup_dst: bool,
	pub is_backup_src: bool,
}

/// The decided outcome of reconciling one path.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
	/// Remote is stale; nothing to do.
	NoOp,
	/// Store the merged vclock but make no filesystem change (RDONLY/
	/// BACKUP_DST receive, or the FR/DR x FR/DR "noop" cells).
	UpdateVClockOnly { vclock: Vec<i32> },
	CreateFile { vclock: Vec<i32> },
	Mkdir { vclock: Vec<i32> },
	Tombstone { vclock: Vec<i32> },
	ReplaceDataUpdateMeta { vclock: Vec<i32> },
	DeleteFileMkdir { vclock: Vec<i32> },
	DeleteFile { vclock: Vec<i32> },
	DeleteDirWriteFile { vclock: Vec<i32> },
	MetaMerge { vclock: Vec<i32> },
	RemoveSubtree { vclock: Vec<i32> },
	FetchAndCreate { vclock: Vec<i32> },
	/// Concurrent edit. `winner_is_local` tells which side's bytes stay at
	/// the original path; the other side's bytes land at `conflict_path`.
	Conflict { winner_is_local: bool, conflict_path: String, vclock: Vec<i32> },
	/// An outcome that would mutate the filesystem was suppressed because
	/// the local tree is RDONLY, BACKUP_DST (receive clamp), or because the
	/// sync is a BACKUP and the asymmetry rule forbids it on this side.
	Suppressed { vclock: Vec<i32> },
}

impl Action {
	/// Whether executing this action requires fetching remote bytes first.
	pub fn needs_fetch(&self) -> bool {
		matches!(
			self,
			Action::CreateFile { .. }
				| Action::ReplaceDataUpdateMeta { .. }
				| Action::DeleteDirWriteFile { .. }
				| Action::FetchAndCreate { .. }
				| Action::Conflict { .. }
		)
	}
}

fn outcome_table(local: Class, remote: Class) -> fn(Vec<i32>) -> Action {
	use Class::*;
	match (local, remote) {
		(Absent, FileNormal) => Action::CreateFile,
		(Absent, DirNormal) => Action::Mkdir,
		(Absent, FileRemove) => Action::Tombstone,
		(Absent, DirRemove) => Action::Tombstone,

		(FileNormal, FileNormal) => Action::ReplaceDataUpdateMeta,
		(FileNormal, DirNormal) => Action::DeleteFileMkdir,
		(FileNormal, FileRemove) => Action::DeleteFile,
		(FileNormal, DirRemove) => Action::DeleteFile,

		(DirNormal, FileNormal) => Action::DeleteDirWriteFile,
		(DirNormal, DirNormal) => Action::MetaMerge,
		(DirNormal, FileRemove) => Action::RemoveSubtree,
		(DirNormal, DirRemove) => Action::RemoveSubtree,

		(FileRemove, FileNormal) => Action::FetchAndCreate,
		(FileRemove, DirNormal) => Action::Mkdir,
		(FileRemove, FileRemove) => Action::UpdateVClockOnly,
		(FileRemove, DirRemove) => Action::UpdateVClockOnly,

		(DirRemove, FileNormal) => Action::FetchAndCreate,
		(DirRemove, DirNormal) => Action::Mkdir,
		(DirRemove, FileRemove) => Action::UpdateVClockOnly,
		(DirRemove, DirRemove) => Action::UpdateVClockOnly,

		// remote absent never reaches the reconciler in practice (there is
		// no record to reconcile against); treat it as a no-op.
		(_, Absent) => |_| Action::NoOp,
	}
}

/// Suffix determinism: smallest `N >= 1` making `<stem>.conflict[.N][.ext]`
/// unused, probed via `exists`.
pub fn conflict_name(path: &str, exists: impl Fn(&str) -> bool) -> Result<String, ReconcileError> {
	let (stem, ext) = match path.rfind('.') {
		Some(idx) if idx > path.rfind('/').map(|s| s + 1).unwrap_or(0) => {
			(&path[..idx], Some(&path[idx + 1..]))
		}
		_ => (path, None),
	};

	let bare = match ext {
		Some(e) => format!("{}.conflict.{}", stem, e),
		None => format!("{}.conflict", stem),
	};
	if !exists(&bare) {
		return Ok(bare);
	}
	for n in 1..10_000u32 {
		let candidate = match ext {
			Some(e) => format!("{}.conflict.{}.{}", stem, n, e),
			None => format!("{}.conflict.{}", stem, n),
		};
		if !exists(&candidate) {
			return Ok(candidate);
		}
	}
	Err(ReconcileError::ConflictNameExhausted { path: path.to_string() })
}

/// Decide the outcome for one path given its local and remote records.
/// `remote` must be present; `local` may be absent.
pub fn reconcile(
	local: Option<&FileRecord>,
	remote: &FileRecord,
	ctx: &ReconcileCtx,
) -> Action {
	let local_vc = local.map(|r| r.vclock()).unwrap_or_default();
	let remote_vc = remote.vclock();

	match vclock::compare(&remote_vc, &local_vc) {
		vclock::Ordering::Less => Action::NoOp,
		vclock::Ordering::Equal => {
			let merged = vclock::merge(&local_vc, &remote_vc);
			// Equal clocks but diverging metadata still needs a merge pass;
			// callers compare fields themselves and may downgrade this to
			// NoOp if nothing actually diverged.
			Action::MetaMerge { vclock: merged }
		}
		vclock::Ordering::Greater => {
			let merged = vclock::merge(&local_vc, &remote_vc);
			let local_class = classify(local);
			let remote_class = classify(Some(remote));
			let build = outcome_table(local_class, remote_class);
			let action = build(merged.clone());
			apply_clamping(action, ctx, merged)
		}
		vclock::Ordering::Concurrent => {
			let merged = vclock::merge(&local_vc, &remote_vc);
			let winner_is_local = ctx.local_tree_uuid > ctx.remote_tree_uuid;
			// conflict_path is resolved by the caller (it needs filesystem
			// access to probe for an unused name); a placeholder based on
			// the bare path is filled in here and replaced by the session.
			Action::Conflict {
				winner_is_local,
				conflict_path: remote.path.clone(),
				vclock: merged,
			}
		}
	}
}

/// RDONLY trees never issue outgoing filesystem writes (vclock still
/// advances). BACKUP_DST trees receive-only with vclock clamped to zero.
/// BACKUP asymmetry suppresses deletes/inserts the source should never
/// receive from the destination.
fn apply_clamping(action: Action, ctx: &ReconcileCtx, merged: Vec<i32>) -> Action {
	if ctx.is_backup_src {
		// the source of a BACKUP sync never accepts mutations pushed from
		// the destination: no deletes-due-to-absence, no inserts.
		match &action {
			Action::DeleteFile { .. }
			| Action::DeleteFileMkdir { .. }
			| Action::DeleteDirWriteFile { .. }
			| Action::RemoveSubtree { .. }
			| Action::CreateFile { .. }
			| Action::Mkdir { .. }
			| Action::FetchAndCreate { .. } => return Action::Suppressed { vclock: merged },
			_ => {}
		}
	}

	if ctx.is_rdonly {
		return match action {
			Action::NoOp | Action::UpdateVClockOnly { .. } | Action::Conflict { .. } => action,
			_ => Action::UpdateVClockOnly { vclock: merged },
		};
	}

	if ctx.is_backup_dst {
		// receive-only, same as RDONLY, but vclock is clamped to zero
		// instead of merged (local_vclock forced to 0, remote cleared).
		return match action {
			Action::NoOp => action,
			_ => Action::UpdateVClockOnly { vclock: vec![0; merged.len()] },
		};
	}

	action
}


// vim: ts=4
