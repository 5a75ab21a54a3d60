//! Walks a tree root, merge-joins against its Path Store, and stages the
//! ops the merge-join requires. Grounded on `cache.rs`'s mtime-based
//! invalidation idiom, generalized from a single flat cache table to the
//! full merge-join against [`crate::store::path_store::PathStore`].

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use uuid::Uuid;

use crate::error::ZiError;
use crate::store::content_store::ContentStore;
use crate::store::path_store::{ApplyOutcome, PathOp, PathStore};
use crate::types::{
	BackupType, EntryType, FileRecord, HistoryCode, HistoryEntry, PlatformAttrs, RecordStatus,
};

/// Target platform, for the mtime/attr comparison quirks in §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
	Linux,
	MacOs,
	Windows,
	Android,
	Ios,
}

impl Platform {
	/// The platform this binary was built for.
	pub fn current() -> Self {
		if cfg!(target_os = "android") {
			Platform::Android
		} else if cfg!(target_os = "ios") {
			Platform::Ios
		} else if cfg!(target_os = "macos") {
			Platform::MacOs
		} else if cfg!(target_os = "windows") {
			Platform::Windows
		} else {
			Platform::Linux
		}
	}
}

/// Reserved sync metadata paths are never scanned or watched.
pub fn is_reserved_metadata_path(basename: &str) -> bool {
	basename == ".zisync.meta" || basename.starts_with(".zstm")
}

struct WalkEntry {
	rel_path: String,
	ty: EntryType,
	mtime: i64,
	length: Option<u64>,
	attrs: PlatformAttrs,
}

/// Read the platform-specific permission bits for `metadata`, filed under
/// whichever `PlatformAttrs` column matches the platform we're running on.
/// Peers on other platforms carry the value through untouched.
fn attrs_of(metadata: &fs::Metadata) -> PlatformAttrs {
	#[cfg(unix)]
	{
		use std::os::unix::fs::PermissionsExt;
		PlatformAttrs { unix_attr: Some(metadata.permissions().mode()), win_attr: None, android_attr: None }
	}
	#[cfg(windows)]
	{
		let readonly = metadata.permissions().readonly();
		PlatformAttrs { unix_attr: None, win_attr: Some(readonly as u32), android_attr: None }
	}
	#[cfg(not(any(unix, windows)))]
	{
		let _ = metadata;
		PlatformAttrs::default()
	}
}

fn walk_sorted(root: &Path) -> Result<Vec<WalkEntry>, ZiError> {
	let mut out = Vec::new();
	walk_dir(root, root, &mut out)?;
	out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
	Ok(out)
}

fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<WalkEntry>) -> Result<(), ZiError> {
	let mut children: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
	children.sort_by_key(|e| e.file_name());

	for entry in children {
		let path = entry.path();
		let basename = entry.file_name();
		let basename = basename.to_string_lossy();
		if is_reserved_metadata_path(&basename) {
			continue;
		}
		let metadata = entry.metadata()?;
		let rel_path = path
			.strip_prefix(root)
			.unwrap_or(&path)
			.to_string_lossy()
			.replace(std::path::MAIN_SEPARATOR, "/");

		if metadata.is_dir() {
			out.push(WalkEntry {
				rel_path: rel_path.clone(),
				ty: EntryType::Dir,
				mtime: mtime_of(&metadata),
				length: None,
				attrs: attrs_of(&metadata),
			});
			walk_dir(root, &path, out)?;
		} else if metadata.is_file() {
			out.push(WalkEntry {
				rel_path,
				ty: EntryType::File,
				mtime: mtime_of(&metadata),
				length: Some(metadata.len()),
				attrs: attrs_of(&metadata),
			});
		}
	}
	Ok(())
}

fn mtime_of(metadata: &fs::Metadata) -> i64 {
	metadata
		.modified()
		.ok()
		.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}

fn hash_file(path: &Path) -> Result<String, ZiError> {
	let bytes = fs::read(path).map_err(|e| ZiError::Sha1Fail { path: path.display().to_string(), source: e })?;
	Ok(crate::util::hash(&bytes))
}

/// Whether an mtime/attr-only difference should be ignored for this
/// platform, per the quirks in §4.3: Android/iOS ignore bare mtime drift,
/// Android additionally ignores bare attribute drift.
fn platform_ignores_mtime_only_diff(platform: Platform) -> bool {
	matches!(platform, Platform::Android | Platform::Ios)
}

fn platform_ignores_attr_only_diff(platform: Platform) -> bool {
	matches!(platform, Platform::Android)
}

/// Tree-level facts the scan needs beyond the raw walk.
#[derive(Debug, Clone, Copy)]
pub struct ScanConfig {
	pub platform: Platform,
	pub is_rdonly: bool,
	pub is_backup_dst: bool,
}

/// Result of one scan pass: the ops it staged and whether it actually ran
/// (a failed hash re-queues the affected path rather than aborting the scan).
#[derive(Debug, Default)]
pub struct ScanReport {
	pub applied: usize,
	pub skipped: usize,
	pub requeue: Vec<String>,
}

/// Where a [`refresh`] records the history entries its mutations imply.
pub struct HistorySink<'a> {
	pub content_store: &'a ContentStore,
	pub tree_uuid: Uuid,
	pub backup_type: BackupType,
}

/// One path-level change staged by the merge-join, tracked alongside its
/// [`PathOp`] so a rename can be folded out of a matching delete+insert pair
/// after `apply_batch` confirms both sides actually landed.
struct StagedChange {
	path: String,
	code: HistoryCode,
	ty: EntryType,
	sha1: Option<String>,
	length: Option<u64>,
}

/// Full refresh: walk `tree_root`, merge-join against `store`, stage and
/// apply the ops the merge-join implies, then record history for what landed.
pub fn refresh(
	tree_root: &Path,
	store: &PathStore,
	modifier: &str,
	time_stamp: u64,
	config: &ScanConfig,
	history: &HistorySink,
) -> Result<ScanReport, ZiError> {
	let fs_entries = walk_sorted(tree_root)?;
	let db_entries = store.list_all()?;

	let mut report = ScanReport::default();
	let mut ops = Vec::new();
	let mut staged = Vec::new();

	let mut fi = 0usize;
	let mut di = 0usize;
	while fi < fs_entries.len() || di < db_entries.len() {
		// Tombstoned rows never participate in the comparison; skip `di`
		// forward over them independently so a tombstone sorting before a
		// live path can never strand the cursor.
		while db_entries.get(di).is_some_and(|r| !matches!(r.status, RecordStatus::Normal)) {
			di += 1;
		}

		let fs_next = fs_entries.get(fi);
		let db_next = db_entries.get(di);

		match (fs_next, db_next) {
			(Some(f), Some(d)) if f.rel_path == d.path => {
				if let Some(op) = diff_update(f, d, tree_root, config)? {
					staged.push(StagedChange {
						path: f.rel_path.clone(),
						code: HistoryCode::Update,
						ty: f.ty,
						sha1: op_sha1(&op),
						length: op_length(&op),
					});
					ops.push(op);
				}
				fi += 1;
				di += 1;
			}
			(Some(f), Some(d)) if f.rel_path < d.path => {
				match stage_insert(f, tree_root) {
					Ok(op) => {
						staged.push(StagedChange {
							path: f.rel_path.clone(),
							code: HistoryCode::Insert,
							ty: f.ty,
							sha1: op_sha1(&op),
							length: op_length(&op),
						});
						ops.push(op);
					}
					Err(_) => report.requeue.push(f.rel_path.clone()),
				}
				fi += 1;
			}
			(Some(f), None) => {
				match stage_insert(f, tree_root) {
					Ok(op) => {
						staged.push(StagedChange {
							path: f.rel_path.clone(),
							code: HistoryCode::Insert,
							ty: f.ty,
							sha1: op_sha1(&op),
							length: op_length(&op),
						});
						ops.push(op);
					}
					Err(_) => report.requeue.push(f.rel_path.clone()),
				}
				fi += 1;
			}
			(_, Some(d)) => {
				staged.push(StagedChange {
					path: d.path.clone(),
					code: HistoryCode::Delete,
					ty: d.ty,
					sha1: d.sha1.clone(),
					length: d.length,
				});
				ops.push(PathOp::Delete { id: d.id, expected_usn: d.usn });
				di += 1;
			}
			(None, None) => break,
		}
	}

	let outcomes = store.apply_batch(ops, modifier, time_stamp)?;
	let mut applied = Vec::with_capacity(staged.len());
	for (outcome, change) in outcomes.into_iter().zip(staged.into_iter()) {
		match outcome {
			ApplyOutcome::Applied { .. } => {
				report.applied += 1;
				applied.push(change);
			}
			ApplyOutcome::Skipped => report.skipped += 1,
		}
	}

	for entry in fold_renames(applied) {
		history.content_store.append_history(&HistoryEntry {
			modifier: modifier.to_string(),
			tree_id: history.tree_uuid,
			backup_type: history.backup_type,
			time_stamp,
			path: entry.0,
			code: entry.1,
			rename_target: entry.2,
		})?;
	}

	Ok(report)
}

fn op_sha1(op: &PathOp) -> Option<String> {
	match op {
		PathOp::Insert(r) | PathOp::Update { record: r, .. } => r.sha1.clone(),
		PathOp::Delete { .. } => None,
	}
}

fn op_length(op: &PathOp) -> Option<u64> {
	match op {
		PathOp::Insert(r) | PathOp::Update { record: r, .. } => r.length,
		PathOp::Delete { .. } => None,
	}
}

/// Combine a delete and an insert of the same file content into one RENAME
/// history entry, matching on sha1 (and length, as a cheap extra check
/// against accidental collisions). Everything left over keeps its plain
/// Insert/Update/Delete code.
fn fold_renames(changes: Vec<StagedChange>) -> Vec<(String, HistoryCode, Option<String>)> {
	let mut deletes = Vec::new();
	let mut inserts = Vec::new();
	for (i, c) in changes.iter().enumerate() {
		if c.ty != EntryType::File || c.sha1.is_none() {
			continue;
		}
		match c.code {
			HistoryCode::Delete => deletes.push(i),
			HistoryCode::Insert => inserts.push(i),
			_ => {}
		}
	}

	let mut paired = HashSet::new();
	let mut renames = Vec::new();
	for &di in &deletes {
		if let Some(pos) = inserts
			.iter()
			.position(|&ii| !paired.contains(&ii) && changes[ii].sha1 == changes[di].sha1 && changes[ii].length == changes[di].length)
		{
			let ii = inserts[pos];
			paired.insert(di);
			paired.insert(ii);
			renames.push((changes[di].path.clone(), HistoryCode::Rename, Some(changes[ii].path.clone())));
		}
	}

	let mut out = renames;
	for (i, c) in changes.into_iter().enumerate() {
		if paired.contains(&i) {
			continue;
		}
		out.push((c.path, c.code, None));
	}
	out
}

fn stage_insert(entry: &WalkEntry, tree_root: &Path) -> Result<PathOp, ZiError> {
	let sha1 = if entry.ty == EntryType::File {
		Some(hash_file(&tree_root.join(&entry.rel_path))?)
	} else {
		None
	};
	Ok(PathOp::Insert(FileRecord {
		id: 0,
		path: entry.rel_path.clone(),
		ty: entry.ty,
		status: RecordStatus::Normal,
		mtime: entry.mtime,
		length: entry.length,
		usn: 0,
		sha1,
		attrs: entry.attrs.clone(),
		local_vclock: 1,
		remote_vclock: vec![],
		modifier: String::new(),
		time_stamp: 0,
	}))
}

fn diff_update(
	fs_entry: &WalkEntry,
	db_entry: &FileRecord,
	tree_root: &Path,
	config: &ScanConfig,
) -> Result<Option<PathOp>, ZiError> {
	let type_changed = match (fs_entry.ty, db_entry.ty) {
		(a, b) if a == b => false,
		_ => true,
	};
	let mtime_changed = fs_entry.mtime != db_entry.mtime;
	let length_changed = fs_entry.length != db_entry.length;

	let mtime_meaningfully_changed = mtime_changed && !platform_ignores_mtime_only_diff(config.platform);
	let mut meta_changed = type_changed || mtime_meaningfully_changed || length_changed;

	let attrs_changed = fs_entry.attrs != db_entry.attrs;
	if attrs_changed && !platform_ignores_attr_only_diff(config.platform) {
		meta_changed = true;
	}

	if !meta_changed {
		return Ok(None);
	}

	let sha1 = if fs_entry.ty == EntryType::File
		&& (type_changed || mtime_changed || length_changed)
	{
		Some(hash_file(&tree_root.join(&fs_entry.rel_path))?)
	} else {
		db_entry.sha1.clone()
	};

	if fs_entry.ty == EntryType::File
		&& sha1 == db_entry.sha1
		&& !type_changed
		&& fs_entry.attrs == db_entry.attrs
	{
		return Ok(None);
	}

	let (local_vclock, remote_vclock) = if config.is_backup_dst {
		(0, vec![])
	} else {
		(db_entry.local_vclock + 1, db_entry.remote_vclock.clone())
	};

	if config.is_rdonly {
		// the write is suppressed; only the vclock advances so we remember
		// having seen the change.
		return Ok(Some(PathOp::Update {
			id: db_entry.id,
			expected_usn: db_entry.usn,
			record: FileRecord { local_vclock, remote_vclock, ..db_entry.clone() },
		}));
	}

	Ok(Some(PathOp::Update {
		id: db_entry.id,
		expected_usn: db_entry.usn,
		record: FileRecord {
			ty: fs_entry.ty,
			status: RecordStatus::Normal,
			mtime: fs_entry.mtime,
			length: fs_entry.length,
			sha1,
			attrs: fs_entry.attrs.clone(),
			local_vclock,
			remote_vclock,
			..db_entry.clone()
		},
	}))
}


// vim: ts=4
