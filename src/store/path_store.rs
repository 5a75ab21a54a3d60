//! Per-tree Path Store: indexed `path -> FileRecord` with USN ordering.
//!
//! Grounded on `cache.rs`'s `ChildCache` table pattern: one redb database per
//! tree, one table keyed by path, bincode-encoded values. A secondary table
//! keyed by `usn` supports `query_since`'s range scan.

use redb::{ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::error::ZiError;
use crate::types::{FileRecord, RecordStatus};

const PATHS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("paths");
const BY_USN_TABLE: TableDefinition<u64, &str> = TableDefinition::new("by_usn");

/// Device-wide USN counter shared by every `PathStore` the `Orchestrator`
/// opens, per spec.md §9's "Global USN allocator" — a usn must be unique
/// across every tree database on the device, not just within one tree.
/// Standalone callers (tests, one-off tools) get a private allocator via
/// [`PathStore::open`]; the orchestrator seeds one allocator from
/// `max(usn)` over every tree db at startup and shares it across all the
/// `PathStore`s it opens via [`PathStore::open_with_allocator`].
pub struct UsnAllocator {
	next: AtomicU64,
}

impl UsnAllocator {
	pub fn new() -> Self {
		UsnAllocator { next: AtomicU64::new(1) }
	}

	fn alloc(&self) -> u64 {
		self.next.fetch_add(1, AtomicOrdering::SeqCst)
	}

	/// Raise the floor so the next `alloc` returns at least `floor`.
	pub fn bump_floor(&self, floor: u64) {
		self.next.fetch_max(floor.max(1), AtomicOrdering::SeqCst);
	}
}

impl Default for UsnAllocator {
	fn default() -> Self {
		Self::new()
	}
}

/// A staged mutation for [`PathStore::apply_batch`].
#[derive(Debug, Clone)]
pub enum PathOp {
	/// Insert a brand-new row. `record.id` must be non-zero and unused.
	Insert(FileRecord),
	/// Replace an existing row, gated by `(id, expected_usn)`.
	Update { id: u64, expected_usn: u64, record: FileRecord },
	/// Turn an existing row into a tombstone, gated by `(id, expected_usn)`.
	Delete { id: u64, expected_usn: u64 },
}

impl PathOp {
	fn path(&self) -> Option<&str> {
		match self {
			PathOp::Insert(r) => Some(&r.path),
			PathOp::Update { record, .. } => Some(&record.path),
			PathOp::Delete { .. } => None,
		}
	}
}

/// Outcome of one staged op within a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
	Applied { usn: u64 },
	/// The op's `(id, usn)` precondition did not hold; it alone was skipped.
	Skipped,
}

/// Per-tree file state store, backed by one redb database file.
pub struct PathStore {
	db: redb::Database,
	usn_allocator: Arc<UsnAllocator>,
}

impl PathStore {
	/// Open (or create) the store at `db_path` with its own private usn
	/// allocator, seeded from this store's own persisted high-water mark.
	/// Only safe when no sibling tree database on the same device is open
	/// at the same time (tests, one-off tools); the orchestrator instead
	/// uses [`PathStore::open_with_allocator`] with one allocator shared
	/// across every tree it manages.
	pub fn open(db_path: &Path) -> Result<Self, ZiError> {
		Self::open_with_allocator(db_path, Arc::new(UsnAllocator::new()))
	}

	/// Open (or create) the store at `db_path`, sharing `usn_allocator`
	/// with every other `PathStore` on the same device. Bumps the shared
	/// allocator's floor past this store's own persisted high-water mark,
	/// so reopening a tree db never hands out a usn it already used.
	pub fn open_with_allocator(
		db_path: &Path,
		usn_allocator: Arc<UsnAllocator>,
	) -> Result<Self, ZiError> {
		let db = redb::Database::create(db_path)?;
		{
			let write_txn = db.begin_write()?;
			{
				let _ = write_txn.open_table(PATHS_TABLE)?;
				let _ = write_txn.open_table(BY_USN_TABLE)?;
			}
			write_txn.commit()?;
		}
		let persisted_max = Self::max_usn_in(&db)?;
		usn_allocator.bump_floor(persisted_max + 1);
		Ok(PathStore { db, usn_allocator })
	}

	/// Highest usn ever committed in `db` (0 if empty), read directly off
	/// `BY_USN_TABLE` rather than any allocator state.
	fn max_usn_in(db: &redb::Database) -> Result<u64, ZiError> {
		let read_txn = db.begin_read()?;
		let by_usn = read_txn.open_table(BY_USN_TABLE)?;
		Ok(by_usn.iter()?.next_back().transpose()?.map(|(k, _)| k.value()).unwrap_or(0))
	}

	/// Highest usn ever committed in the tree database at `db_path`, without
	/// opening a full store or allocating an allocator for it. Used by the
	/// orchestrator to seed its shared allocator from every tree db at
	/// startup, per spec.md §9.
	pub fn persisted_max_usn(db_path: &Path) -> Result<u64, ZiError> {
		let db = redb::Database::create(db_path)?;
		{
			let write_txn = db.begin_write()?;
			{
				let _ = write_txn.open_table(PATHS_TABLE)?;
				let _ = write_txn.open_table(BY_USN_TABLE)?;
			}
			write_txn.commit()?;
		}
		Self::max_usn_in(&db)
	}

	/// Exact-match lookup.
	pub fn get(&self, path: &str) -> Result<Option<FileRecord>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(PATHS_TABLE)?;
		match table.get(path)? {
			Some(entry) => Ok(Some(super::decode(entry.value())?)),
			None => Ok(None),
		}
	}

	/// Records with `usn > usn_lower_bound`, ordered by usn ascending, capped
	/// at `limit`.
	pub fn query_since(
		&self,
		usn_lower_bound: u64,
		limit: usize,
	) -> Result<Vec<FileRecord>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let by_usn = read_txn.open_table(BY_USN_TABLE)?;
		let paths = read_txn.open_table(PATHS_TABLE)?;

		let mut out = Vec::new();
		for entry in by_usn.range((usn_lower_bound + 1)..)? {
			let (_, path) = entry?;
			let path = path.value();
			if let Some(row) = paths.get(path)? {
				out.push(super::decode::<FileRecord>(row.value())?);
			}
			if out.len() >= limit {
				break;
			}
		}
		Ok(out)
	}

	/// All rows in path order (redb's `&str` keys sort lexicographically on
	/// bytes, matching the scanner's filesystem walk order).
	pub fn list_all(&self) -> Result<Vec<FileRecord>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(PATHS_TABLE)?;
		let mut out = Vec::new();
		for entry in table.iter()? {
			let (_, v) = entry?;
			out.push(super::decode(v.value())?);
		}
		Ok(out)
	}

	/// Highest USN ever stamped (0 if the store is empty).
	pub fn max_usn(&self) -> u64 {
		Self::max_usn_in(&self.db).unwrap_or(0)
	}

	/// Apply a batch of ops atomically. Ops whose `(id, usn)` precondition
	/// fails are skipped individually; the rest of the batch still commits.
	/// `modifier` is stamped onto every successfully-applied record.
	pub fn apply_batch(
		&self,
		ops: Vec<PathOp>,
		modifier: &str,
		time_stamp: u64,
	) -> Result<Vec<ApplyOutcome>, ZiError> {
		let write_txn = self.db.begin_write()?;
		let mut outcomes = Vec::with_capacity(ops.len());
		{
			let mut paths = write_txn.open_table(PATHS_TABLE)?;
			let mut by_usn = write_txn.open_table(BY_USN_TABLE)?;

			for op in ops {
				let current_by_path = op
					.path()
					.map(|p| paths.get(p))
					.transpose()?
					.flatten()
					.map(|e| super::decode::<FileRecord>(e.value()))
					.transpose()?;

				let precondition_ok = match &op {
					PathOp::Insert(_) => current_by_path.is_none(),
					PathOp::Update { id, expected_usn, .. }
					| PathOp::Delete { id, expected_usn } => match &current_by_path {
						Some(existing) => existing.id == *id && existing.usn == *expected_usn,
						None => false,
					},
				};

				if !precondition_ok {
					outcomes.push(ApplyOutcome::Skipped);
					continue;
				}

				let usn = self.usn_allocator.alloc();

				let is_delete = matches!(op, PathOp::Delete { .. });
				let mut record = match op {
					PathOp::Insert(r) => r,
					PathOp::Update { record, .. } => record,
					PathOp::Delete { .. } => current_by_path.expect("precondition checked"),
				};

				if is_delete {
					record.status = RecordStatus::Remove;
					record.length = None;
					record.sha1 = None;
				}

				record.usn = usn;
				record.modifier = modifier.to_string();
				record.time_stamp = time_stamp;

				let encoded = super::encode(&record)?;
				paths.insert(record.path.as_str(), encoded.as_slice())?;
				by_usn.insert(usn, record.path.as_str())?;

				outcomes.push(ApplyOutcome::Applied { usn });
			}
		}
		write_txn.commit()?;
		Ok(outcomes)
	}

	/// Mark every NORMAL record whose path equals or starts with
	/// `prefix + "/"` as REMOVE, stamping fresh usns.
	pub fn remove_subtree(
		&self,
		prefix: &str,
		modifier: &str,
		time_stamp: u64,
	) -> Result<usize, ZiError> {
		let matches: Vec<FileRecord> = {
			let read_txn = self.db.begin_read()?;
			let paths = read_txn.open_table(PATHS_TABLE)?;
			let nested_prefix = format!("{}/", prefix);
			let mut matches = Vec::new();
			for entry in paths.iter()? {
				let (key, value) = entry?;
				let path = key.value();
				if path == prefix || path.starts_with(&nested_prefix) {
					let record: FileRecord = super::decode(value.value())?;
					if matches!(record.status, RecordStatus::Normal) {
						matches.push(record);
					}
				}
			}
			matches
		};

		let ops: Vec<PathOp> = matches
			.into_iter()
			.map(|r| PathOp::Delete { id: r.id, expected_usn: r.usn })
			.collect();
		let count = ops.len();
		self.apply_batch(ops, modifier, time_stamp)?;
		Ok(count)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::{EntryType, PlatformAttrs};
	use tempfile::TempDir;

	fn sample(id: u64, path: &str) -> FileRecord {
		FileRecord {
			id,
			path: path.to_string(),
			ty: EntryType::File,
			status: RecordStatus::Normal,
			mtime: 100,
			length: Some(4),
			usn: 0,
			sha1: Some("X".into()),
			attrs: PlatformAttrs::default(),
			local_vclock: 1,
			remote_vclock: vec![0],
			modifier: "A".into(),
			time_stamp: 100,
		}
	}

	#[test]
	fn insert_then_get() {
		let dir = TempDir::new().unwrap();
		let store = PathStore::open(&dir.path().join("t.db")).unwrap();
		let outcomes =
			store.apply_batch(vec![PathOp::Insert(sample(1, "a.txt"))], "A", 100).unwrap();
		assert_eq!(outcomes, vec![ApplyOutcome::Applied { usn: 1 }]);
		let got = store.get("a.txt").unwrap().unwrap();
		assert_eq!(got.usn, 1);
		assert_eq!(got.id, 1);
	}

	#[test]
	fn usn_is_strictly_increasing() {
		let dir = TempDir::new().unwrap();
		let store = PathStore::open(&dir.path().join("t.db")).unwrap();
		store.apply_batch(vec![PathOp::Insert(sample(1, "a.txt"))], "A", 100).unwrap();
		store.apply_batch(vec![PathOp::Insert(sample(2, "b.txt"))], "A", 101).unwrap();
		let a = store.get("a.txt").unwrap().unwrap();
		let b = store.get("b.txt").unwrap().unwrap();
		assert!(a.usn < b.usn);
		assert_eq!(store.max_usn(), b.usn);
	}

	#[test]
	fn update_precondition_failure_skips_only_that_op() {
		let dir = TempDir::new().unwrap();
		let store = PathStore::open(&dir.path().join("t.db")).unwrap();
		store.apply_batch(vec![PathOp::Insert(sample(1, "a.txt"))], "A", 100).unwrap();
		let current = store.get("a.txt").unwrap().unwrap();

		let mut stale_update = current.clone();
		stale_update.length = Some(999);
		let outcomes = store
			.apply_batch(
				vec![
					PathOp::Update {
						id: 1,
						expected_usn: current.usn + 99, // wrong
						record: stale_update,
					},
					PathOp::Insert(sample(2, "b.txt")),
				],
				"A",
				101,
			)
			.unwrap();
		assert_eq!(outcomes[0], ApplyOutcome::Skipped);
		assert!(matches!(outcomes[1], ApplyOutcome::Applied { .. }));
		// a.txt untouched, including its usn
		let unchanged = store.get("a.txt").unwrap().unwrap();
		assert_eq!(unchanged.usn, current.usn);
		assert_eq!(unchanged.length, current.length);
	}

	#[test]
	fn delete_leaves_a_tombstone() {
		let dir = TempDir::new().unwrap();
		let store = PathStore::open(&dir.path().join("t.db")).unwrap();
		store.apply_batch(vec![PathOp::Insert(sample(1, "a.txt"))], "A", 100).unwrap();
		let current = store.get("a.txt").unwrap().unwrap();
		store
			.apply_batch(
				vec![PathOp::Delete { id: 1, expected_usn: current.usn }],
				"A",
				101,
			)
			.unwrap();
		let tombstone = store.get("a.txt").unwrap().unwrap();
		assert!(tombstone.is_tombstone());
		assert!(tombstone.length.is_none());
		assert!(tombstone.sha1.is_none());
	}

	#[test]
	fn query_since_orders_by_usn_ascending() {
		let dir = TempDir::new().unwrap();
		let store = PathStore::open(&dir.path().join("t.db")).unwrap();
		store.apply_batch(vec![PathOp::Insert(sample(1, "b.txt"))], "A", 100).unwrap();
		store.apply_batch(vec![PathOp::Insert(sample(2, "a.txt"))], "A", 101).unwrap();
		let page = store.query_since(0, 10).unwrap();
		assert_eq!(page.iter().map(|r| r.path.clone()).collect::<Vec<_>>(), vec!["b.txt", "a.txt"]);
	}

	#[test]
	fn query_since_respects_limit() {
		let dir = TempDir::new().unwrap();
		let store = PathStore::open(&dir.path().join("t.db")).unwrap();
		for i in 0..10u64 {
			store
				.apply_batch(vec![PathOp::Insert(sample(i + 1, &format!("f{}.txt", i)))], "A", 100)
				.unwrap();
		}
		let page = store.query_since(0, 3).unwrap();
		assert_eq!(page.len(), 3);
	}

	#[test]
	fn remove_subtree_tombstones_matching_normal_rows() {
		let dir = TempDir::new().unwrap();
		let store = PathStore::open(&dir.path().join("t.db")).unwrap();
		store.apply_batch(vec![PathOp::Insert(sample(1, "dir/a.txt"))], "A", 100).unwrap();
		store.apply_batch(vec![PathOp::Insert(sample(2, "dir/b.txt"))], "A", 100).unwrap();
		store.apply_batch(vec![PathOp::Insert(sample(3, "other.txt"))], "A", 100).unwrap();

		let n = store.remove_subtree("dir", "A", 101).unwrap();
		assert_eq!(n, 2);
		assert!(store.get("dir/a.txt").unwrap().unwrap().is_tombstone());
		assert!(store.get("dir/b.txt").unwrap().unwrap().is_tombstone());
		assert!(!store.get("other.txt").unwrap().unwrap().is_tombstone());
	}

	#[test]
	fn reopen_preserves_usn_monotonicity() {
		let dir = TempDir::new().unwrap();
		let db_path = dir.path().join("t.db");
		{
			let store = PathStore::open(&db_path).unwrap();
			store.apply_batch(vec![PathOp::Insert(sample(1, "a.txt"))], "A", 100).unwrap();
		}
		let store = PathStore::open(&db_path).unwrap();
		let outcomes =
			store.apply_batch(vec![PathOp::Insert(sample(2, "b.txt"))], "A", 100).unwrap();
		if let ApplyOutcome::Applied { usn } = outcomes[0] {
			assert!(usn > 1);
		} else {
			panic!("expected applied outcome");
		}
	}

	#[test]
	fn sibling_stores_sharing_an_allocator_never_collide() {
		let dir = TempDir::new().unwrap();
		let allocator = Arc::new(UsnAllocator::new());
		let store_a = PathStore::open_with_allocator(&dir.path().join("a.db"), allocator.clone()).unwrap();
		let store_b = PathStore::open_with_allocator(&dir.path().join("b.db"), allocator).unwrap();

		store_a.apply_batch(vec![PathOp::Insert(sample(1, "a.txt"))], "A", 100).unwrap();
		store_b.apply_batch(vec![PathOp::Insert(sample(1, "b.txt"))], "B", 100).unwrap();
		store_a.apply_batch(vec![PathOp::Insert(sample(2, "a2.txt"))], "A", 101).unwrap();

		let usn_a1 = store_a.get("a.txt").unwrap().unwrap().usn;
		let usn_b1 = store_b.get("b.txt").unwrap().unwrap().usn;
		let usn_a2 = store_a.get("a2.txt").unwrap().unwrap().usn;
		let mut usns = vec![usn_a1, usn_b1, usn_a2];
		usns.sort_unstable();
		usns.dedup();
		assert_eq!(usns.len(), 3, "usns allocated across sibling trees must never collide");
	}

	#[test]
	fn reopening_one_sibling_floors_the_shared_allocator_past_its_own_history() {
		let dir = TempDir::new().unwrap();
		let a_db = dir.path().join("a.db");
		{
			let allocator = Arc::new(UsnAllocator::new());
			let store_a = PathStore::open_with_allocator(&a_db, allocator).unwrap();
			for i in 0..5u64 {
				store_a
					.apply_batch(vec![PathOp::Insert(sample(i + 1, &format!("f{}.txt", i)))], "A", 100)
					.unwrap();
			}
		}
		// A fresh process re-seeds the shared allocator from every tree db,
		// `a.db` included, before opening `b.db` for the first time.
		let floor = PathStore::persisted_max_usn(&a_db).unwrap() + 1;
		let allocator = Arc::new(UsnAllocator::new());
		allocator.bump_floor(floor);
		let store_b = PathStore::open_with_allocator(&dir.path().join("b.db"), allocator).unwrap();
		let outcomes =
			store_b.apply_batch(vec![PathOp::Insert(sample(1, "b.txt"))], "B", 100).unwrap();
		if let ApplyOutcome::Applied { usn } = outcomes[0] {
			assert!(usn > 5, "b's first usn must come after every usn a already used");
		} else {
			panic!("expected applied outcome");
		}
	}
}

// vim: ts=4
