//! Core data model: Device, DeviceIP, Sync, Tree, FileRecord.
//!
//! These map onto redb tables in [`crate::store::content_store`] (Device,
//! DeviceIP, Sync, Tree, ...) and one [`crate::store::path_store`] database
//! per tree (FileRecord rows keyed by path).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device id reserved for this device.
pub const LOCAL_DEVICE_ID: u64 = 1;
/// The NULL device id.
pub const NULL_DEVICE_ID: u64 = 0;

/// Online/offline status of a [`Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
	Online,
	Offline,
}

/// A device participating in the same account.
///
/// Device id 1 is reserved for *this* device; id 0 is the NULL device.
/// Devices are never deleted, only transitioned offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
	pub id: u64,
	pub uuid: Uuid,
	pub name: String,
	pub platform: String,
	pub route_port: u16,
	pub data_port: u16,
	pub is_mine: bool,
	pub status: DeviceStatus,
	/// Only meaningful for non-mobile devices.
	pub backup_root: Option<String>,
}

/// An observed address for a [`Device`].
///
/// A device with no `DeviceIP` rows is considered offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIp {
	pub device_id: u64,
	pub ip: String,
	pub is_ipv6: bool,
	/// Set when a request to this address times out, cleared on success.
	pub earliest_no_resp_time: Option<u64>,
}

/// The kind of a [`Sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
	Normal,
	Backup,
	Shared,
}

/// Lifecycle status shared by [`Sync`] and [`Tree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityStatus {
	Normal,
	Remove,
}

/// Permission state of a [`Sync`] (mainly meaningful for `Shared`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPerm {
	Rdonly,
	Wronly,
	Rdwr,
	CreatorDelete,
	TokenDiff,
	Disconnect,
}

/// The logical agreement that several trees mirror each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sync {
	pub uuid: Uuid,
	pub name: String,
	pub ty: SyncType,
	pub status: EntityStatus,
	pub creator_device_id: u64,
	pub perm: SyncPerm,
	/// Remembers the previous `perm` across token changes.
	pub restore_share_perm: Option<SyncPerm>,
	pub last_sync: u64,
}

/// One-way backup direction tag for a [`Tree`] inside a `BACKUP` sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
	None,
	Src,
	Dst,
}

/// Status of a tree's filesystem root as last observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootStatus {
	Normal,
	Removed,
}

/// Lifecycle status of a [`Tree`], including the VCLOCK placeholder kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeStatus {
	Normal,
	Remove,
	/// Placeholder reserving a vector-clock column for a peer tree we never
	/// see directly. Has no root, no watcher; never enumerated as a local tree.
	Vclock,
}

/// One directory subtree owned by one device, participating in exactly one
/// [`Sync`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
	pub uuid: Uuid,
	/// Absolute filesystem path on its device. Empty for VCLOCK placeholders.
	pub root: String,
	pub sync_id: Uuid,
	pub device_id: u64,
	pub status: TreeStatus,
	pub backup_type: BackupType,
	pub is_enabled: bool,
	pub root_status: RootStatus,
}

impl Tree {
	/// VCLOCK placeholder trees reserve a clock column but participate in
	/// nothing else.
	pub fn is_vclock_placeholder(&self) -> bool {
		matches!(self.status, TreeStatus::Vclock)
	}
}

/// File vs directory kind for a [`FileRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
	File,
	Dir,
}

/// Lifecycle status of a [`FileRecord`] row. Removed rows are kept as
/// tombstones (`length`/`sha1` cleared) and participate in vector-clock
/// comparisons forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordStatus {
	Normal,
	Remove,
}

/// Cross-platform file attribute payload, kept verbatim from whichever
/// platform last wrote the record so a peer on that platform can restore it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformAttrs {
	pub unix_attr: Option<u32>,
	pub win_attr: Option<u32>,
	pub android_attr: Option<u32>,
}

/// A row in a tree's [`crate::store::path_store::PathStore`], keyed by `path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
	pub id: u64,
	pub path: String,
	pub ty: EntryType,
	pub status: RecordStatus,
	pub mtime: i64,
	pub length: Option<u64>,
	/// Monotonic per-database USN, stamped by `apply_batch`.
	pub usn: u64,
	/// Content hash for files; substituted with blake3 at the byte level
	/// (see DESIGN.md), cleared to `None` on tombstones.
	pub sha1: Option<String>,
	pub attrs: PlatformAttrs,
	/// This tree's own vclock column.
	pub local_vclock: i32,
	/// Packed column vector for all other peer trees, in insertion order.
	pub remote_vclock: Vec<i32>,
	/// Device name that last changed this record.
	pub modifier: String,
	pub time_stamp: u64,
}

impl FileRecord {
	/// Build the full vector clock (`local_vclock` is always column 0).
	pub fn vclock(&self) -> Vec<i32> {
		let mut v = Vec::with_capacity(1 + self.remote_vclock.len());
		v.push(self.local_vclock);
		v.extend_from_slice(&self.remote_vclock);
		v
	}

	/// Whether this record is a tombstone.
	pub fn is_tombstone(&self) -> bool {
		matches!(self.status, RecordStatus::Remove)
	}
}

/// History event kind recorded for every Path Store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryCode {
	Insert,
	Update,
	Delete,
	Rename,
	Conflict,
}

/// One row in the `history` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
	pub modifier: String,
	pub tree_id: Uuid,
	pub backup_type: BackupType,
	pub time_stamp: u64,
	pub path: String,
	pub code: HistoryCode,
	pub rename_target: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn vclock_assembles_local_then_remote_columns() {
		let rec = FileRecord {
			id: 1,
			path: "a.txt".into(),
			ty: EntryType::File,
			status: RecordStatus::Normal,
			mtime: 100,
			length: Some(4),
			usn: 1,
			sha1: Some("x".into()),
			attrs: PlatformAttrs::default(),
			local_vclock: 1,
			remote_vclock: vec![0, 2],
			modifier: "A".into(),
			time_stamp: 100,
		};
		assert_eq!(rec.vclock(), vec![1, 0, 2]);
	}

	#[test]
	fn tombstone_detection() {
		let mut rec = FileRecord {
			id: 1,
			path: "a.txt".into(),
			ty: EntryType::File,
			status: RecordStatus::Normal,
			mtime: 100,
			length: Some(4),
			usn: 1,
			sha1: Some("x".into()),
			attrs: PlatformAttrs::default(),
			local_vclock: 1,
			remote_vclock: vec![],
			modifier: "A".into(),
			time_stamp: 100,
		};
		assert!(!rec.is_tombstone());
		rec.status = RecordStatus::Remove;
		rec.length = None;
		rec.sha1 = None;
		assert!(rec.is_tombstone());
	}

	#[test]
	fn vclock_placeholder_is_not_a_usable_tree() {
		let tree = Tree {
			uuid: Uuid::nil(),
			root: String::new(),
			sync_id: Uuid::nil(),
			device_id: NULL_DEVICE_ID,
			status: TreeStatus::Vclock,
			backup_type: BackupType::None,
			is_enabled: false,
			root_status: RootStatus::Normal,
		};
		assert!(tree.is_vclock_placeholder());
	}
}

// vim: ts=4
