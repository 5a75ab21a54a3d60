//! Global content database: devices, syncs, trees, share permissions,
//! history, config, and peer caches. One redb file per account, living
//! alongside the per-tree [`super::path_store`] files under `Config::data_dir`.

use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::error::ZiError;
use crate::types::{Device, DeviceIp, HistoryEntry, Sync, Tree};

const DEVICE_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("device");
const DEVICE_IP_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("device_ip");
const SYNC_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sync");
const TREE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tree");
const SHARE_SYNC_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("share_sync");
const CONFIG_TABLE: TableDefinition<&str, &str> = TableDefinition::new("config");
const HISTORY_TABLE: TableDefinition<u64, &[u8]> = TableDefinition::new("history");
const DHT_PEER_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("dht_peer");
const STATIC_PEER_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("static_peer");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_HISTORY_ID_KEY: &str = "next_history_id";

/// A per-device permission grant on a `Shared` sync, recorded separately
/// from the sync's own `perm` field so each device can be tracked
/// independently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShareSyncEntry {
	pub sync_uuid: Uuid,
	pub device_id: u64,
	pub perm: crate::types::SyncPerm,
}

/// A cached DHT peer observation (uuid -> last known contact info).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtPeerEntry {
	pub device_uuid: Uuid,
	pub ip: String,
	pub port: u16,
	pub last_seen: u64,
}

/// A manually-configured peer address that bypasses discovery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticPeerEntry {
	pub device_uuid: Uuid,
	pub ip: String,
	pub port: u16,
}

/// Well-known config row names, per the persisted-state contract.
pub mod config_keys {
	pub const USERNAME: &str = "username";
	pub const PASSWD_SHA1_HEX: &str = "passwd";
	pub const DISCOVER_PORT: &str = "discover_port";
	pub const SYNC_INTERVAL: &str = "sync_interval";
	pub const BACKUP_ROOT: &str = "backup_root";
	pub const TREE_ROOT_PREFIX: &str = "tree_root_prefix";
	pub const REPORT_HOST: &str = "report_host";
	pub const CA_CERT_BASE64: &str = "ca_cert";
	pub const MAC_TOKEN: &str = "mac_token";
	pub const DHTID: &str = "dhtid";
}

pub struct ContentStore {
	db: redb::Database,
}

impl ContentStore {
	pub fn open(db_path: &Path) -> Result<Self, ZiError> {
		let db = redb::Database::create(db_path)?;
		{
			let write_txn = db.begin_write()?;
			{
				let _ = write_txn.open_table(DEVICE_TABLE)?;
				let _ = write_txn.open_table(DEVICE_IP_TABLE)?;
				let _ = write_txn.open_table(SYNC_TABLE)?;
				let _ = write_txn.open_table(TREE_TABLE)?;
				let _ = write_txn.open_table(SHARE_SYNC_TABLE)?;
				let _ = write_txn.open_table(CONFIG_TABLE)?;
				let _ = write_txn.open_table(HISTORY_TABLE)?;
				let _ = write_txn.open_table(DHT_PEER_TABLE)?;
				let _ = write_txn.open_table(STATIC_PEER_TABLE)?;
				let mut meta = write_txn.open_table(META_TABLE)?;
				if meta.get(NEXT_HISTORY_ID_KEY)?.is_none() {
					meta.insert(NEXT_HISTORY_ID_KEY, 1u64)?;
				}
			}
			write_txn.commit()?;
		}
		Ok(ContentStore { db })
	}

	// -- Device ----------------------------------------------------------

	pub fn put_device(&self, device: &Device) -> Result<(), ZiError> {
		let bytes = super::encode(device)?;
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(DEVICE_TABLE)?;
			table.insert(device.id, bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	pub fn get_device(&self, id: u64) -> Result<Option<Device>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(DEVICE_TABLE)?;
		match table.get(id)? {
			Some(v) => Ok(Some(super::decode(v.value())?)),
			None => Ok(None),
		}
	}

	pub fn list_devices(&self) -> Result<Vec<Device>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(DEVICE_TABLE)?;
		let mut out = Vec::new();
		for entry in table.iter()? {
			let (_, v) = entry?;
			out.push(super::decode(v.value())?);
		}
		Ok(out)
	}

	// -- DeviceIP ----------------------------------------------------------

	fn device_ip_key(device_id: u64, ip: &str) -> String {
		format!("{}:{}", device_id, ip)
	}

	pub fn put_device_ip(&self, entry: &DeviceIp) -> Result<(), ZiError> {
		let key = Self::device_ip_key(entry.device_id, &entry.ip);
		let bytes = super::encode(entry)?;
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(DEVICE_IP_TABLE)?;
			table.insert(key.as_str(), bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	/// Known addresses for `device_id`. Empty result means the device is
	/// offline.
	pub fn device_ips(&self, device_id: u64) -> Result<Vec<DeviceIp>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(DEVICE_IP_TABLE)?;
		let prefix = format!("{}:", device_id);
		let mut out = Vec::new();
		for entry in table.iter()? {
			let (k, v) = entry?;
			if k.value().starts_with(&prefix) {
				out.push(super::decode(v.value())?);
			}
		}
		Ok(out)
	}

	/// Forget every known address for `device_id` (the peer is considered
	/// unreachable until it is rediscovered).
	pub fn remove_device_ips(&self, device_id: u64) -> Result<usize, ZiError> {
		let prefix = format!("{}:", device_id);
		let write_txn = self.db.begin_write()?;
		let removed = {
			let mut table = write_txn.open_table(DEVICE_IP_TABLE)?;
			let keys: Vec<String> = table
				.iter()?
				.filter_map(|entry| entry.ok())
				.map(|(k, _)| k.value().to_string())
				.filter(|k| k.starts_with(&prefix))
				.collect();
			for key in &keys {
				table.remove(key.as_str())?;
			}
			keys.len()
		};
		write_txn.commit()?;
		Ok(removed)
	}

	// -- Sync ----------------------------------------------------------

	pub fn put_sync(&self, sync: &Sync) -> Result<(), ZiError> {
		let key = sync.uuid.to_string();
		let bytes = super::encode(sync)?;
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(SYNC_TABLE)?;
			table.insert(key.as_str(), bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	pub fn get_sync(&self, uuid: &Uuid) -> Result<Option<Sync>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(SYNC_TABLE)?;
		match table.get(uuid.to_string().as_str())? {
			Some(v) => Ok(Some(super::decode(v.value())?)),
			None => Ok(None),
		}
	}

	pub fn list_syncs(&self) -> Result<Vec<Sync>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(SYNC_TABLE)?;
		let mut out = Vec::new();
		for entry in table.iter()? {
			let (_, v) = entry?;
			out.push(super::decode(v.value())?);
		}
		Ok(out)
	}

	// -- Tree ----------------------------------------------------------

	pub fn put_tree(&self, tree: &Tree) -> Result<(), ZiError> {
		let key = tree.uuid.to_string();
		let bytes = super::encode(tree)?;
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(TREE_TABLE)?;
			table.insert(key.as_str(), bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	pub fn get_tree(&self, uuid: &Uuid) -> Result<Option<Tree>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(TREE_TABLE)?;
		match table.get(uuid.to_string().as_str())? {
			Some(v) => Ok(Some(super::decode(v.value())?)),
			None => Ok(None),
		}
	}

	/// Trees belonging to `sync_id`, sorted by uuid — this sort order is the
	/// tree's vector-clock column assignment.
	pub fn trees_for_sync(&self, sync_id: &Uuid) -> Result<Vec<Tree>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(TREE_TABLE)?;
		let mut out = Vec::new();
		for entry in table.iter()? {
			let (_, v) = entry?;
			let tree: Tree = super::decode(v.value())?;
			if &tree.sync_id == sync_id {
				out.push(tree);
			}
		}
		out.sort_by_key(|t| t.uuid);
		Ok(out)
	}

	/// All local (non-placeholder) trees owned by this device.
	pub fn local_trees(&self) -> Result<Vec<Tree>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(TREE_TABLE)?;
		let mut out = Vec::new();
		for entry in table.iter()? {
			let (_, v) = entry?;
			let tree: Tree = super::decode(v.value())?;
			if tree.device_id == crate::types::LOCAL_DEVICE_ID && !tree.is_vclock_placeholder() {
				out.push(tree);
			}
		}
		Ok(out)
	}

	// -- Share sync ----------------------------------------------------------

	fn share_key(sync_uuid: &Uuid, device_id: u64) -> String {
		format!("{}:{}", sync_uuid, device_id)
	}

	pub fn put_share_sync(&self, entry: &ShareSyncEntry) -> Result<(), ZiError> {
		let key = Self::share_key(&entry.sync_uuid, entry.device_id);
		let bytes = super::encode(entry)?;
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(SHARE_SYNC_TABLE)?;
			table.insert(key.as_str(), bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	pub fn share_syncs_for(&self, sync_uuid: &Uuid) -> Result<Vec<ShareSyncEntry>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(SHARE_SYNC_TABLE)?;
		let prefix = format!("{}:", sync_uuid);
		let mut out = Vec::new();
		for entry in table.iter()? {
			let (k, v) = entry?;
			if k.value().starts_with(&prefix) {
				out.push(super::decode(v.value())?);
			}
		}
		Ok(out)
	}

	// -- Config ----------------------------------------------------------

	pub fn set_config(&self, key: &str, value: &str) -> Result<(), ZiError> {
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(CONFIG_TABLE)?;
			table.insert(key, value)?;
		}
		write_txn.commit()?;
		Ok(())
	}

	pub fn get_config(&self, key: &str) -> Result<Option<String>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(CONFIG_TABLE)?;
		Ok(table.get(key)?.map(|v| v.value().to_string()))
	}

	// -- History ----------------------------------------------------------

	pub fn append_history(&self, entry: &HistoryEntry) -> Result<u64, ZiError> {
		let bytes = super::encode(entry)?;
		let write_txn = self.db.begin_write()?;
		let id = {
			let mut meta = write_txn.open_table(META_TABLE)?;
			let id = meta.get(NEXT_HISTORY_ID_KEY)?.map(|v| v.value()).unwrap_or(1);
			meta.insert(NEXT_HISTORY_ID_KEY, id + 1)?;
			id
		};
		{
			let mut table = write_txn.open_table(HISTORY_TABLE)?;
			table.insert(id, bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(id)
	}

	pub fn history_since(&self, id_lower_bound: u64) -> Result<Vec<HistoryEntry>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(HISTORY_TABLE)?;
		let mut out = Vec::new();
		for entry in table.range((id_lower_bound + 1)..)? {
			let (_, v) = entry?;
			out.push(super::decode(v.value())?);
		}
		Ok(out)
	}

	// -- Peer caches ----------------------------------------------------------

	pub fn put_dht_peer(&self, entry: &DhtPeerEntry) -> Result<(), ZiError> {
		let key = entry.device_uuid.to_string();
		let bytes = super::encode(entry)?;
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(DHT_PEER_TABLE)?;
			table.insert(key.as_str(), bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	pub fn put_static_peer(&self, entry: &StaticPeerEntry) -> Result<(), ZiError> {
		let key = entry.device_uuid.to_string();
		let bytes = super::encode(entry)?;
		let write_txn = self.db.begin_write()?;
		{
			let mut table = write_txn.open_table(STATIC_PEER_TABLE)?;
			table.insert(key.as_str(), bytes.as_slice())?;
		}
		write_txn.commit()?;
		Ok(())
	}

	pub fn list_static_peers(&self) -> Result<Vec<StaticPeerEntry>, ZiError> {
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(STATIC_PEER_TABLE)?;
		let mut out = Vec::new();
		for entry in table.iter()? {
			let (_, v) = entry?;
			out.push(super::decode(v.value())?);
		}
		Ok(out)
	}
}


// vim: ts=4
