//! Unified configuration for zisync.
//!
//! Loads in priority order: built-in defaults, then
//! `~/.config/zisync/config.toml`, then `ZISYNC_*` environment variables,
//! then CLI flags (applied last, by the caller via [`Config::apply_overrides`]).
//! Most fields mirror config rows the design keeps in the content store's
//! `config` table (`username`, `passwd`, `discover_port`, `sync_interval`,
//! `backup_root`, `tree_root_prefix`, `report_host`, `ca_cert`, `mac_token`,
//! `dhtid`); this struct is the strongly-typed view used at startup, before
//! those rows are persisted into [`crate::store::content_store::ContentStore`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ZiError;
use crate::validation::config::validate_port;

/// Default route (RPC) port, matching the teacher's reserved range.
const DEFAULT_ROUTE_PORT: u16 = 8001;
const DEFAULT_DATA_PORT: u16 = 8002;
const DEFAULT_DISCOVER_PORT: u16 = 8003;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 300;
const DEFAULT_WAIT_RESPONSE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// Directory holding the content store database and one `<tree_uuid>.db`
	/// file per local tree.
	pub data_dir: PathBuf,

	pub username: String,
	/// sha1-hex of the account password; never the plaintext.
	pub passwd_sha1_hex: String,

	pub route_port: u16,
	pub data_port: u16,
	pub discover_port: u16,

	/// Seconds between periodic refresh/sync sweeps.
	pub sync_interval_secs: u64,
	/// Seconds to wait for a peer's RPC reply before marking it unreachable.
	pub wait_response_timeout_secs: u64,

	/// Root under which BACKUP_DST trees are created, for devices acting
	/// as a backup target.
	pub backup_root: Option<PathBuf>,
	/// Prefix prepended to relative tree roots reported by peers.
	pub tree_root_prefix: Option<PathBuf>,
	pub report_host: Option<String>,
	pub ca_cert_base64: Option<String>,
	pub mac_token: Option<String>,
	pub dhtid: Option<String>,

	pub log_level: String,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			data_dir: default_data_dir(),
			username: String::new(),
			passwd_sha1_hex: String::new(),
			route_port: DEFAULT_ROUTE_PORT,
			data_port: DEFAULT_DATA_PORT,
			discover_port: DEFAULT_DISCOVER_PORT,
			sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
			wait_response_timeout_secs: DEFAULT_WAIT_RESPONSE_TIMEOUT_SECS,
			backup_root: None,
			tree_root_prefix: None,
			report_host: None,
			ca_cert_base64: None,
			mac_token: None,
			dhtid: None,
			log_level: "info".to_string(),
		}
	}
}

fn default_data_dir() -> PathBuf {
	std::env::var("HOME")
		.ok()
		.map(|h| PathBuf::from(h).join(".zisync"))
		.unwrap_or_else(|| PathBuf::from(".zisync"))
}

fn config_file_path() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config/zisync/config.toml"))
}

impl Config {
	/// Load defaults, then the config file (if present), then environment
	/// overrides. Does not apply CLI overrides; callers do that with
	/// [`Config::apply_overrides`] after parsing `clap` args.
	pub fn load() -> Result<Config, ZiError> {
		let mut config = Config::default();

		if let Some(path) = config_file_path() {
			if path.exists() {
				let text = std::fs::read_to_string(&path)?;
				config = toml::from_str(&text)
					.map_err(|e| ZiError::ConfigParse(crate::error::boxed_error(e)))?;
			}
		}

		config.apply_env();
		config.validate()?;
		Ok(config)
	}

	fn apply_env(&mut self) {
		if let Ok(v) = std::env::var("ZISYNC_DATA_DIR") {
			self.data_dir = PathBuf::from(v);
		}
		if let Ok(v) = std::env::var("ZISYNC_USERNAME") {
			self.username = v;
		}
		if let Ok(v) = std::env::var("ZISYNC_ROUTE_PORT") {
			if let Ok(port) = v.parse() {
				self.route_port = port;
			}
		}
		if let Ok(v) = std::env::var("ZISYNC_DATA_PORT") {
			if let Ok(port) = v.parse() {
				self.data_port = port;
			}
		}
		if let Ok(v) = std::env::var("ZISYNC_DISCOVER_PORT") {
			if let Ok(port) = v.parse() {
				self.discover_port = port;
			}
		}
		if let Ok(v) = std::env::var("ZISYNC_SYNC_INTERVAL_SECS") {
			if let Ok(secs) = v.parse() {
				self.sync_interval_secs = secs;
			}
		}
		if let Ok(v) = std::env::var("ZISYNC_BACKUP_ROOT") {
			self.backup_root = Some(PathBuf::from(v));
		}
		if let Ok(v) = std::env::var("ZISYNC_REPORT_HOST") {
			self.report_host = Some(v);
		}
		if let Ok(v) = std::env::var("ZISYNC_LOG_LEVEL") {
			self.log_level = v;
		}
	}

	/// Apply CLI-flag overrides, highest priority in the load chain.
	pub fn apply_overrides(&mut self, overrides: ConfigOverrides) {
		if let Some(v) = overrides.data_dir {
			self.data_dir = v;
		}
		if let Some(v) = overrides.route_port {
			self.route_port = v;
		}
		if let Some(v) = overrides.data_port {
			self.data_port = v;
		}
		if let Some(v) = overrides.log_level {
			self.log_level = v;
		}
	}

	fn validate(&self) -> Result<(), ZiError> {
		validate_port(self.route_port as u32, "route_port")?;
		validate_port(self.data_port as u32, "data_port")?;
		validate_port(self.discover_port as u32, "discover_port")?;
		if self.route_port == self.data_port {
			return Err(ZiError::InvalidPort { port: self.data_port as u32 });
		}
		Ok(())
	}

	pub fn content_store_path(&self) -> PathBuf {
		self.data_dir.join("content.db")
	}

	pub fn tree_db_path(&self, tree_uuid: uuid::Uuid) -> PathBuf {
		self.data_dir.join(format!("{}.db", tree_uuid))
	}
}

/// Highest-priority overrides, typically parsed from CLI flags.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
	pub data_dir: Option<PathBuf>,
	pub route_port: Option<u16>,
	pub data_port: Option<u16>,
	pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_are_internally_valid() {
		let config = Config::default();
		assert!(config.validate().is_ok());
	}

	#[test]
	fn conflicting_route_and_data_ports_are_rejected() {
		let mut config = Config::default();
		config.data_port = config.route_port;
		assert!(config.validate().is_err());
	}

	#[test]
	fn overrides_take_priority_over_defaults() {
		let mut config = Config::default();
		config.apply_overrides(ConfigOverrides {
			route_port: Some(9001),
			..Default::default()
		});
		assert_eq!(config.route_port, 9001);
	}

	#[test]
	fn tree_db_path_is_named_by_uuid() {
		let config = Config { data_dir: PathBuf::from("/tmp/zisync"), ..Config::default() };
		let id = uuid::Uuid::nil();
		assert_eq!(config.tree_db_path(id), PathBuf::from(format!("/tmp/zisync/{}.db", id)));
	}
}

// vim: ts=4
