//! `zisync` daemon and admin CLI.
//!
//! Thin by design (see SPEC_FULL.md §1): argument parsing exists only to
//! drive the engine in [`zisync::orchestrator`], not to reimplement it.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uuid::Uuid;

use zisync::config::{Config, ConfigOverrides};
use zisync::discovery::BroadcastDiscovery;
use zisync::orchestrator::Orchestrator;
use zisync::scanner::Platform;
use zisync::store::content_store::ContentStore;
use zisync::transfer::NullMonitor;
use zisync::types::{
	BackupType, Device, DeviceStatus, EntityStatus, RootStatus, Sync, SyncPerm, SyncType, Tree,
	TreeStatus, LOCAL_DEVICE_ID,
};
use zisync::ZiError;

#[derive(Parser)]
#[command(name = "zisync", version, about = "Peer-to-peer file synchronization engine")]
struct Cli {
	/// Override the data directory (content store + per-tree databases).
	#[arg(short, long, global = true)]
	data_dir: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Accept RPC connections from peers and serve this device's state.
	Serve {
		#[arg(long)]
		route_port: Option<u16>,
	},
	/// Run the full daemon: serve, periodic refresh, and sync sweeps.
	Run {
		#[arg(long)]
		route_port: Option<u16>,
	},
	/// Inspect known devices.
	Device {
		#[command(subcommand)]
		command: DeviceCommands,
	},
	/// Manage two-way Syncs.
	Sync {
		#[command(subcommand)]
		command: SyncCommands,
	},
	/// Manage one-way Backups.
	Backup {
		#[command(subcommand)]
		command: BackupCommands,
	},
	/// Manage permissioned Shared Syncs.
	Share {
		#[command(subcommand)]
		command: ShareCommands,
	},
}

#[derive(Subcommand)]
enum DeviceCommands {
	/// Print every known device and its online/offline status.
	Status,
}

#[derive(Subcommand)]
enum SyncCommands {
	/// Create a two-way Sync rooted at `dir` on this device.
	Add { name: String, dir: PathBuf },
	/// List known Syncs.
	List,
	/// Mark a Sync removed.
	Remove { uuid: Uuid },
}

#[derive(Subcommand)]
enum BackupCommands {
	/// Create a one-way Backup from `src_dir` (this device) to `dst_dir`
	/// (this device's configured backup root).
	Add { name: String, src_dir: PathBuf, dst_dir: PathBuf },
}

#[derive(Subcommand)]
enum ShareCommands {
	/// Create a permissioned Shared Sync rooted at `dir`.
	Add {
		name: String,
		dir: PathBuf,
		#[arg(long, value_enum, default_value = "rdwr")]
		perm: SharePermArg,
	},
}

#[derive(Debug, Clone, clap::ValueEnum)]
enum SharePermArg {
	Rdonly,
	Wronly,
	Rdwr,
}

impl From<SharePermArg> for SyncPerm {
	fn from(value: SharePermArg) -> Self {
		match value {
			SharePermArg::Rdonly => SyncPerm::Rdonly,
			SharePermArg::Wronly => SyncPerm::Wronly,
			SharePermArg::Rdwr => SyncPerm::Rdwr,
		}
	}
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let cli = Cli::parse();

	let mut config = Config::load()?;
	config.apply_overrides(ConfigOverrides { data_dir: cli.data_dir.clone(), ..Default::default() });
	zisync::logging::init_tracing();
	std::fs::create_dir_all(&config.data_dir)?;

	let content_store = Arc::new(ContentStore::open(&config.content_store_path())?);
	ensure_local_device(&content_store, &config)?;

	match cli.command {
		Commands::Serve { route_port } => {
			let port = route_port.unwrap_or(config.route_port);
			let data_port = config.data_port;
			let orchestrator = build_orchestrator(config, content_store)?;
			let route_addr = format!("0.0.0.0:{}", port);
			let data_addr = format!("0.0.0.0:{}", data_port);
			tokio::try_join!(orchestrator.serve(&route_addr), orchestrator.serve_transfer(&data_addr))?;
		}
		Commands::Run { route_port } => {
			let port = route_port.unwrap_or(config.route_port);
			let data_port = config.data_port;
			let sync_interval = config.sync_interval_secs;
			let trees = content_store.local_trees()?;
			let orchestrator = build_orchestrator(config, content_store.clone())?;

			let serve_orchestrator = orchestrator.clone();
			let serve_addr = format!("0.0.0.0:{}", port);
			tokio::spawn(async move {
				if let Err(e) = serve_orchestrator.serve(&serve_addr).await {
					tracing::error!(error = %e, "serve loop exited");
				}
			});

			let transfer_orchestrator = orchestrator.clone();
			let transfer_addr = format!("0.0.0.0:{}", data_port);
			tokio::spawn(async move {
				if let Err(e) = transfer_orchestrator.serve_transfer(&transfer_addr).await {
					tracing::error!(error = %e, "transfer serve loop exited");
				}
			});

			let mut ticker = tokio::time::interval(std::time::Duration::from_secs(sync_interval.max(1)));
			loop {
				ticker.tick().await;
				for tree in &trees {
					if tree.is_vclock_placeholder() || !tree.is_enabled {
						continue;
					}
					orchestrator.refresh(tree.uuid).await;
				}
			}
		}
		Commands::Device { command: DeviceCommands::Status } => {
			for device in content_store.list_devices()? {
				let status = match device.status {
					DeviceStatus::Online => "online",
					DeviceStatus::Offline => "offline",
				};
				println!("{}  {}  {}  {}", device.uuid, device.name, device.platform, status);
			}
		}
		Commands::Sync { command: SyncCommands::Add { name, dir } } => {
			let sync = Sync {
				uuid: Uuid::new_v4(),
				name,
				ty: SyncType::Normal,
				status: EntityStatus::Normal,
				creator_device_id: LOCAL_DEVICE_ID,
				perm: SyncPerm::Rdwr,
				restore_share_perm: None,
				last_sync: 0,
			};
			let tree = local_tree(&sync, &dir, BackupType::None);
			content_store.put_sync(&sync)?;
			content_store.put_tree(&tree)?;
			println!("sync {} created, tree {}", sync.uuid, tree.uuid);
		}
		Commands::Sync { command: SyncCommands::List } => {
			for sync in content_store.list_syncs()? {
				println!("{}  {}  {:?}  {:?}", sync.uuid, sync.name, sync.ty, sync.status);
			}
		}
		Commands::Sync { command: SyncCommands::Remove { uuid } } => {
			let mut sync = content_store
				.get_sync(&uuid)?
				.ok_or_else(|| ZiError::SyncNoEnt { uuid: uuid.to_string() })?;
			sync.status = EntityStatus::Remove;
			content_store.put_sync(&sync)?;
			println!("sync {} marked removed", uuid);
		}
		Commands::Backup { command: BackupCommands::Add { name, src_dir, dst_dir } } => {
			let sync = Sync {
				uuid: Uuid::new_v4(),
				name,
				ty: SyncType::Backup,
				status: EntityStatus::Normal,
				creator_device_id: LOCAL_DEVICE_ID,
				perm: SyncPerm::Rdwr,
				restore_share_perm: None,
				last_sync: 0,
			};
			let src = local_tree(&sync, &src_dir, BackupType::Src);
			let dst = local_tree(&sync, &dst_dir, BackupType::Dst);
			content_store.put_sync(&sync)?;
			content_store.put_tree(&src)?;
			content_store.put_tree(&dst)?;
			println!("backup {} created, src {} dst {}", sync.uuid, src.uuid, dst.uuid);
		}
		Commands::Share { command: ShareCommands::Add { name, dir, perm } } => {
			let sync = Sync {
				uuid: Uuid::new_v4(),
				name,
				ty: SyncType::Shared,
				status: EntityStatus::Normal,
				creator_device_id: LOCAL_DEVICE_ID,
				perm: perm.into(),
				restore_share_perm: None,
				last_sync: 0,
			};
			let tree = local_tree(&sync, &dir, BackupType::None);
			content_store.put_sync(&sync)?;
			content_store.put_tree(&tree)?;
			println!("share {} created, tree {}", sync.uuid, tree.uuid);
		}
	}

	Ok(())
}

fn local_tree(sync: &Sync, dir: &std::path::Path, backup_type: BackupType) -> Tree {
	Tree {
		uuid: Uuid::new_v4(),
		root: dir.to_string_lossy().into_owned(),
		sync_id: sync.uuid,
		device_id: LOCAL_DEVICE_ID,
		status: TreeStatus::Normal,
		backup_type,
		is_enabled: true,
		root_status: RootStatus::Normal,
	}
}

fn ensure_local_device(content_store: &ContentStore, config: &Config) -> Result<(), ZiError> {
	if content_store.get_device(LOCAL_DEVICE_ID)?.is_some() {
		return Ok(());
	}
	let device = Device {
		id: LOCAL_DEVICE_ID,
		uuid: Uuid::new_v4(),
		name: hostname(),
		platform: format!("{:?}", Platform::current()),
		route_port: config.route_port,
		data_port: config.data_port,
		is_mine: true,
		status: DeviceStatus::Online,
		backup_root: config.backup_root.as_ref().map(|p| p.to_string_lossy().into_owned()),
	};
	content_store.put_device(&device)
}

fn hostname() -> String {
	std::env::var("HOSTNAME")
		.or_else(|_| std::env::var("COMPUTERNAME"))
		.unwrap_or_else(|_| "zisync-device".to_string())
}

fn build_orchestrator(config: Config, content_store: Arc<ContentStore>) -> Result<Arc<Orchestrator>, ZiError> {
	let discovery = BroadcastDiscovery::new("0.0.0.0:0", format!("255.255.255.255:{}", config.discover_port));
	Ok(Orchestrator::new(
		config,
		content_store,
		Arc::new(discovery),
		Arc::new(NullMonitor),
		Platform::current(),
	))
}

// vim: ts=4
