//! The task graph that drives the engine end to end: refresh, sync,
//! push-info fan-out, peer erasure, and device discovery, all fed by
//! change notifications from the filesystem watcher and the sync
//! interval timer.
//!
//! Grounded on `callbacks.rs`'s single-queue event-driven dispatch and
//! `sync_impl/state.rs`'s per-node dedup bookkeeping, generalized from
//! per-node ids to the `(tree, sync, device)` ids this design reconciles
//! over. Cancellation follows §5: one global `CancellationToken` with a
//! per-tree child token nested under it.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::discovery::{Discovery, PeerAddr};
use crate::error::{SessionError, ZiError};
use crate::monitor::ScanRequest;
use crate::rpc::{
	self, AnnounceTokenChanged, FileStat, FindReply, FindRequest, Message, PushDeviceInfo, PushSyncInfo,
	PushTreeInfo,
};
use crate::scanner::{self, Platform, ScanConfig};
use crate::session::{self, SessionConfig};
use crate::store::content_store::{config_keys, ContentStore};
use crate::store::path_store::{PathStore, UsnAllocator};
use crate::transfer::TaskMonitor;
use crate::types::{
	BackupType, Device, DeviceStatus, EntityStatus, LOCAL_DEVICE_ID, RootStatus, Sync, SyncPerm,
	SyncType, Tree, TreeStatus,
};

pub struct Orchestrator {
	config: Config,
	content_store: Arc<ContentStore>,
	discovery: Arc<dyn Discovery>,
	monitor: Arc<dyn TaskMonitor>,
	platform: Platform,

	path_stores: Mutex<HashMap<Uuid, Arc<PathStore>>>,
	/// One usn allocator shared by every tree db this device opens, per
	/// spec.md §9 ("Global USN allocator"). Seeded lazily, once, from
	/// `max(usn)` over every local tree's persisted db the first time any
	/// `PathStore` is opened.
	usn_allocator: Arc<UsnAllocator>,
	usn_allocator_seeded: Mutex<bool>,
	inflight_refresh: Mutex<HashSet<Uuid>>,
	running_sessions: Mutex<HashSet<(Uuid, Uuid)>>,
	/// Last `last_seen_remote_usn` observed for a `(local_tree,
	/// remote_tree)` pair, kept in memory only; see DESIGN.md for the
	/// accepted gap (not yet persisted across restarts).
	last_seen_usn: Mutex<HashMap<(Uuid, Uuid), u64>>,

	refresh_tx: mpsc::UnboundedSender<Uuid>,
	global_cancel: CancellationToken,
	tree_cancels: Mutex<HashMap<Uuid, CancellationToken>>,
}

fn now_ts() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn is_rdonly(sync: &Sync, tree: &Tree) -> bool {
	tree.backup_type == BackupType::Dst || sync.perm == SyncPerm::Rdonly
}

impl Orchestrator {
	pub fn new(
		config: Config,
		content_store: Arc<ContentStore>,
		discovery: Arc<dyn Discovery>,
		monitor: Arc<dyn TaskMonitor>,
		platform: Platform,
	) -> Arc<Self> {
		let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
		let orchestrator = Arc::new(Orchestrator {
			config,
			content_store,
			discovery,
			monitor,
			platform,
			path_stores: Mutex::new(HashMap::new()),
			usn_allocator: Arc::new(UsnAllocator::new()),
			usn_allocator_seeded: Mutex::new(false),
			inflight_refresh: Mutex::new(HashSet::new()),
			running_sessions: Mutex::new(HashSet::new()),
			last_seen_usn: Mutex::new(HashMap::new()),
			refresh_tx,
			global_cancel: CancellationToken::new(),
			tree_cancels: Mutex::new(HashMap::new()),
		});
		orchestrator.clone().spawn_refresh_worker(refresh_rx);
		orchestrator
	}

	/// Cancel every in-flight task; nested per-tree tokens cancel with it.
	pub fn shutdown(&self) {
		self.global_cancel.cancel();
	}

	async fn cancel_token_for_tree(&self, tree_uuid: Uuid) -> CancellationToken {
		let mut tokens = self.tree_cancels.lock().await;
		tokens.entry(tree_uuid).or_insert_with(|| self.global_cancel.child_token()).clone()
	}

	fn spawn_refresh_worker(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Uuid>) {
		let cancel = self.global_cancel.clone();
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = cancel.cancelled() => break,
					received = rx.recv() => {
						match received {
							Some(tree_uuid) => {
								if let Err(e) = self.run_refresh(tree_uuid).await {
									tracing::warn!(tree = %tree_uuid, error = %e, "refresh failed");
								}
								self.inflight_refresh.lock().await.remove(&tree_uuid);
							}
							None => break,
						}
					}
				}
			}
		});
	}

	/// Queue a refresh of `tree_uuid`. A refresh already queued for this
	/// tree absorbs the request rather than running a second pass.
	pub async fn refresh(&self, tree_uuid: Uuid) {
		let mut inflight = self.inflight_refresh.lock().await;
		if inflight.insert(tree_uuid) {
			let _ = self.refresh_tx.send(tree_uuid);
		}
	}

	/// Entry point for the filesystem watcher: a change-notification
	/// always re-queues a full refresh of the owning tree. The granular
	/// path list in `request` is not yet consumed by the scanner (it
	/// always walks the whole root); see DESIGN.md.
	pub async fn on_scan_request(&self, tree_uuid: Uuid, _request: ScanRequest) {
		self.refresh(tree_uuid).await;
	}

	async fn path_store_for(&self, tree_uuid: Uuid) -> Result<Arc<PathStore>, ZiError> {
		let mut stores = self.path_stores.lock().await;
		if let Some(store) = stores.get(&tree_uuid) {
			return Ok(store.clone());
		}
		self.ensure_usn_allocator_seeded().await?;
		let db_path = self.config.tree_db_path(tree_uuid);
		let store = Arc::new(PathStore::open_with_allocator(&db_path, self.usn_allocator.clone())?);
		stores.insert(tree_uuid, store.clone());
		Ok(store)
	}

	/// Seed the shared usn allocator, once, from `max(usn)` over every local
	/// tree's persisted db — spec.md §9's "Global USN allocator" — so a
	/// restart never hands out a usn any tree database on this device has
	/// already used.
	async fn ensure_usn_allocator_seeded(&self) -> Result<(), ZiError> {
		let mut seeded = self.usn_allocator_seeded.lock().await;
		if *seeded {
			return Ok(());
		}
		let mut floor = 1u64;
		for tree in self.content_store.local_trees()? {
			let db_path = self.config.tree_db_path(tree.uuid);
			if !db_path.exists() {
				continue;
			}
			floor = floor.max(PathStore::persisted_max_usn(&db_path)? + 1);
		}
		self.usn_allocator.bump_floor(floor);
		*seeded = true;
		Ok(())
	}

	fn local_device_name(&self) -> String {
		self.content_store
			.get_device(LOCAL_DEVICE_ID)
			.ok()
			.flatten()
			.map(|d| d.name)
			.unwrap_or_else(|| "unknown".to_string())
	}

	async fn run_refresh(&self, tree_uuid: Uuid) -> Result<(), ZiError> {
		let tree = self
			.content_store
			.get_tree(&tree_uuid)?
			.ok_or_else(|| ZiError::TreeNoEnt { uuid: tree_uuid.to_string() })?;
		if tree.is_vclock_placeholder() || !tree.is_enabled || tree.root_status == RootStatus::Removed {
			return Ok(());
		}

		let sync = self
			.content_store
			.get_sync(&tree.sync_id)?
			.ok_or_else(|| ZiError::SyncNoEnt { uuid: tree.sync_id.to_string() })?;
		let store = self.path_store_for(tree_uuid).await?;
		let scan_config = ScanConfig {
			platform: self.platform,
			is_rdonly: is_rdonly(&sync, &tree),
			is_backup_dst: tree.backup_type == BackupType::Dst,
		};

		let root = Path::new(&tree.root);
		if !root.is_dir() {
			return Err(ZiError::DirNoEnt { path: tree.root.clone() });
		}

		let history = scanner::HistorySink {
			content_store: self.content_store.as_ref(),
			tree_uuid,
			backup_type: tree.backup_type,
		};
		let report = scanner::refresh(root, &store, &self.local_device_name(), now_ts(), &scan_config, &history)?;
		tracing::debug!(
			tree = %tree_uuid,
			applied = report.applied,
			skipped = report.skipped,
			requeue = report.requeue.len(),
			"refresh complete"
		);
		Ok(())
	}

	/// Start a sync session between `local_tree_uuid` and
	/// `remote_tree_uuid` in the background. Returns immediately once the
	/// at-most-one-session-per-pair guard has been acquired.
	pub async fn sync(self: &Arc<Self>, local_tree_uuid: Uuid, remote_tree_uuid: Uuid) -> Result<(), ZiError> {
		let key = (local_tree_uuid, remote_tree_uuid);
		{
			let mut running = self.running_sessions.lock().await;
			if !running.insert(key) {
				return Err(ZiError::Session(SessionError::AlreadyRunning {
					local_tree: local_tree_uuid.to_string(),
					remote_tree: remote_tree_uuid.to_string(),
				}));
			}
		}

		let this = self.clone();
		tokio::spawn(async move {
			if let Err(e) = this.run_sync_session(local_tree_uuid, remote_tree_uuid).await {
				tracing::warn!(
					local = %local_tree_uuid,
					remote = %remote_tree_uuid,
					error = %e,
					"sync session failed"
				);
			}
			this.running_sessions.lock().await.remove(&key);
		});
		Ok(())
	}

	async fn run_sync_session(&self, local_tree_uuid: Uuid, remote_tree_uuid: Uuid) -> Result<(), ZiError> {
		let local_tree = self
			.content_store
			.get_tree(&local_tree_uuid)?
			.ok_or_else(|| ZiError::TreeNoEnt { uuid: local_tree_uuid.to_string() })?;
		let remote_tree = self
			.content_store
			.get_tree(&remote_tree_uuid)?
			.ok_or_else(|| ZiError::TreeNoEnt { uuid: remote_tree_uuid.to_string() })?;
		let sync = self
			.content_store
			.get_sync(&local_tree.sync_id)?
			.ok_or_else(|| ZiError::SyncNoEnt { uuid: local_tree.sync_id.to_string() })?;
		let remote_device = self
			.content_store
			.get_device(remote_tree.device_id)?
			.ok_or_else(|| ZiError::DeviceNoEnt { uuid: remote_tree_uuid.to_string() })?;

		let ips = self.content_store.device_ips(remote_device.id)?;
		let ip = ips.first().ok_or_else(|| {
			ZiError::Session(SessionError::Unreachable { device_uuid: remote_device.uuid.to_string() })
		})?;
		let addr = format!("{}:{}", ip.ip, remote_device.route_port);
		let transfer_addr = format!("{}:{}", ip.ip, remote_device.data_port);

		let store = self.path_store_for(local_tree_uuid).await?;
		let mut local_columns: Vec<Uuid> =
			self.content_store.trees_for_sync(&sync.uuid)?.into_iter().map(|t| t.uuid).collect();

		let session_config = SessionConfig {
			local_tree_uuid,
			remote_tree_uuid,
			sync_uuid: sync.uuid,
			tree_root: std::path::PathBuf::from(&local_tree.root),
			is_rdonly: is_rdonly(&sync, &local_tree),
			is_backup_dst: local_tree.backup_type == BackupType::Dst,
			is_backup_src: local_tree.backup_type == BackupType::Src,
		};

		let cancel = self.cancel_token_for_tree(local_tree_uuid).await;
		let key = (local_tree_uuid, remote_tree_uuid);
		let mut since_usn = self.last_seen_usn.lock().await.get(&key).copied().unwrap_or(0);
		let modifier = self.local_device_name();
		let history = scanner::HistorySink {
			content_store: self.content_store.as_ref(),
			tree_uuid: local_tree_uuid,
			backup_type: local_tree.backup_type,
		};

		loop {
			if cancel.is_cancelled() {
				break;
			}
			let outcome = session::run_round(
				&addr,
				&transfer_addr,
				&session_config,
				&store,
				&mut local_columns,
				since_usn,
				&modifier,
				now_ts(),
				&self.monitor,
				&history,
			)
			.await?;

			since_usn = since_usn.max(outcome.last_seen_remote_usn);
			self.last_seen_usn.lock().await.insert(key, since_usn);

			for new_column in &outcome.new_columns {
				self.content_store.put_tree(&Tree {
					uuid: *new_column,
					root: String::new(),
					sync_id: sync.uuid,
					device_id: crate::types::NULL_DEVICE_ID,
					status: TreeStatus::Vclock,
					backup_type: BackupType::None,
					is_enabled: false,
					root_status: RootStatus::Normal,
				})?;
			}

			if !outcome.should_continue {
				break;
			}
		}
		Ok(())
	}

	/// Best-effort fan-out of a freshly-changed [`Device`] row to every
	/// known online peer.
	pub async fn push_device_info(&self, device: Device, syncs: Vec<Sync>) {
		self.fan_out(Message::PushDeviceInfo(PushDeviceInfo { device, syncs })).await;
	}

	/// Best-effort fan-out of a freshly-changed [`Sync`] row.
	pub async fn push_sync_info(&self, sync: Sync, trees: Vec<Tree>) {
		self.fan_out(Message::PushSyncInfo(PushSyncInfo { sync, trees })).await;
	}

	/// Best-effort fan-out of a freshly-changed [`Tree`] row.
	pub async fn push_tree_info(&self, tree: Tree) {
		self.fan_out(Message::PushTreeInfo(PushTreeInfo { tree })).await;
	}

	async fn fan_out(&self, message: Message) {
		let devices = match self.content_store.list_devices() {
			Ok(devices) => devices,
			Err(e) => {
				tracing::warn!(error = %e, "failed to list devices for push fan-out");
				return;
			}
		};
		for device in devices.into_iter().filter(|d| !d.is_mine && d.status == DeviceStatus::Online) {
			let ips = self.content_store.device_ips(device.id).unwrap_or_default();
			for ip in ips {
				let addr = format!("{}:{}", ip.ip, device.route_port);
				match rpc::call(&addr, message.clone()).await {
					Ok(_) => break,
					Err(e) => {
						tracing::debug!(addr = %addr, error = %e, "push fan-out failed, trying next address");
					}
				}
			}
		}
	}

	/// On a local token rotation, tell `device_id` (reached at
	/// `route_port` on each of its known addresses) to forget us.
	pub async fn erase_peer(&self, device_id: u64, route_port: u16) -> Result<(), ZiError> {
		let local_device = self
			.content_store
			.get_device(LOCAL_DEVICE_ID)?
			.ok_or_else(|| ZiError::DeviceNoEnt { uuid: "local".to_string() })?;
		let new_token = self.content_store.get_config(config_keys::MAC_TOKEN)?.unwrap_or_default();
		let message = Message::AnnounceTokenChanged(AnnounceTokenChanged {
			device_uuid: local_device.uuid,
			new_token,
		});

		let ips = self.content_store.device_ips(device_id)?;
		for ip in ips {
			let addr = format!("{}:{}", ip.ip, route_port);
			if let Err(e) = rpc::call(&addr, message.clone()).await {
				tracing::debug!(addr = %addr, error = %e, "erase_peer announce failed");
			}
		}
		Ok(())
	}

	/// Handle an incoming `AnnounceTokenChanged`: the announcing device
	/// rotated its account token, so it is no longer "ours". Demote it and
	/// tear down any `Shared` syncs it created, per token-diff policy.
	fn demote_peer(&self, announce: &AnnounceTokenChanged) -> Result<(), ZiError> {
		tracing::info!(device = %announce.device_uuid, "peer announced a token change");
		let devices = self.content_store.list_devices()?;
		let Some(mut device) = devices.into_iter().find(|d| d.uuid == announce.device_uuid) else {
			return Ok(());
		};
		if device.is_mine {
			device.is_mine = false;
			self.content_store.put_device(&device)?;
		}

		for mut sync in self.content_store.list_syncs()? {
			if sync.ty != SyncType::Shared
				|| sync.status != EntityStatus::Normal
				|| sync.creator_device_id != device.id
				|| sync.perm == SyncPerm::TokenDiff
			{
				continue;
			}
			sync.restore_share_perm = Some(sync.perm);
			sync.perm = SyncPerm::TokenDiff;
			self.content_store.put_sync(&sync)?;
		}
		Ok(())
	}

	/// Batch discovery of peers sharing any of `sync_uuid_sha1`. The
	/// returned future is the "result handle" the caller consumes.
	pub async fn discover_device(&self, sync_uuid_sha1: Vec<String>) -> Result<Vec<PeerAddr>, ZiError> {
		self.discovery.search_sync(&sync_uuid_sha1).await
	}

	/// Accept RPC connections on `bind_addr` until shutdown. Each connection
	/// carries exactly one request/reply pair, mirroring [`rpc::call`].
	pub async fn serve(self: &Arc<Self>, bind_addr: &str) -> Result<(), ZiError> {
		let listener = TcpListener::bind(bind_addr).await?;
		self.serve_listener(listener).await
	}

	/// Bind an OS-assigned loopback port and start serving it in the
	/// background, returning the bound address so a caller (a test, or a
	/// peer advertising itself before its `route_port` is known) can reach
	/// it immediately.
	pub async fn serve_loopback(
		self: &Arc<Self>,
	) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<Result<(), ZiError>>), ZiError> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		let this = self.clone();
		let handle = tokio::spawn(async move { this.serve_listener(listener).await });
		Ok((addr, handle))
	}

	/// Accept file-transfer connections on `bind_addr` (the device's
	/// `data_port`) until shutdown. Each connection names the tree it wants
	/// up front; see [`crate::transfer::server`].
	pub async fn serve_transfer(self: &Arc<Self>, bind_addr: &str) -> Result<(), ZiError> {
		let listener = TcpListener::bind(bind_addr).await?;
		self.serve_transfer_listener(listener).await
	}

	/// Loopback counterpart of [`Self::serve_transfer`], for tests and for
	/// advertising a data port before it is otherwise known.
	pub async fn serve_transfer_loopback(
		self: &Arc<Self>,
	) -> Result<(std::net::SocketAddr, tokio::task::JoinHandle<Result<(), ZiError>>), ZiError> {
		let listener = TcpListener::bind("127.0.0.1:0").await?;
		let addr = listener.local_addr()?;
		let this = self.clone();
		let handle = tokio::spawn(async move { this.serve_transfer_listener(listener).await });
		Ok((addr, handle))
	}

	async fn serve_transfer_listener(self: &Arc<Self>, listener: TcpListener) -> Result<(), ZiError> {
		let local_addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
		tracing::info!(addr = %local_addr, "listening for peer transfer connections");
		loop {
			tokio::select! {
				_ = self.global_cancel.cancelled() => break,
				accepted = listener.accept() => {
					let (mut stream, peer_addr) = accepted?;
					let this = self.clone();
					tokio::spawn(async move {
						let resolve = {
							let content_store = this.content_store.clone();
							move |tree_uuid: Uuid| {
								content_store.get_tree(&tree_uuid).ok().flatten().map(|t| std::path::PathBuf::from(t.root))
							}
						};
						if let Err(e) = crate::transfer::server::serve_connection(&mut stream, resolve).await {
							tracing::debug!(peer = %peer_addr, error = %e, "transfer connection error");
						}
					});
				}
			}
		}
		Ok(())
	}

	async fn serve_listener(self: &Arc<Self>, listener: TcpListener) -> Result<(), ZiError> {
		let local_addr = listener.local_addr().map(|a| a.to_string()).unwrap_or_default();
		tracing::info!(addr = %local_addr, "listening for peer RPC connections");
		loop {
			tokio::select! {
				_ = self.global_cancel.cancelled() => break,
				accepted = listener.accept() => {
					let (stream, peer_addr) = accepted?;
					let this = self.clone();
					tokio::spawn(async move {
						if let Err(e) = this.handle_connection(stream).await {
							tracing::debug!(peer = %peer_addr, error = %e, "rpc connection error");
						}
					});
				}
			}
		}
		Ok(())
	}

	async fn handle_connection(&self, mut stream: TcpStream) -> Result<(), ZiError> {
		let message = rpc::read_frame(&mut stream).await?;
		let reply = self.handle_message(message).await?;
		rpc::write_frame(&mut stream, &reply).await
	}

	async fn handle_message(&self, message: Message) -> Result<Message, ZiError> {
		match message {
			Message::Find(request) => Ok(Message::FindReply(self.handle_find(request).await?)),
			Message::PushDeviceInfo(info) => {
				self.content_store.put_device(&info.device)?;
				for sync in info.syncs {
					self.content_store.put_sync(&sync)?;
				}
				Ok(Message::Ack)
			}
			Message::PushSyncInfo(info) => {
				self.content_store.put_sync(&info.sync)?;
				for tree in info.trees {
					self.content_store.put_tree(&tree)?;
				}
				Ok(Message::Ack)
			}
			Message::PushTreeInfo(info) => {
				self.content_store.put_tree(&info.tree)?;
				Ok(Message::Ack)
			}
			Message::AnnounceTokenChanged(announce) => {
				self.demote_peer(&announce)?;
				Ok(Message::Ack)
			}
			_ => Ok(Message::Ack),
		}
	}

	/// Answer a `Find` against our own copy of `request.remote_tree_uuid`
	/// (the tree being asked about, from the caller's point of view).
	async fn handle_find(&self, request: FindRequest) -> Result<FindReply, ZiError> {
		let tree = self
			.content_store
			.get_tree(&request.remote_tree_uuid)?
			.ok_or_else(|| ZiError::TreeNoEnt { uuid: request.remote_tree_uuid.to_string() })?;
		let store = self.path_store_for(tree.uuid).await?;
		let records = store.query_since(request.since_usn, request.limit)?;

		let mut uuids = vec![tree.uuid];
		for other in self.content_store.trees_for_sync(&tree.sync_id)? {
			if other.uuid != tree.uuid && !uuids.contains(&other.uuid) {
				uuids.push(other.uuid);
			}
		}

		let stats = records
			.into_iter()
			.map(|record| FileStat { path: record.path.clone(), vclock: record.vclock(), record })
			.collect();
		Ok(FindReply { uuids, stats })
	}
}


// vim: ts=4
