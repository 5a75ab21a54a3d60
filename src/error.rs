//! Error types for zisync operations

use std::error::Error;
use std::fmt;
use std::io;

use crate::validation::ValidationError;

/// Helper function to reduce `Box::new()` boilerplate when wrapping errors.
#[inline]
pub fn boxed_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
	Box::new(e)
}

/// Unified error type for the sync engine.
///
/// Variants mirror the error kinds the core reports: startup errors,
/// entity-not-found/exists errors, path errors, filesystem/networking
/// anomalies, and the nested domain errors for each subsystem.
#[derive(Debug)]
pub enum ZiError {
	/// Required configuration value is missing.
	ConfigMissing { key: String },
	/// A configured port is not a valid/usable port number.
	InvalidPort { port: u32 },
	/// A listening socket could not bind because the address is in use.
	AddrInUse { addr: String },

	/// No Sync with the given uuid.
	SyncNoEnt { uuid: String },
	/// A Sync with the given uuid already exists.
	SyncExist { uuid: String },
	/// No Tree with the given uuid.
	TreeNoEnt { uuid: String },
	/// A Tree with the given uuid already exists.
	TreeExist { uuid: String },
	/// No Device with the given uuid.
	DeviceNoEnt { uuid: String },
	/// Discovery found nothing for the requested account/sync.
	DiscoverNoEnt,
	/// Discovery result set exceeded its configured cap.
	DiscoverLimit { limit: usize },
	/// A requested download target could not be located on any peer.
	DownloadNoEnt { path: String },

	/// A tree root path does not exist.
	DirNoEnt { path: String },
	/// A path is not valid (empty, non-absolute, contains reserved components).
	InvalidPath { path: String },
	/// A tree root path exists but is not a directory.
	NotDir { path: String },
	/// A new tree root would nest inside (or contain) an existing tree root.
	NestedTree { path: String, existing: String },

	/// Tree root disappeared out from under a live tree.
	RootMoved { tree_uuid: String },

	/// Content hashing failed for a file.
	Sha1Fail { path: String, source: io::Error },
	/// Generic filesystem I/O error.
	OsIo(io::Error),

	/// A network operation exceeded its deadline.
	Timeout,
	/// The peer refused the operation for permission reasons.
	PermissionDeny { what: String },
	/// Peer's account token diverged from ours (token rotation on one side only).
	TokenDiff,

	/// A database invariant was violated; fatal to the current operation.
	Content { message: String },

	/// Vector-clock error (nested).
	VClock(VClockError),
	/// Path/content store error (nested).
	Store(StoreError),
	/// Reconciler error (nested).
	Reconcile(ReconcileError),
	/// Sync session error (nested).
	Session(SessionError),
	/// Discovery/RPC transport error (nested).
	Discovery(DiscoveryError),
	/// Configuration parse error (nested).
	ConfigParse(Box<dyn Error + Send + Sync>),

	/// Generic error message, used sparingly for conditions with no dedicated variant.
	Other { message: String },
}

impl fmt::Display for ZiError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ZiError::ConfigMissing { key } => write!(f, "missing configuration value: {}", key),
			ZiError::InvalidPort { port } => write!(f, "invalid port: {}", port),
			ZiError::AddrInUse { addr } => write!(f, "address already in use: {}", addr),
			ZiError::SyncNoEnt { uuid } => write!(f, "no such sync: {}", uuid),
			ZiError::SyncExist { uuid } => write!(f, "sync already exists: {}", uuid),
			ZiError::TreeNoEnt { uuid } => write!(f, "no such tree: {}", uuid),
			ZiError::TreeExist { uuid } => write!(f, "tree already exists: {}", uuid),
			ZiError::DeviceNoEnt { uuid } => write!(f, "no such device: {}", uuid),
			ZiError::DiscoverNoEnt => write!(f, "discovery found no peers"),
			ZiError::DiscoverLimit { limit } => write!(f, "discovery result capped at {}", limit),
			ZiError::DownloadNoEnt { path } => write!(f, "no peer has file: {}", path),
			ZiError::DirNoEnt { path } => write!(f, "directory does not exist: {}", path),
			ZiError::InvalidPath { path } => write!(f, "invalid path: {}", path),
			ZiError::NotDir { path } => write!(f, "not a directory: {}", path),
			ZiError::NestedTree { path, existing } => {
				write!(f, "tree root {} nests under existing tree root {}", path, existing)
			}
			ZiError::RootMoved { tree_uuid } => write!(f, "tree root moved: {}", tree_uuid),
			ZiError::Sha1Fail { path, source } => {
				write!(f, "failed to hash {}: {}", path, source)
			}
			ZiError::OsIo(e) => write!(f, "I/O error: {}", e),
			ZiError::Timeout => write!(f, "operation timed out"),
			ZiError::PermissionDeny { what } => write!(f, "permission denied: {}", what),
			ZiError::TokenDiff => write!(f, "account token mismatch"),
			ZiError::Content { message } => write!(f, "store invariant violated: {}", message),
			ZiError::VClock(e) => write!(f, "vector clock error: {}", e),
			ZiError::Store(e) => write!(f, "store error: {}", e),
			ZiError::Reconcile(e) => write!(f, "reconcile error: {}", e),
			ZiError::Session(e) => write!(f, "session error: {}", e),
			ZiError::Discovery(e) => write!(f, "discovery error: {}", e),
			ZiError::ConfigParse(e) => write!(f, "configuration parse error: {}", e),
			ZiError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for ZiError {}

impl From<io::Error> for ZiError {
	fn from(e: io::Error) -> Self {
		ZiError::OsIo(e)
	}
}

impl From<String> for ZiError {
	fn from(e: String) -> Self {
		ZiError::Other { message: e }
	}
}

impl From<VClockError> for ZiError {
	fn from(e: VClockError) -> Self {
		ZiError::VClock(e)
	}
}

impl From<StoreError> for ZiError {
	fn from(e: StoreError) -> Self {
		ZiError::Store(e)
	}
}

impl From<ReconcileError> for ZiError {
	fn from(e: ReconcileError) -> Self {
		ZiError::Reconcile(e)
	}
}

impl From<SessionError> for ZiError {
	fn from(e: SessionError) -> Self {
		ZiError::Session(e)
	}
}

impl From<DiscoveryError> for ZiError {
	fn from(e: DiscoveryError) -> Self {
		ZiError::Discovery(e)
	}
}

impl From<ValidationError> for ZiError {
	fn from(e: ValidationError) -> Self {
		match e {
			ValidationError::PathError(message) => ZiError::InvalidPath { path: message },
			ValidationError::ConfigError(message) => ZiError::ConfigMissing { key: message },
			other => ZiError::Other { message: other.to_string() },
		}
	}
}

impl From<redb::Error> for ZiError {
	fn from(e: redb::Error) -> Self {
		ZiError::Store(StoreError::Backend { message: e.to_string() })
	}
}

impl From<redb::TransactionError> for ZiError {
	fn from(e: redb::TransactionError) -> Self {
		ZiError::Store(StoreError::Backend { message: e.to_string() })
	}
}

impl From<redb::TableError> for ZiError {
	fn from(e: redb::TableError) -> Self {
		ZiError::Store(StoreError::Backend { message: e.to_string() })
	}
}

impl From<redb::StorageError> for ZiError {
	fn from(e: redb::StorageError) -> Self {
		ZiError::Store(StoreError::Backend { message: e.to_string() })
	}
}

impl From<redb::CommitError> for ZiError {
	fn from(e: redb::CommitError) -> Self {
		ZiError::Store(StoreError::Backend { message: e.to_string() })
	}
}

impl From<redb::DatabaseError> for ZiError {
	fn from(e: redb::DatabaseError) -> Self {
		ZiError::Store(StoreError::Backend { message: e.to_string() })
	}
}

/// Vector-clock errors.
#[derive(Debug)]
pub enum VClockError {
	/// A column index referenced a tree that does not exist in the local column set.
	UnknownColumn { index: usize },
	/// Two clocks being compared/merged were remapped into incompatible supersets.
	IncompatibleLengths { a: usize, b: usize },
}

impl fmt::Display for VClockError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			VClockError::UnknownColumn { index } => write!(f, "unknown vclock column {}", index),
			VClockError::IncompatibleLengths { a, b } => {
				write!(f, "incompatible vclock lengths: {} vs {}", a, b)
			}
		}
	}
}

impl Error for VClockError {}

/// Path/content store errors.
#[derive(Debug)]
pub enum StoreError {
	/// Underlying redb operation failed.
	Backend { message: String },
	/// `apply_batch` op's `(id, usn)` precondition did not hold; op was skipped.
	PreconditionFailed { id: u64, expected_usn: u64 },
	/// USN allocator exhausted its range.
	UsnExhausted,
	/// Encoding/decoding a stored record failed.
	Codec { message: String },
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::Backend { message } => write!(f, "backend error: {}", message),
			StoreError::PreconditionFailed { id, expected_usn } => {
				write!(f, "precondition failed for id={} expected_usn={}", id, expected_usn)
			}
			StoreError::UsnExhausted => write!(f, "usn allocator exhausted"),
			StoreError::Codec { message } => write!(f, "codec error: {}", message),
		}
	}
}

impl Error for StoreError {}

/// Reconciler errors.
#[derive(Debug)]
pub enum ReconcileError {
	/// The fetch-and-create sequence (chmod/mtime/rename/store) failed partway through.
	FetchCreateFailed { path: String, message: String },
	/// A conflict rename ran out of numbered suffixes to try (practically unreachable).
	ConflictNameExhausted { path: String },
}

impl fmt::Display for ReconcileError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ReconcileError::FetchCreateFailed { path, message } => {
				write!(f, "fetch & create failed for {}: {}", path, message)
			}
			ReconcileError::ConflictNameExhausted { path } => {
				write!(f, "exhausted conflict-name suffixes for {}", path)
			}
		}
	}
}

impl Error for ReconcileError {}

/// Sync session errors.
#[derive(Debug)]
pub enum SessionError {
	/// Remote device could not be reached on any known IP.
	Unreachable { device_uuid: String },
	/// `Find` reply's `sync_uuid` did not match what the session expected.
	SyncUuidMismatch { expected: String, got: String },
	/// A session is already running for this tree pair.
	AlreadyRunning { local_tree: String, remote_tree: String },
}

impl fmt::Display for SessionError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SessionError::Unreachable { device_uuid } => {
				write!(f, "device {} is unreachable", device_uuid)
			}
			SessionError::SyncUuidMismatch { expected, got } => {
				write!(f, "sync_uuid mismatch: expected {}, got {}", expected, got)
			}
			SessionError::AlreadyRunning { local_tree, remote_tree } => {
				write!(f, "session already running for ({}, {})", local_tree, remote_tree)
			}
		}
	}
}

impl Error for SessionError {}

/// Discovery/RPC transport errors.
#[derive(Debug)]
pub enum DiscoveryError {
	/// The transport has no implementation for this operation (e.g. DHT stub).
	Unimplemented { what: String },
	/// The underlying socket operation failed.
	Transport { message: String },
}

impl fmt::Display for DiscoveryError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			DiscoveryError::Unimplemented { what } => write!(f, "not implemented: {}", what),
			DiscoveryError::Transport { message } => write!(f, "transport error: {}", message),
		}
	}
}

impl Error for DiscoveryError {}

// vim: ts=4
