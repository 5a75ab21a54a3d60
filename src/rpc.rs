//! The small RPC protocol peers speak to each other: `Find`/`FindFile` for
//! sync sessions, `Push*Info` for authoritative state broadcast,
//! `AnnounceTokenChanged` for token rotation.
//!
//! Wire format is unspecified by the design; this implementation frames
//! `serde_json` messages behind a `u32` big-endian length prefix over TCP,
//! the same shape as the teacher's stdin/stdout line protocol generalized
//! to a length-delimited frame (see DESIGN.md).

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::error::{DiscoveryError, ZiError};
use crate::types::{Device, Sync, Tree};

/// Maximum frame size accepted from a peer; guards against a malformed or
/// hostile length prefix forcing an unbounded allocation.
const MAX_FRAME_BYTES: u32 = 64 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindRequest {
	pub since_usn: u64,
	pub limit: usize,
	pub local_tree_uuid: Uuid,
	pub remote_tree_uuid: Uuid,
	pub sync_uuid: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStat {
	pub path: String,
	pub vclock: Vec<i32>,
	pub record: crate::types::FileRecord,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindReply {
	/// Column basis for every `stats[].vclock`; `uuids[0] == remote_tree_uuid`.
	pub uuids: Vec<Uuid>,
	pub stats: Vec<FileStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindFileRequest {
	pub sync_uuid: Uuid,
	pub relative_path: String,
	pub local_tree_uuid: Option<Uuid>,
	pub remote_tree_uuid: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FindFileReply {
	pub stat: Option<FileStat>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushDeviceInfo {
	pub device: Device,
	pub syncs: Vec<Sync>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushSyncInfo {
	pub sync: Sync,
	pub trees: Vec<Tree>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushTreeInfo {
	pub tree: Tree,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceTokenChanged {
	pub device_uuid: Uuid,
	pub new_token: String,
}

/// Every message a peer can send, one variant per RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
	Find(FindRequest),
	FindReply(FindReply),
	FindFile(FindFileRequest),
	FindFileReply(FindFileReply),
	PushDeviceInfo(PushDeviceInfo),
	PushSyncInfo(PushSyncInfo),
	PushTreeInfo(PushTreeInfo),
	AnnounceTokenChanged(AnnounceTokenChanged),
	/// Acknowledges a `Push*`/`Announce*` message with no reply payload of its own.
	Ack,
}

/// Write one length-prefixed JSON frame.
pub async fn write_frame(stream: &mut TcpStream, message: &Message) -> Result<(), ZiError> {
	let body = serde_json::to_vec(message)
		.map_err(|e| ZiError::Discovery(DiscoveryError::Transport { message: e.to_string() }))?;
	let len = u32::try_from(body.len())
		.map_err(|_| ZiError::Discovery(DiscoveryError::Transport { message: "frame too large".into() }))?;
	stream.write_all(&len.to_be_bytes()).await?;
	stream.write_all(&body).await?;
	stream.flush().await?;
	Ok(())
}

/// Read one length-prefixed JSON frame.
pub async fn read_frame(stream: &mut TcpStream) -> Result<Message, ZiError> {
	let mut len_bytes = [0u8; 4];
	stream.read_exact(&mut len_bytes).await?;
	let len = u32::from_be_bytes(len_bytes);
	if len > MAX_FRAME_BYTES {
		return Err(ZiError::Discovery(DiscoveryError::Transport {
			message: format!("frame of {} bytes exceeds cap", len),
		}));
	}
	let mut body = vec![0u8; len as usize];
	stream.read_exact(&mut body).await?;
	serde_json::from_slice(&body)
		.map_err(|e| ZiError::Discovery(DiscoveryError::Transport { message: e.to_string() }))
}

/// One RPC call over a fresh TCP connection: connect, send, await the reply.
pub async fn call(addr: &str, message: Message) -> Result<Message, ZiError> {
	let mut stream = TcpStream::connect(addr)
		.await
		.map_err(|e| ZiError::Discovery(DiscoveryError::Transport { message: e.to_string() }))?;
	write_frame(&mut stream, &message).await?;
	read_frame(&mut stream).await
}


// vim: ts=4
