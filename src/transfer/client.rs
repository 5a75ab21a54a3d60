//! Transfer client: requests a [`TransferTask`]'s files from a peer,
//! verifies each against its expected hash, and reports progress through a
//! [`TaskMonitor`].

use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use super::{ItemOutcome, TaskMonitor, TransferTask};
use crate::error::ZiError;

/// Fetch every item in `task` from `addr`, against the peer's copy of
/// `remote_tree_uuid`, writing each to its `local_temp_path` and verifying
/// against `expected_hash`.
pub async fn run_task(
	task_id: u64,
	addr: &str,
	remote_tree_uuid: Uuid,
	task: &TransferTask,
	monitor: &Arc<dyn TaskMonitor>,
) -> Result<Vec<(String, ItemOutcome)>, ZiError> {
	let mut stream = TcpStream::connect(addr).await?;

	stream.write_all(remote_tree_uuid.as_bytes()).await?;
	let count = u32::try_from(task.items.len())
		.map_err(|_| ZiError::Other { message: "transfer task too large".into() })?;
	stream.write_all(&count.to_be_bytes()).await?;
	for item in &task.items {
		write_path(&mut stream, &item.remote_path).await?;
	}

	let mut results = Vec::with_capacity(task.items.len());
	for item in &task.items {
		let outcome = fetch_one(task_id, &mut stream, item, monitor).await;
		match &outcome {
			ItemOutcome::Transferred => monitor.on_file_transferred(task_id, &item.remote_path),
			ItemOutcome::Failed { message } => {
				monitor.on_file_skipped(task_id, &item.remote_path, message)
			}
		}
		results.push((item.remote_path.clone(), outcome));
	}
	Ok(results)
}

async fn fetch_one(
	task_id: u64,
	stream: &mut TcpStream,
	item: &super::TransferItem,
	monitor: &Arc<dyn TaskMonitor>,
) -> ItemOutcome {
	match fetch_one_inner(task_id, stream, item, monitor).await {
		Ok(outcome) => outcome,
		Err(e) => ItemOutcome::Failed { message: e.to_string() },
	}
}

async fn fetch_one_inner(
	task_id: u64,
	stream: &mut TcpStream,
	item: &super::TransferItem,
	monitor: &Arc<dyn TaskMonitor>,
) -> Result<ItemOutcome, ZiError> {
	let mut len_bytes = [0u8; 8];
	stream.read_exact(&mut len_bytes).await?;
	let length = u64::from_be_bytes(len_bytes);
	if length == u64::MAX {
		return Ok(ItemOutcome::Failed { message: "not found on peer".into() });
	}

	let mut file = File::create(&item.local_temp_path).await?;
	let mut hasher = blake3::Hasher::new();
	let mut remaining = length;
	let mut buf = vec![0u8; 64 * 1024];
	while remaining > 0 {
		let chunk = remaining.min(buf.len() as u64) as usize;
		stream.read_exact(&mut buf[..chunk]).await?;
		file.write_all(&buf[..chunk]).await?;
		hasher.update(&buf[..chunk]);
		remaining -= chunk as u64;
		monitor.on_byte_transferred(task_id, &item.remote_path, chunk as u64);
	}
	file.flush().await?;

	let digest = crate::util::hash_to_base64(hasher.finalize().as_bytes());
	if digest != item.expected_hash {
		return Ok(ItemOutcome::Failed {
			message: format!("hash mismatch: expected {}, got {}", item.expected_hash, digest),
		});
	}
	Ok(ItemOutcome::Transferred)
}

async fn write_path(stream: &mut TcpStream, path: &str) -> Result<(), ZiError> {
	let bytes = path.as_bytes();
	let len = u32::try_from(bytes.len())
		.map_err(|_| ZiError::Other { message: "path too long".into() })?;
	stream.write_all(&len.to_be_bytes()).await?;
	stream.write_all(bytes).await?;
	Ok(())
}


// vim: ts=4
