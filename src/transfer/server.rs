//! Transfer server: serves file bytes for paths a peer's client requests,
//! streaming each as `tree_uuid(16) | path_len | path | file_len | bytes`.
//! A connection names the tree it wants up front since one device may host
//! several trees behind a single data port.

use std::path::{Path, PathBuf};

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use crate::error::ZiError;

/// Accepts one connection, resolves the requested tree's root via
/// `resolve_root`, and streams each requested file back to the caller in order.
pub async fn serve_one(
	listener: &TcpListener,
	resolve_root: impl Fn(Uuid) -> Option<PathBuf>,
) -> Result<(), ZiError> {
	let (mut stream, _) = listener.accept().await?;
	serve_connection(&mut stream, resolve_root).await
}

pub(crate) async fn serve_connection(
	stream: &mut TcpStream,
	resolve_root: impl Fn(Uuid) -> Option<PathBuf>,
) -> Result<(), ZiError> {
	let mut uuid_bytes = [0u8; 16];
	stream.read_exact(&mut uuid_bytes).await?;
	let tree_uuid = Uuid::from_bytes(uuid_bytes);
	let tree_root = resolve_root(tree_uuid)
		.ok_or_else(|| ZiError::TreeNoEnt { uuid: tree_uuid.to_string() })?;

	let mut count_bytes = [0u8; 4];
	stream.read_exact(&mut count_bytes).await?;
	let count = u32::from_be_bytes(count_bytes);

	for _ in 0..count {
		let path = read_path(stream).await?;
		let full_path = resolve_under_root(&tree_root, &path)?;

		match File::open(&full_path).await {
			Ok(mut file) => {
				let length = file.metadata().await?.len();
				stream.write_all(&length.to_be_bytes()).await?;
				let mut buf = vec![0u8; 64 * 1024];
				loop {
					let n = file.read(&mut buf).await?;
					if n == 0 {
						break;
					}
					stream.write_all(&buf[..n]).await?;
				}
			}
			Err(_) => {
				// absent on this side: length of u64::MAX signals "not found".
				stream.write_all(&u64::MAX.to_be_bytes()).await?;
			}
		}
	}
	stream.flush().await?;
	Ok(())
}

async fn read_path(stream: &mut TcpStream) -> Result<String, ZiError> {
	let mut len_bytes = [0u8; 4];
	stream.read_exact(&mut len_bytes).await?;
	let len = u32::from_be_bytes(len_bytes) as usize;
	let mut buf = vec![0u8; len];
	stream.read_exact(&mut buf).await?;
	Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn resolve_under_root(tree_root: &Path, relative: &str) -> Result<PathBuf, ZiError> {
	let relative_path = Path::new(relative);
	crate::validation::path::validate_path_relative(relative_path)?;
	crate::validation::path::validate_path_safe(relative_path)?;
	let joined = tree_root.join(relative_path);
	crate::validation::path::validate_path_within_root(&joined, tree_root)?;
	Ok(joined)
}

// vim: ts=4
