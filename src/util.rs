//! Small helpers shared across the sync engine: content hashing and its
//! base64 wire encoding.

use base64::engine::Engine;

/// Hash a buffer using BLAKE3 and return base64-encoded result
pub fn hash(buf: &[u8]) -> String {
	let hash = blake3::hash(buf);
	hash_to_base64(hash.as_bytes())
}

/// Convert binary hash to base64 string (for protocol transmission)
pub fn hash_to_base64(hash: &[u8; 32]) -> String {
	base64::engine::general_purpose::URL_SAFE.encode(hash)
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn test_hash_simple() {
		let src: [u8; 2] = [b'1', b'2'];
		let res = hash(&src);
		// BLAKE3 hashes are 44 base64 characters (32 bytes encoded)
		assert_eq!(res.len(), 44);
		// Verify the hash is consistent
		let res2 = hash(&src);
		assert_eq!(res, res2);
	}

	#[test]
	fn test_hash_empty() {
		let src: [u8; 0] = [];
		let res = hash(&src);
		// BLAKE3 hashes are 44 base64 characters
		assert_eq!(res.len(), 44);
		// Verify empty input produces consistent hash
		let res2 = hash(&src);
		assert_eq!(res, res2);
	}

	#[test]
	fn test_hash_longer_text() {
		let src = b"The quick brown fox jumps over the lazy dog";
		let res = hash(src);
		// BLAKE3 hashes are 44 base64 characters (32 bytes encoded)
		assert_eq!(res.len(), 44);
	}

	#[test]
	fn test_hash_consistency() {
		let src = b"test data";
		let res1 = hash(src);
		let res2 = hash(src);
		assert_eq!(res1, res2, "Hash should be deterministic");
	}

	#[test]
	fn test_hash_different_inputs() {
		let src1 = b"test1";
		let src2 = b"test2";
		let res1 = hash(src1);
		let res2 = hash(src2);
		assert_ne!(res1, res2, "Different inputs should produce different hashes");
	}
}

// vim: ts=4
