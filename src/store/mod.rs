//! Persisted state: one [`content_store`] database plus one [`path_store`]
//! database per tree.

pub mod content_store;
pub mod path_store;

use bincode::config::Configuration;

/// Shared bincode configuration for all redb values in the store.
pub fn codec() -> Configuration {
	bincode::config::standard()
}

pub(crate) fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, crate::error::StoreError> {
	bincode::serde::encode_to_vec(value, codec())
		.map_err(|e| crate::error::StoreError::Codec { message: e.to_string() })
}

pub(crate) fn decode<T: serde::de::DeserializeOwned>(
	bytes: &[u8],
) -> Result<T, crate::error::StoreError> {
	bincode::serde::decode_from_slice(bytes, codec())
		.map(|(value, _)| value)
		.map_err(|e| crate::error::StoreError::Codec { message: e.to_string() })
}

// vim: ts=4
