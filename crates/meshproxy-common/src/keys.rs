// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const KEY_LEN: usize = 32;

#[derive(Error, Debug)]
pub enum KeyError {
	#[error("invalid key length: expected 32 bytes, got {0}")]
	InvalidLength(usize),

	#[error("invalid base64 encoding: {0}")]
	InvalidBase64(#[from] base64::DecodeError),

	#[error("invalid hex encoding: {0}")]
	InvalidHex(#[from] hex::FromHexError),
}

pub type Result<T> = std::result::Result<T, KeyError>;

/// WireGuard public key. Peers are identified by it everywhere in the proxy.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WgPublicKey {
	bytes: [u8; KEY_LEN],
}

impl WgPublicKey {
	pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
		Self { bytes }
	}

	pub fn from_slice(slice: &[u8]) -> Result<Self> {
		let bytes: [u8; KEY_LEN] = slice
			.try_into()
			.map_err(|_| KeyError::InvalidLength(slice.len()))?;
		Ok(Self { bytes })
	}

	/// Accepts both the padded form `wg` prints and the unpadded form.
	pub fn from_base64(s: &str) -> Result<Self> {
		let s = s.trim();
		let decoded = if s.ends_with('=') {
			STANDARD.decode(s)?
		} else {
			STANDARD_NO_PAD.decode(s)?
		};
		Self::from_slice(&decoded)
	}

	/// UAPI speaks hex keys.
	pub fn from_hex(s: &str) -> Result<Self> {
		let decoded = hex::decode(s.trim())?;
		Self::from_slice(&decoded)
	}

	pub fn to_base64(&self) -> String {
		STANDARD.encode(self.bytes)
	}

	pub fn to_hex(&self) -> String {
		hex::encode(self.bytes)
	}

	pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
		&self.bytes
	}
}

impl fmt::Debug for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let b64 = self.to_base64();
		f.debug_tuple("WgPublicKey")
			.field(&format!("{}...", &b64[..8]))
			.finish()
	}
}

impl fmt::Display for WgPublicKey {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.to_base64())
	}
}

impl FromStr for WgPublicKey {
	type Err = KeyError;

	fn from_str(s: &str) -> Result<Self> {
		Self::from_base64(s)
	}
}

impl Serialize for WgPublicKey {
	fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		serializer.serialize_str(&self.to_base64())
	}
}

impl<'de> Deserialize<'de> for WgPublicKey {
	fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
	where
		D: Deserializer<'de>,
	{
		let s = String::deserialize(deserializer)?;
		Self::from_base64(&s).map_err(serde::de::Error::custom)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn base64_padded_and_unpadded_agree() {
		let key = WgPublicKey::from_bytes([7u8; 32]);
		let padded = key.to_base64();
		assert!(padded.ends_with('='));

		let unpadded = padded.trim_end_matches('=');
		assert_eq!(WgPublicKey::from_base64(&padded).unwrap(), key);
		assert_eq!(WgPublicKey::from_base64(unpadded).unwrap(), key);
	}

	#[test]
	fn rejects_short_key() {
		let err = WgPublicKey::from_hex("abcd").unwrap_err();
		assert!(matches!(err, KeyError::InvalidLength(2)));
	}

	#[test]
	fn debug_does_not_print_whole_key() {
		let key = WgPublicKey::from_bytes([1u8; 32]);
		let debug = format!("{:?}", key);
		assert!(debug.contains("..."));
		assert!(!debug.contains(&key.to_base64()));
	}

	#[test]
	fn usable_as_json_map_key() {
		let key = WgPublicKey::from_bytes([9u8; 32]);
		let mut map = std::collections::HashMap::new();
		map.insert(key, 1u8);

		let json = serde_json::to_string(&map).unwrap();
		let back: std::collections::HashMap<WgPublicKey, u8> = serde_json::from_str(&json).unwrap();
		assert_eq!(back.get(&key), Some(&1));
	}

	proptest! {
		#[test]
		fn hex_parses_any_key(bytes in prop::array::uniform32(any::<u8>())) {
			let key = WgPublicKey::from_bytes(bytes);
			prop_assert_eq!(WgPublicKey::from_hex(&key.to_hex()).unwrap(), key);
		}
	}
}
