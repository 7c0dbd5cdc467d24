// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Header prepended to every datagram a peer connection sends through the
//! proxy socket.
//!
//! ```text
//! +--------+------------------+--------------------+---------------------+
//! | "MPRX" | sender key (32)  | receiver key (32)  | WireGuard payload   |
//! +--------+------------------+--------------------+---------------------+
//! ```

use crate::error::{ConnError, Result};
use meshproxy_common::keys::KEY_LEN;
use meshproxy_common::WgPublicKey;

pub const PROXY_MAGIC: [u8; 4] = *b"MPRX";
pub const HEADER_LEN: usize = PROXY_MAGIC.len() + 2 * KEY_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
	pub sender: WgPublicKey,
	pub receiver: WgPublicKey,
}

impl ProxyHeader {
	pub fn new(sender: WgPublicKey, receiver: WgPublicKey) -> Self {
		Self { sender, receiver }
	}

	pub fn wrap(&self, payload: &[u8]) -> Vec<u8> {
		let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
		buf.extend_from_slice(&PROXY_MAGIC);
		buf.extend_from_slice(self.sender.as_bytes());
		buf.extend_from_slice(self.receiver.as_bytes());
		buf.extend_from_slice(payload);
		buf
	}

	/// Splits a datagram into header and payload. `Ok(None)` means the
	/// datagram does not start with the magic and carries no header.
	pub fn parse(data: &[u8]) -> Result<Option<(ProxyHeader, &[u8])>> {
		if !data.starts_with(&PROXY_MAGIC) {
			return Ok(None);
		}
		if data.len() < HEADER_LEN {
			return Err(ConnError::ShortDatagram(data.len()));
		}

		let sender_start = PROXY_MAGIC.len();
		let receiver_start = sender_start + KEY_LEN;
		let sender = WgPublicKey::from_slice(&data[sender_start..receiver_start])?;
		let receiver = WgPublicKey::from_slice(&data[receiver_start..HEADER_LEN])?;

		Ok(Some((ProxyHeader { sender, receiver }, &data[HEADER_LEN..])))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use proptest::prelude::*;

	#[test]
	fn test_header_len() {
		assert_eq!(HEADER_LEN, 68);
	}

	#[test]
	fn test_plain_wireguard_datagram_has_no_header() {
		// WireGuard handshake initiation starts with type 1.
		let data = [1u8, 0, 0, 0, 9, 9, 9];
		assert!(ProxyHeader::parse(&data).unwrap().is_none());
	}

	#[test]
	fn test_truncated_header_is_error() {
		let mut data = PROXY_MAGIC.to_vec();
		data.extend_from_slice(&[0u8; 10]);
		assert!(matches!(
			ProxyHeader::parse(&data),
			Err(ConnError::ShortDatagram(14))
		));
	}

	proptest! {
		#[test]
		fn wrapped_payload_parses_back(
			sender in prop::array::uniform32(any::<u8>()),
			receiver in prop::array::uniform32(any::<u8>()),
			payload in prop::collection::vec(any::<u8>(), 0..256),
		) {
			let header = ProxyHeader::new(WgPublicKey::from_bytes(sender), WgPublicKey::from_bytes(receiver));
			let wrapped = header.wrap(&payload);
			let (parsed, body) = ProxyHeader::parse(&wrapped).unwrap().unwrap();
			prop_assert_eq!(parsed, header);
			prop_assert_eq!(body, &payload[..]);
		}
	}
}
