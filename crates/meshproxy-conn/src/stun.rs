// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Minimal STUN binding client (RFC 5389). Only the mapped address is read.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

const STUN_TIMEOUT: Duration = Duration::from_secs(2);
const STUN_MAGIC_COOKIE: u32 = 0x2112A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const ADDR_FAMILY_IPV4: u8 = 0x01;
const ADDR_FAMILY_IPV6: u8 = 0x02;

pub const DEFAULT_STUN_SERVERS: &[&str] = &[
	"stun.l.google.com:19302",
	"stun1.l.google.com:19302",
	"stun2.l.google.com:19302",
];

#[derive(Debug, Error)]
pub enum StunError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("timeout waiting for STUN response from {0}")]
	Timeout(SocketAddr),

	#[error("invalid STUN response")]
	InvalidResponse,

	#[error("no STUN servers available")]
	NoServers,
}

pub type Result<T> = std::result::Result<T, StunError>;

/// One successful binding: which server answered and what it saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StunMapping {
	pub server: SocketAddr,
	pub mapped: SocketAddr,
}

fn new_transaction_id() -> [u8; 12] {
	let mut id = [0u8; 12];
	for b in id.iter_mut() {
		*b = fastrand::u8(..);
	}
	id
}

/// Asks every server for the mapped address of `socket`. Servers that do
/// not answer are skipped, so the result may be shorter than the input.
#[instrument(skip(socket, servers), fields(servers = servers.len()))]
pub async fn query_mappings(socket: &UdpSocket, servers: &[SocketAddr]) -> Result<Vec<StunMapping>> {
	if servers.is_empty() {
		return Err(StunError::NoServers);
	}

	let mut mappings = Vec::with_capacity(servers.len());
	for server in servers {
		match query_server(socket, *server).await {
			Ok(mapped) => {
				debug!(%server, %mapped, "STUN mapping");
				mappings.push(StunMapping {
					server: *server,
					mapped,
				});
			}
			Err(e) => warn!(%server, error = %e, "STUN query failed"),
		}
	}

	Ok(mappings)
}

pub async fn query_server(socket: &UdpSocket, server: SocketAddr) -> Result<SocketAddr> {
	let transaction_id = new_transaction_id();
	let request = build_binding_request(&transaction_id);
	socket.send_to(&request, server).await?;

	let mut buf = [0u8; 1024];
	let deadline = tokio::time::Instant::now() + STUN_TIMEOUT;
	loop {
		let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
		let (len, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
			Ok(res) => res?,
			Err(_) => return Err(StunError::Timeout(server)),
		};

		if from != server {
			debug!(%from, expected = %server, "ignoring datagram from unexpected source");
			continue;
		}

		return parse_binding_response(&buf[..len], &transaction_id);
	}
}

pub fn build_binding_request(transaction_id: &[u8; 12]) -> Vec<u8> {
	let mut request = Vec::with_capacity(20);
	request.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
	request.extend_from_slice(&0u16.to_be_bytes());
	request.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
	request.extend_from_slice(transaction_id);
	request
}

pub fn parse_binding_response(data: &[u8], expected_transaction_id: &[u8; 12]) -> Result<SocketAddr> {
	if data.len() < 20 {
		return Err(StunError::InvalidResponse);
	}

	let message_type = u16::from_be_bytes([data[0], data[1]]);
	let message_length = u16::from_be_bytes([data[2], data[3]]) as usize;
	let magic = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);

	if message_type != BINDING_SUCCESS
		|| magic != STUN_MAGIC_COOKIE
		|| &data[8..20] != expected_transaction_id
		|| data.len() < 20 + message_length
	{
		return Err(StunError::InvalidResponse);
	}

	let end = 20 + message_length;
	let mut offset = 20;
	let mut fallback = None;

	while offset + 4 <= end {
		let attr_type = u16::from_be_bytes([data[offset], data[offset + 1]]);
		let attr_length = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
		offset += 4;

		if offset + attr_length > end {
			return Err(StunError::InvalidResponse);
		}

		let value = &data[offset..offset + attr_length];
		match attr_type {
			ATTR_XOR_MAPPED_ADDRESS => {
				if let Some(addr) = parse_mapped_address(value, true) {
					return Ok(addr);
				}
			}
			ATTR_MAPPED_ADDRESS => {
				fallback = fallback.or_else(|| parse_mapped_address(value, false));
			}
			_ => {}
		}

		offset += (attr_length + 3) & !3;
	}

	fallback.ok_or(StunError::InvalidResponse)
}

fn parse_mapped_address(data: &[u8], xor: bool) -> Option<SocketAddr> {
	if data.len() < 4 {
		return None;
	}

	let magic = STUN_MAGIC_COOKIE.to_be_bytes();
	let mut port = u16::from_be_bytes([data[2], data[3]]);
	if xor {
		port ^= (STUN_MAGIC_COOKIE >> 16) as u16;
	}

	match data[1] {
		ADDR_FAMILY_IPV4 if data.len() >= 8 => {
			let mut octets = [data[4], data[5], data[6], data[7]];
			if xor {
				octets.iter_mut().zip(magic).for_each(|(b, m)| *b ^= m);
			}
			Some(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port)))
		}
		ADDR_FAMILY_IPV6 if data.len() >= 20 => {
			let mut octets: [u8; 16] = data[4..20].try_into().ok()?;
			if xor {
				octets.iter_mut().zip(magic).for_each(|(b, m)| *b ^= m);
			}
			Some(SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)))
		}
		_ => None,
	}
}

/// Resolves `host:port` strings, skipping (and logging) the ones that fail.
pub async fn resolve_stun_servers<S: AsRef<str>>(servers: &[S]) -> Vec<SocketAddr> {
	let mut addrs = Vec::new();

	for server in servers {
		let server = server.as_ref();
		match tokio::net::lookup_host(server).await {
			Ok(mut resolved) => match resolved.find(SocketAddr::is_ipv4) {
				Some(addr) => addrs.push(addr),
				None => warn!(server, "STUN server has no IPv4 address"),
			},
			Err(e) => warn!(server, error = %e, "failed to resolve STUN server"),
		}
	}

	addrs
}

#[cfg(test)]
mod tests {
	use super::*;

	fn xor_mapped_response(transaction_id: &[u8; 12], ip: Ipv4Addr, port: u16) -> Vec<u8> {
		let magic = STUN_MAGIC_COOKIE.to_be_bytes();
		let mut response = Vec::new();
		response.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
		response.extend_from_slice(&12u16.to_be_bytes());
		response.extend_from_slice(&magic);
		response.extend_from_slice(transaction_id);

		response.extend_from_slice(&ATTR_XOR_MAPPED_ADDRESS.to_be_bytes());
		response.extend_from_slice(&8u16.to_be_bytes());
		response.push(0x00);
		response.push(ADDR_FAMILY_IPV4);
		response.extend_from_slice(&(port ^ (STUN_MAGIC_COOKIE >> 16) as u16).to_be_bytes());
		for (b, m) in ip.octets().iter().zip(magic) {
			response.push(b ^ m);
		}
		response
	}

	#[test]
	fn test_build_binding_request() {
		let transaction_id = [5u8; 12];
		let request = build_binding_request(&transaction_id);

		assert_eq!(request.len(), 20);
		assert_eq!(&request[0..2], &[0x00, 0x01]);
		assert_eq!(&request[4..8], &STUN_MAGIC_COOKIE.to_be_bytes());
		assert_eq!(&request[8..20], &transaction_id);
	}

	#[test]
	fn test_parse_xor_mapped_ipv4() {
		let id = [1u8; 12];
		let ip = Ipv4Addr::new(203, 0, 113, 1);
		let response = xor_mapped_response(&id, ip, 40100);

		let addr = parse_binding_response(&response, &id).unwrap();
		assert_eq!(addr, SocketAddr::V4(SocketAddrV4::new(ip, 40100)));
	}

	#[test]
	fn test_parse_rejects_wrong_transaction() {
		let response = xor_mapped_response(&[1u8; 12], Ipv4Addr::LOCALHOST, 1);
		assert!(matches!(
			parse_binding_response(&response, &[2u8; 12]),
			Err(StunError::InvalidResponse)
		));
	}

	#[tokio::test]
	async fn test_query_server_against_local_responder() {
		let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let server_addr = server.local_addr().unwrap();
		let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let client_addr = client.local_addr().unwrap();

		let responder = tokio::spawn(async move {
			let mut buf = [0u8; 64];
			let (len, from) = server.recv_from(&mut buf).await.unwrap();
			assert_eq!(len, 20);
			let id: [u8; 12] = buf[8..20].try_into().unwrap();
			let reply = xor_mapped_response(&id, Ipv4Addr::new(198, 51, 100, 4), 41000);
			server.send_to(&reply, from).await.unwrap();
		});

		let mapped = query_server(&client, server_addr).await.unwrap();
		assert_eq!(mapped, "198.51.100.4:41000".parse().unwrap());
		assert_ne!(mapped, client_addr);
		responder.await.unwrap();
	}
}
