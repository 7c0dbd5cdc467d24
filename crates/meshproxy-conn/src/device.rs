// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Access to an already-running WireGuard interface.
//!
//! The proxy never creates or configures interfaces. It reads the listen
//! port and per-peer state, and repoints peer endpoints.

use crate::error::{ConnError, Result};
use async_trait::async_trait;
use meshproxy_common::WgPublicKey;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
	pub listen_port: u16,
	pub public_key: Option<WgPublicKey>,
	pub peers: Vec<DevicePeer>,
}

impl DeviceInfo {
	pub fn peer(&self, key: &WgPublicKey) -> Option<&DevicePeer> {
		self.peers.iter().find(|p| p.public_key == *key)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePeer {
	pub public_key: WgPublicKey,
	pub endpoint: Option<SocketAddr>,
	pub persistent_keepalive: Option<u16>,
	pub rx_bytes: u64,
	pub tx_bytes: u64,
	pub last_handshake: Option<SystemTime>,
}

impl DevicePeer {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			endpoint: None,
			persistent_keepalive: None,
			rx_bytes: 0,
			tx_bytes: 0,
			last_handshake: None,
		}
	}
}

#[async_trait]
pub trait WgDevice: Send + Sync {
	async fn device(&self, iface: &str) -> Result<DeviceInfo>;

	async fn peer(&self, iface: &str, key: &WgPublicKey) -> Result<Option<DevicePeer>> {
		let info = self.device(iface).await?;
		Ok(info.peers.into_iter().find(|p| p.public_key == *key))
	}

	/// Replaces the endpoint (and keepalive, when given) of an existing peer.
	async fn set_peer_endpoint(
		&self,
		iface: &str,
		key: &WgPublicKey,
		endpoint: SocketAddr,
		keepalive: Option<u16>,
	) -> Result<()>;
}

/// Talks the cross-platform WireGuard userspace API over
/// `<dir>/<iface>.sock`.
#[derive(Debug, Clone)]
pub struct UapiDevice {
	socket_dir: PathBuf,
}

pub const DEFAULT_UAPI_DIR: &str = "/var/run/wireguard";

impl Default for UapiDevice {
	fn default() -> Self {
		Self::new(DEFAULT_UAPI_DIR)
	}
}

impl UapiDevice {
	pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
		Self {
			socket_dir: socket_dir.into(),
		}
	}

	pub fn socket_path(&self, iface: &str) -> PathBuf {
		self.socket_dir.join(format!("{iface}.sock"))
	}

	#[cfg(unix)]
	async fn exchange(&self, iface: &str, request: &str) -> Result<String> {
		use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
		use tokio::net::UnixStream;

		let path = self.socket_path(iface);
		let mut stream = match UnixStream::connect(&path).await {
			Ok(s) => s,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
				return Err(ConnError::InterfaceNotFound(iface.to_string()))
			}
			Err(e) => return Err(e.into()),
		};
		stream.write_all(request.as_bytes()).await?;

		let mut reader = BufReader::new(stream);
		let mut response = String::new();
		loop {
			let mut line = String::new();
			let n = reader.read_line(&mut line).await?;
			if n == 0 || line == "\n" {
				break;
			}
			response.push_str(&line);
		}
		Ok(response)
	}

	#[cfg(not(unix))]
	async fn exchange(&self, _iface: &str, _request: &str) -> Result<String> {
		Err(ConnError::Io(std::io::Error::new(
			std::io::ErrorKind::Unsupported,
			"UAPI sockets require a unix platform",
		)))
	}
}

#[async_trait]
impl WgDevice for UapiDevice {
	async fn device(&self, iface: &str) -> Result<DeviceInfo> {
		let response = self.exchange(iface, "get=1\n\n").await?;
		parse_get_response(&response)
	}

	async fn set_peer_endpoint(
		&self,
		iface: &str,
		key: &WgPublicKey,
		endpoint: SocketAddr,
		keepalive: Option<u16>,
	) -> Result<()> {
		let request = build_set_endpoint(key, endpoint, keepalive);
		let response = self.exchange(iface, &request).await?;
		check_errno(&response)
	}
}

pub fn build_set_endpoint(key: &WgPublicKey, endpoint: SocketAddr, keepalive: Option<u16>) -> String {
	let mut request = format!(
		"set=1\npublic_key={}\nupdate_only=true\nendpoint={}\n",
		key.to_hex(),
		endpoint
	);
	if let Some(secs) = keepalive {
		request.push_str(&format!("persistent_keepalive_interval={secs}\n"));
	}
	request.push('\n');
	request
}

fn check_errno(response: &str) -> Result<()> {
	for line in response.lines() {
		if let Some(value) = line.strip_prefix("errno=") {
			let errno: i32 = value
				.trim()
				.parse()
				.map_err(|_| ConnError::MalformedUapi(line.to_string()))?;
			if errno != 0 {
				return Err(ConnError::DeviceErrno(errno));
			}
			return Ok(());
		}
	}
	Err(ConnError::MalformedUapi("missing errno".to_string()))
}

/// Parses the key=value listing returned by `get=1`.
pub fn parse_get_response(response: &str) -> Result<DeviceInfo> {
	check_errno(response)?;

	let mut info = DeviceInfo::default();
	let mut current: Option<DevicePeer> = None;
	let mut handshake_secs: u64 = 0;

	let malformed = |line: &str| ConnError::MalformedUapi(line.to_string());

	for line in response.lines() {
		let Some((key, value)) = line.split_once('=') else {
			continue;
		};

		match key {
			"listen_port" => info.listen_port = value.parse().map_err(|_| malformed(line))?,
			"public_key" => {
				if let Some(peer) = current.take() {
					info.peers.push(peer);
				}
				current = Some(DevicePeer::new(WgPublicKey::from_hex(value)?));
				handshake_secs = 0;
			}
			_ => {
				let Some(peer) = current.as_mut() else {
					continue;
				};
				match key {
					"endpoint" => peer.endpoint = Some(value.parse().map_err(|_| malformed(line))?),
					"persistent_keepalive_interval" => {
						let secs: u16 = value.parse().map_err(|_| malformed(line))?;
						peer.persistent_keepalive = (secs > 0).then_some(secs);
					}
					"rx_bytes" => peer.rx_bytes = value.parse().map_err(|_| malformed(line))?,
					"tx_bytes" => peer.tx_bytes = value.parse().map_err(|_| malformed(line))?,
					"last_handshake_time_sec" => {
						handshake_secs = value.parse().map_err(|_| malformed(line))?;
						peer.last_handshake =
							(handshake_secs > 0).then(|| UNIX_EPOCH + Duration::from_secs(handshake_secs));
					}
					"last_handshake_time_nsec" => {
						let nanos: u64 = value.parse().map_err(|_| malformed(line))?;
						if handshake_secs > 0 {
							peer.last_handshake = Some(
								UNIX_EPOCH + Duration::from_secs(handshake_secs) + Duration::from_nanos(nanos),
							);
						}
					}
					_ => {}
				}
			}
		}
	}

	if let Some(peer) = current.take() {
		info.peers.push(peer);
	}

	Ok(info)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(b: u8) -> WgPublicKey {
		WgPublicKey::from_bytes([b; 32])
	}

	#[test]
	fn test_parse_get_response() {
		let response = format!(
			"private_key={}\nlisten_port=51820\npublic_key={}\nendpoint=127.0.0.1:40001\n\
			 persistent_keepalive_interval=25\nrx_bytes=100\ntx_bytes=200\n\
			 last_handshake_time_sec=1700000000\nlast_handshake_time_nsec=0\n\
			 public_key={}\npersistent_keepalive_interval=0\nerrno=0\n",
			"00".repeat(32),
			key(1).to_hex(),
			key(2).to_hex(),
		);

		let info = parse_get_response(&response).unwrap();
		assert_eq!(info.listen_port, 51820);
		assert_eq!(info.peers.len(), 2);

		let first = info.peer(&key(1)).unwrap();
		assert_eq!(first.endpoint, Some("127.0.0.1:40001".parse().unwrap()));
		assert_eq!(first.persistent_keepalive, Some(25));
		assert_eq!(first.rx_bytes, 100);
		assert_eq!(first.tx_bytes, 200);
		assert!(first.last_handshake.is_some());

		let second = info.peer(&key(2)).unwrap();
		assert_eq!(second.endpoint, None);
		assert_eq!(second.persistent_keepalive, None);
		assert_eq!(second.last_handshake, None);
	}

	#[test]
	fn test_parse_reports_errno() {
		let err = parse_get_response("errno=19\n").unwrap_err();
		assert!(matches!(err, ConnError::DeviceErrno(19)));
	}

	#[test]
	fn test_build_set_endpoint() {
		let request = build_set_endpoint(&key(3), "[fd00::1]:51722".parse().unwrap(), Some(20));
		assert!(request.starts_with("set=1\n"));
		assert!(request.contains(&format!("public_key={}\n", key(3).to_hex())));
		assert!(request.contains("update_only=true\n"));
		assert!(request.contains("endpoint=[fd00::1]:51722\n"));
		assert!(request.ends_with("persistent_keepalive_interval=20\n\n"));
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn test_uapi_device_over_socket() {
		use tokio::io::{AsyncReadExt, AsyncWriteExt};
		use tokio::net::UnixListener;

		let dir = tempfile::tempdir().unwrap();
		let device = UapiDevice::new(dir.path());
		let listener = UnixListener::bind(device.socket_path("nm0")).unwrap();
		let peer_hex = key(7).to_hex();

		let server = tokio::spawn(async move {
			let (mut stream, _) = listener.accept().await.unwrap();
			let mut buf = [0u8; 64];
			let n = stream.read(&mut buf).await.unwrap();
			assert_eq!(&buf[..n], b"get=1\n\n");
			let reply = format!("listen_port=51821\npublic_key={peer_hex}\nendpoint=10.0.0.2:51820\nerrno=0\n\n");
			stream.write_all(reply.as_bytes()).await.unwrap();
		});

		let peer = device.peer("nm0", &key(7)).await.unwrap().unwrap();
		assert_eq!(peer.endpoint, Some("10.0.0.2:51820".parse().unwrap()));
		server.await.unwrap();
	}

	#[cfg(unix)]
	#[tokio::test]
	async fn test_missing_interface() {
		let dir = tempfile::tempdir().unwrap();
		let device = UapiDevice::new(dir.path());
		let err = device.device("nm9").await.unwrap_err();
		assert!(matches!(err, ConnError::InterfaceNotFound(name) if name == "nm9"));
	}
}
