// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-peer forwarding.
//!
//! Each proxied peer gets a loopback UDP socket that the WireGuard interface
//! uses as the peer's endpoint, plus a task that owns the socket. Packets
//! from WireGuard are wrapped and queued on the proxy server; payloads the
//! server delivers are written back to WireGuard. Nothing else touches the
//! socket.

use crate::error::Result;
use crate::registry::ProxyRegistry;
use crate::server::{OutboundDatagram, OutboundSender};
use meshproxy_common::WgPublicKey;
use meshproxy_conn::ProxyHeader;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

const INBOUND_QUEUE: usize = 256;
const MAX_DATAGRAM: usize = 65535;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConnConfig {
	pub key: WgPublicKey,
	/// Loopback address WireGuard sends this peer's traffic to.
	pub local_addr: SocketAddr,
	/// Where wrapped datagrams go: the peer's proxy or the relay.
	pub remote_addr: SocketAddr,
	/// The peer's real endpoint as advertised in the update.
	pub peer_endpoint: SocketAddr,
	pub is_relayed: bool,
	pub relayed_to: Option<SocketAddr>,
	pub listen_port: u16,
	pub is_attached_ext_client: bool,
}

/// Mutable part of a connection, guarded by the per-peer mutex.
#[derive(Debug)]
pub struct ConnState {
	cancel: CancellationToken,
	task: Option<JoinHandle<()>>,
	stopped: bool,
}

impl ConnState {
	/// Cancels the forwarding task and releases the socket. Returns false if
	/// the connection was already stopped.
	pub fn stop_conn(&mut self) -> bool {
		if self.stopped {
			return false;
		}
		self.stopped = true;
		self.cancel.cancel();
		if let Some(task) = self.task.take() {
			task.abort();
		}
		true
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped
	}
}

pub struct PeerConnection {
	id: u64,
	config: PeerConnConfig,
	inbound_tx: mpsc::Sender<Vec<u8>>,
	state: Arc<Mutex<ConnState>>,
}

/// What a connection needs besides its own config.
pub struct ConnContext {
	pub registry: Arc<ProxyRegistry>,
	pub outbound: OutboundSender,
	pub wg_listen_port: u16,
	pub parent: CancellationToken,
}

impl PeerConnection {
	/// Binds the loopback socket and spawns the forwarding task. The
	/// `local_addr` in `config` is replaced by the bound address.
	#[instrument(skip(config, ctx), fields(peer = %config.key, remote = %config.remote_addr))]
	pub async fn start(mut config: PeerConnConfig, ctx: &ConnContext) -> Result<Arc<Self>> {
		let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).await?;
		config.local_addr = socket.local_addr()?;

		let id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
		let cancel = ctx.parent.child_token();
		let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
		let state = Arc::new(Mutex::new(ConnState {
			cancel: cancel.clone(),
			task: None,
			stopped: false,
		}));

		let forwarder = Forwarder {
			id,
			key: config.key,
			header: ProxyHeader::new(ctx.registry.local_key(), config.key),
			remote: config.remote_addr,
			wg_addr: SocketAddr::new(Ipv4Addr::LOCALHOST.into(), ctx.wg_listen_port),
			socket,
			inbound_rx,
			outbound: ctx.outbound.clone(),
			cancel,
			state: Arc::clone(&state),
			registry: Arc::clone(&ctx.registry),
		};

		let task = tokio::spawn(forwarder.run());
		state.lock().await.task = Some(task);

		info!(local = %config.local_addr, relayed = config.is_relayed, "started peer connection");

		Ok(Arc::new(Self {
			id,
			config,
			inbound_tx,
			state,
		}))
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn key(&self) -> WgPublicKey {
		self.config.key
	}

	pub fn config(&self) -> &PeerConnConfig {
		&self.config
	}

	pub async fn lock(&self) -> MutexGuard<'_, ConnState> {
		self.state.lock().await
	}

	pub async fn is_stopped(&self) -> bool {
		self.state.lock().await.is_stopped()
	}

	/// Hands a payload received by the proxy server to the forwarding task.
	pub fn deliver(&self, payload: Vec<u8>) {
		if let Err(e) = self.inbound_tx.try_send(payload) {
			trace!(peer = %self.config.key, error = %e, "dropping inbound payload");
		}
	}
}

impl std::fmt::Debug for PeerConnection {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("PeerConnection")
			.field("id", &self.id)
			.field("config", &self.config)
			.finish()
	}
}

struct Forwarder {
	id: u64,
	key: WgPublicKey,
	header: ProxyHeader,
	remote: SocketAddr,
	wg_addr: SocketAddr,
	socket: UdpSocket,
	inbound_rx: mpsc::Receiver<Vec<u8>>,
	outbound: OutboundSender,
	cancel: CancellationToken,
	state: Arc<Mutex<ConnState>>,
	registry: Arc<ProxyRegistry>,
}

impl Forwarder {
	async fn run(mut self) {
		let mut buf = vec![0u8; MAX_DATAGRAM];

		let failed = loop {
			tokio::select! {
				biased;

				_ = self.cancel.cancelled() => break false,

				res = self.socket.recv_from(&mut buf) => match res {
					Ok((len, from)) => {
						trace!(peer = %self.key, len, %from, "from wireguard");
						let datagram = OutboundDatagram {
							dest: self.remote,
							data: self.header.wrap(&buf[..len]),
						};
						if self.outbound.send(datagram).await.is_err() {
							warn!(peer = %self.key, "proxy server gone");
							break true;
						}
					}
					Err(e) => {
						warn!(peer = %self.key, error = %e, "local socket receive failed");
						break true;
					}
				},

				payload = self.inbound_rx.recv() => match payload {
					Some(payload) => {
						if let Err(e) = self.socket.send_to(&payload, self.wg_addr).await {
							warn!(peer = %self.key, error = %e, "failed to write to wireguard");
							break true;
						}
					}
					None => break true,
				},
			}
		};

		if failed {
			self.report_termination().await;
		}
		debug!(peer = %self.key, "forwarding task exited");
	}

	async fn report_termination(&self) {
		let mut state = self.state.lock().await;
		if state.stopped {
			return;
		}
		state.stopped = true;
		state.cancel.cancel();
		state.task = None;
		if self.registry.remove_proxy_peer_if(&self.key, self.id) {
			info!(peer = %self.key, "peer connection terminated, removed from registry");
		}
	}
}

#[derive(Debug)]
pub struct NoProxyState {
	stopped: bool,
}

impl NoProxyState {
	pub fn stop_conn(&mut self) -> bool {
		!std::mem::replace(&mut self.stopped, true)
	}

	pub fn is_stopped(&self) -> bool {
		self.stopped
	}
}

/// A peer WireGuard reaches directly.
#[derive(Debug)]
pub struct NoProxyPeer {
	key: WgPublicKey,
	endpoint: SocketAddr,
	state: Mutex<NoProxyState>,
}

impl NoProxyPeer {
	pub fn new(key: WgPublicKey, endpoint: SocketAddr) -> Self {
		Self {
			key,
			endpoint,
			state: Mutex::new(NoProxyState { stopped: false }),
		}
	}

	pub fn key(&self) -> WgPublicKey {
		self.key
	}

	pub fn endpoint(&self) -> SocketAddr {
		self.endpoint
	}

	pub async fn lock(&self) -> MutexGuard<'_, NoProxyState> {
		self.state.lock().await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use meshproxy_conn::HEADER_LEN;
	use std::time::Duration;
	use tokio::time::timeout;

	fn key(b: u8) -> WgPublicKey {
		WgPublicKey::from_bytes([b; 32])
	}

	fn config(peer: WgPublicKey) -> PeerConnConfig {
		let endpoint: SocketAddr = "203.0.113.20:51820".parse().unwrap();
		PeerConnConfig {
			key: peer,
			local_addr: "127.0.0.1:0".parse().unwrap(),
			remote_addr: "203.0.113.20:51722".parse().unwrap(),
			peer_endpoint: endpoint,
			is_relayed: false,
			relayed_to: None,
			listen_port: 51722,
			is_attached_ext_client: false,
		}
	}

	#[tokio::test]
	async fn test_forwards_both_directions() {
		let wg = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		let registry = Arc::new(ProxyRegistry::new(key(1)));
		let (outbound, mut outbound_rx) = mpsc::channel(8);
		let ctx = ConnContext {
			registry: Arc::clone(&registry),
			outbound,
			wg_listen_port: wg.local_addr().unwrap().port(),
			parent: CancellationToken::new(),
		};

		let conn = PeerConnection::start(config(key(2)), &ctx).await.unwrap();
		assert_ne!(conn.config().local_addr.port(), 0);

		wg.send_to(b"handshake", conn.config().local_addr).await.unwrap();
		let datagram = timeout(Duration::from_secs(2), outbound_rx.recv())
			.await
			.unwrap()
			.unwrap();
		assert_eq!(datagram.dest, conn.config().remote_addr);
		let (header, payload) = ProxyHeader::parse(&datagram.data).unwrap().unwrap();
		assert_eq!(header.sender, key(1));
		assert_eq!(header.receiver, key(2));
		assert_eq!(payload, b"handshake");
		assert_eq!(datagram.data.len(), HEADER_LEN + 9);

		conn.deliver(b"response".to_vec());
		let mut buf = [0u8; 64];
		let (len, from) = timeout(Duration::from_secs(2), wg.recv_from(&mut buf))
			.await
			.unwrap()
			.unwrap();
		assert_eq!(&buf[..len], b"response");
		assert_eq!(from, conn.config().local_addr);
	}

	#[tokio::test]
	async fn test_stop_conn_is_exactly_once() {
		let registry = Arc::new(ProxyRegistry::new(key(1)));
		let (outbound, _outbound_rx) = mpsc::channel(8);
		let ctx = ConnContext {
			registry,
			outbound,
			wg_listen_port: 51820,
			parent: CancellationToken::new(),
		};
		let conn = PeerConnection::start(config(key(3)), &ctx).await.unwrap();

		let mut state = conn.lock().await;
		assert!(state.stop_conn());
		assert!(!state.stop_conn());
		drop(state);
		assert!(conn.is_stopped().await);
	}

	#[tokio::test]
	async fn test_server_gone_reports_termination() {
		let registry = Arc::new(ProxyRegistry::new(key(1)));
		let (outbound, outbound_rx) = mpsc::channel(8);
		drop(outbound_rx);
		let ctx = ConnContext {
			registry: Arc::clone(&registry),
			outbound,
			wg_listen_port: 51820,
			parent: CancellationToken::new(),
		};
		let conn = PeerConnection::start(config(key(4)), &ctx).await.unwrap();
		registry.insert_proxy_peer(Arc::clone(&conn));

		let wg = UdpSocket::bind("127.0.0.1:0").await.unwrap();
		wg.send_to(b"x", conn.config().local_addr).await.unwrap();

		for _ in 0..100 {
			if registry.proxy_peer(&key(4)).is_none() {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert!(registry.proxy_peer(&key(4)).is_none());
		assert!(conn.is_stopped().await);
	}

	#[tokio::test]
	async fn test_no_proxy_stop_once() {
		let peer = NoProxyPeer::new(key(5), "10.0.0.5:51820".parse().unwrap());
		let mut state = peer.lock().await;
		assert!(state.stop_conn());
		assert!(!state.stop_conn());
		assert!(state.is_stopped());
	}
}
