// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::{EngineError, Result};
use crate::registry::ProxyRegistry;
use meshproxy_conn::ProxyHeader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

const OUTBOUND_QUEUE: usize = 1024;
const MAX_DATAGRAM: usize = 65535;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundDatagram {
	pub dest: SocketAddr,
	pub data: Vec<u8>,
}

pub type OutboundSender = mpsc::Sender<OutboundDatagram>;

/// What the listener decided to do with one received datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
	Delivered,
	Relayed(SocketAddr),
	ExtClientNotified,
	Dropped(&'static str),
}

/// The single UDP socket of the proxy session.
pub struct ProxyServer {
	socket: UdpSocket,
	registry: Arc<ProxyRegistry>,
	outbound_tx: OutboundSender,
	outbound_rx: mpsc::Receiver<OutboundDatagram>,
}

impl ProxyServer {
	#[instrument(skip(registry))]
	pub async fn bind(addr: SocketAddr, registry: Arc<ProxyRegistry>) -> Result<Self> {
		let socket = UdpSocket::bind(addr)
			.await
			.map_err(|source| EngineError::Bind { addr, source })?;
		let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
		info!(local = ?socket.local_addr().ok(), "proxy server listening");

		Ok(Self {
			socket,
			registry,
			outbound_tx,
			outbound_rx,
		})
	}

	pub fn local_addr(&self) -> Result<SocketAddr> {
		Ok(self.socket.local_addr()?)
	}

	/// Queue feeding the socket. Peer connections send through this.
	pub fn outbound_sender(&self) -> OutboundSender {
		self.outbound_tx.clone()
	}

	pub async fn run(mut self, cancel: CancellationToken) {
		let mut buf = vec![0u8; MAX_DATAGRAM];
		// The server keeps its own sender alive, so recv never yields None.
		loop {
			tokio::select! {
				biased;

				_ = cancel.cancelled() => {
					info!("proxy server shutting down");
					break;
				}

				Some(datagram) = self.outbound_rx.recv() => {
					if let Err(e) = self.socket.send_to(&datagram.data, datagram.dest).await {
						debug!(dest = %datagram.dest, error = %e, "send failed");
					}
				}

				res = self.socket.recv_from(&mut buf) => match res {
					Ok((len, from)) => {
						let verdict = self.dispatch(&buf[..len], from).await;
						trace!(%from, len, ?verdict, "datagram dispatched");
					}
					Err(e) => warn!(error = %e, "proxy socket receive failed"),
				},
			}
		}
	}

	async fn dispatch(&self, data: &[u8], from: SocketAddr) -> Dispatch {
		let dispatch = dispatch_datagram(&self.registry, data, from);
		if let Dispatch::Relayed(dest) = dispatch {
			if let Err(e) = self.socket.send_to(data, dest).await {
				debug!(%dest, error = %e, "relay forward failed");
			}
		}
		dispatch
	}
}

/// Routes one datagram against the registry. Relay forwarding is reported
/// but performed by the caller, which owns the socket.
pub fn dispatch_datagram(registry: &ProxyRegistry, data: &[u8], from: SocketAddr) -> Dispatch {
	let parsed = match ProxyHeader::parse(data) {
		Ok(parsed) => parsed,
		Err(e) => {
			debug!(%from, error = %e, "malformed proxy header");
			return Dispatch::Dropped("malformed header");
		}
	};

	let Some((header, payload)) = parsed else {
		return match registry.proxy_peer_by_remote(from) {
			Some(conn) => {
				conn.deliver(data.to_vec());
				Dispatch::Delivered
			}
			None => {
				debug!(%from, "no peer for source address");
				Dispatch::Dropped("unknown source")
			}
		};
	};

	if header.receiver != registry.local_key() {
		if !registry.is_relay() {
			return Dispatch::Dropped("not a relay");
		}
		return match registry.relay_destination(&header.receiver) {
			Some(dest) => Dispatch::Relayed(dest),
			None => {
				debug!(receiver = %header.receiver, "no relay route");
				Dispatch::Dropped("no relay route")
			}
		};
	}

	if let Some(conn) = registry.proxy_peer(&header.sender) {
		conn.deliver(payload.to_vec());
		return Dispatch::Delivered;
	}

	if registry.notify_ext_client(&header.sender, from) {
		info!(peer = %header.sender, %from, "ext-client endpoint observed");
		return Dispatch::ExtClientNotified;
	}

	debug!(peer = %header.sender, %from, "no connection for sender");
	Dispatch::Dropped("unknown sender")
}
