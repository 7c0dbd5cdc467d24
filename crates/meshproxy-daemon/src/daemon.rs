// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::config::ProxyConfig;
use crate::error::Result;
use meshproxy_common::PeerUpdate;
use meshproxy_conn::{discover_host_info, resolve_stun_servers, UapiDevice, WgDevice};
use meshproxy_engine::{PacketCapture, ProxyManager, ProxyRegistry, ProxyServer, RawSocketCapture};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Wires NAT discovery, the proxy server and the manager into one session.
pub struct ProxyDaemon {
	config: ProxyConfig,
	registry: Arc<ProxyRegistry>,
	device: Arc<dyn WgDevice>,
	capture: Arc<dyn PacketCapture>,
}

impl ProxyDaemon {
	pub fn new(config: ProxyConfig) -> Self {
		let device = Arc::new(UapiDevice::new(config.uapi_dir.clone()));
		Self::with_backends(config, device, Arc::new(RawSocketCapture))
	}

	/// Uses the given device and capture backends instead of the system ones.
	pub fn with_backends(
		config: ProxyConfig,
		device: Arc<dyn WgDevice>,
		capture: Arc<dyn PacketCapture>,
	) -> Self {
		let registry = Arc::new(ProxyRegistry::new(config.public_key));
		Self {
			config,
			registry,
			device,
			capture,
		}
	}

	pub fn registry(&self) -> &Arc<ProxyRegistry> {
		&self.registry
	}

	/// The proxy socket goes on the private port discovery settled on, or on
	/// the configured port when discovery failed.
	fn bind_addr(&self) -> SocketAddr {
		let port = self
			.registry
			.host_info()
			.map(|host| host.private_port)
			.unwrap_or(self.config.listen_port);
		SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), port)
	}

	/// Runs until `shutdown` is cancelled or the update stream ends. Only a
	/// failure to bind the proxy socket is fatal.
	#[instrument(skip_all, fields(iface = %self.config.interface, port = self.config.listen_port))]
	pub async fn run(self, updates: mpsc::Receiver<PeerUpdate>, shutdown: CancellationToken) -> Result<()> {
		info!("starting mesh proxy");

		let servers = resolve_stun_servers(&self.config.stun_servers).await;
		match discover_host_info(self.config.listen_port, &servers).await {
			Ok(host) => self.registry.set_host_info(host),
			Err(e) => warn!(error = %e, "NAT discovery failed, continuing without host info"),
		}

		let bind_addr = self.bind_addr();
		let server = ProxyServer::bind(bind_addr, Arc::clone(&self.registry)).await?;
		let session = shutdown.child_token();

		let manager = ProxyManager::new(
			self.config.engine_config(),
			Arc::clone(&self.registry),
			self.device,
			self.capture,
			server.outbound_sender(),
			session.clone(),
		);

		let server_task = tokio::spawn(server.run(session.clone()));
		let mut manager_task = tokio::spawn(manager.run(updates));

		let manager_done = tokio::select! {
			_ = shutdown.cancelled() => {
				info!("shutdown requested");
				false
			}
			res = &mut manager_task => {
				if let Err(e) = res {
					warn!(error = %e, "proxy manager task failed");
				}
				true
			}
		};

		session.cancel();
		if !manager_done {
			manager_task.await?;
		}
		server_task.await?;

		info!("mesh proxy stopped");
		Ok(())
	}
}
