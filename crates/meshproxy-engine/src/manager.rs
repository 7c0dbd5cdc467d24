// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Reconciliation of peer updates against live proxy state.
//!
//! The manager is the single consumer of [`PeerUpdate`]s and the only writer
//! of the peer maps in the registry, apart from forwarding tasks removing
//! themselves on failure. Updates are applied one at a time; a failing
//! update is logged and never stops the loop.

use crate::error::{EngineError, Result};
use crate::ingress::{enable_ip_forwarding, IngressRouter, PacketCapture};
use crate::metrics::spawn_metrics_collector;
use crate::peer_conn::{ConnContext, NoProxyPeer, PeerConnConfig, PeerConnection};
use crate::registry::{ExtClientWatch, InterfaceBinding, ProxyRegistry, RemotePeer};
use crate::relay::register_relayed_peers;
use crate::server::OutboundSender;
use meshproxy_common::{PeerConf, PeerDescriptor, PeerUpdate, ProxyAction, WgPublicKey, PROXY_PORT};
use meshproxy_conn::{DeviceInfo, WgDevice};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Capacity of an ext-client watcher's endpoint channel.
const EXT_CLIENT_QUEUE: usize = 30;
const EVENT_QUEUE: usize = 64;

#[derive(Debug, Clone)]
pub struct EngineConfig {
	pub metrics_interval: Duration,
	/// Write the kernel forwarding sysctls when ingress routing starts.
	pub manage_ip_forwarding: bool,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			metrics_interval: Duration::from_secs(15),
			manage_ip_forwarding: true,
		}
	}
}

/// Relay settings a peer connection is compared against. When this host is
/// relayed, every peer is reached through the host's relay.
#[derive(Debug, Clone, Copy)]
struct RelaySettings {
	host_relayed: bool,
	host_relayed_to: Option<SocketAddr>,
}

impl RelaySettings {
	fn from_update(update: &PeerUpdate) -> Self {
		Self {
			host_relayed: update.is_relayed,
			host_relayed_to: update.relayed_to,
		}
	}

	fn for_peer(&self, conf: &PeerConf) -> (bool, Option<SocketAddr>) {
		if self.host_relayed {
			(true, self.host_relayed_to)
		} else {
			(conf.is_relayed, conf.relayed_to)
		}
	}
}

enum ManagerEvent {
	ExtClientResolved {
		peer: PeerDescriptor,
		conf: PeerConf,
		relay: RelaySettings,
		iface: String,
		cancel: CancellationToken,
	},
}

enum AddedPeer {
	Proxied(Arc<PeerConnection>),
	Direct(Arc<NoProxyPeer>),
}

type ProxyMap = HashMap<WgPublicKey, Arc<PeerConnection>>;
type DirectMap = HashMap<IpAddr, Arc<NoProxyPeer>>;

pub struct ProxyManager {
	config: EngineConfig,
	registry: Arc<ProxyRegistry>,
	device: Arc<dyn WgDevice>,
	router: IngressRouter,
	outbound: OutboundSender,
	cancel: CancellationToken,
	last_action: ProxyAction,
	events_tx: mpsc::Sender<ManagerEvent>,
	events_rx: mpsc::Receiver<ManagerEvent>,
}

impl ProxyManager {
	pub fn new(
		config: EngineConfig,
		registry: Arc<ProxyRegistry>,
		device: Arc<dyn WgDevice>,
		capture: Arc<dyn PacketCapture>,
		outbound: OutboundSender,
		cancel: CancellationToken,
	) -> Self {
		let router = IngressRouter::new(Arc::clone(&registry), capture);
		let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
		Self {
			config,
			registry,
			device,
			router,
			outbound,
			cancel,
			last_action: ProxyAction::NoProxy,
			events_tx,
			events_rx,
		}
	}

	pub fn registry(&self) -> &Arc<ProxyRegistry> {
		&self.registry
	}

	pub fn router(&self) -> &IngressRouter {
		&self.router
	}

	/// Consumes updates until cancelled or the sender goes away, then tears
	/// everything down.
	pub async fn run(mut self, mut updates: mpsc::Receiver<PeerUpdate>) {
		info!("proxy manager started");

		loop {
			tokio::select! {
				biased;

				_ = self.cancel.cancelled() => {
					info!("proxy manager cancelled");
					break;
				}

				Some(event) = self.events_rx.recv() => {
					self.handle_event(event).await;
				}

				update = updates.recv() => match update {
					Some(update) => {
						if let Err(e) = self.process(update).await {
							error!(error = %e, "failed to apply peer update");
						}
					}
					None => {
						info!("peer update channel closed");
						break;
					}
				},
			}
		}

		self.shutdown().await;
		info!("proxy manager stopped");
	}

	/// Applies one update. A malformed update is rejected before any state
	/// is touched.
	#[instrument(skip(self, update), fields(iface = %update.interface_name, action = ?update.action, peers = update.peers.len()))]
	pub async fn process(&mut self, update: PeerUpdate) -> Result<()> {
		update.validate()?;

		let result = match update.action {
			ProxyAction::NoProxy => {
				info!("proxying disabled, tearing down all peers");
				self.teardown_all().await;
				self.apply_settings(&update);
				Ok(())
			}
			ProxyAction::ProxyOn => self.apply_proxy_on(&update).await,
		};

		self.last_action = update.action;
		self.toggle_metrics();
		result
	}

	async fn apply_proxy_on(&mut self, update: &PeerUpdate) -> Result<()> {
		if self.apply_settings(update) {
			info!(relayed = update.is_relayed, "relayed status changed, resetting all peers");
			self.teardown_all().await;
			return Ok(());
		}

		let iface = update.interface_name.as_str();
		let info = self.device.device(iface).await?;
		let observed = InterfaceBinding {
			name: iface.to_string(),
			listen_port: info.listen_port,
		};
		match self.registry.interface_binding() {
			None => self.registry.set_interface_binding(observed),
			Some(bound) if bound != observed => {
				warn!(
					old_iface = %bound.name,
					old_port = bound.listen_port,
					new_port = observed.listen_port,
					"interface changed, resetting all peers"
				);
				self.registry.set_interface_binding(observed);
				self.teardown_all().await;
				return Ok(());
			}
			Some(_) => {}
		}

		self.prune_ext_client_waits(update);
		let (mut proxied, mut direct, to_add) = self.diff(update, &info).await;
		self.create_peers(update, to_add, &mut proxied, &mut direct).await;
		self.publish(proxied, direct).await;

		debug!(
			proxied = self.registry.proxy_peer_count(),
			direct = self.registry.no_proxy_peer_count(),
			"peer update applied"
		);
		Ok(())
	}

	/// Applies host-level relay and ingress flags. Returns true if the
	/// relayed flag flipped, which requires a full reset.
	fn apply_settings(&self, update: &PeerUpdate) -> bool {
		let registry = &self.registry;

		if !update.is_relay && registry.is_relay() {
			info!("relay turned off, dropping relayed peers");
			registry.delete_relayed_peers();
		}

		if update.is_ingress {
			registry.set_ingress_routes(&update.ingress_routes);
			if !self.router.is_running() {
				if self.config.manage_ip_forwarding {
					if let Err(e) = enable_ip_forwarding() {
						warn!(error = %e, "failed to enable ip forwarding");
					}
				}
				if let Err(e) = self.router.start(&update.interface_name, update.wg_addr, &self.cancel) {
					warn!(error = %e, "ingress routing unavailable");
				}
			}
		} else {
			registry.clear_ingress_routes();
			self.router.stop();
		}

		registry.set_relay(update.is_relay);
		registry.set_ingress(update.is_ingress);
		let reset = registry.set_relayed(update.is_relayed) != update.is_relayed;

		if update.is_relay {
			register_relayed_peers(registry, &update.relayed_peer_conf);
		}

		reset
	}

	/// Drops stale entries and decides, peer by peer, what to keep. Returns
	/// the surviving maps and the peers that still need a connection.
	async fn diff(&self, update: &PeerUpdate, info: &DeviceInfo) -> (ProxyMap, DirectMap, Vec<PeerDescriptor>) {
		let registry = &self.registry;
		let mut proxied = registry.proxy_peers();
		let mut direct = registry.no_proxy_peers();

		let stale: Vec<WgPublicKey> = proxied
			.keys()
			.filter(|k| !update.peer_map.contains_key(k))
			.copied()
			.collect();
		for key in stale {
			if let Some(conn) = proxied.remove(&key) {
				info!(peer = %key, "peer removed from update");
				if conn.config().is_attached_ext_client {
					registry.delete_ext_client_wait(&key);
					registry.delete_ext_client_endpoint(&conn.config().peer_endpoint);
				}
				self.stop_proxied(&conn).await;
			}
		}

		let stale: Vec<IpAddr> = direct
			.iter()
			.filter(|(_, p)| !update.peer_map.contains_key(&p.key()))
			.map(|(ip, _)| *ip)
			.collect();
		for ip in stale {
			if let Some(peer) = direct.remove(&ip) {
				debug!(peer = %peer.key(), "direct peer removed from update");
				self.stop_direct(&peer, &ip).await;
			}
		}

		let relay = RelaySettings::from_update(update);
		let mut to_add = Vec::new();

		for peer in &update.peers {
			let key = peer.public_key;
			let conf = update.conf_for(&key).cloned().unwrap_or_default();

			if let Some(conn) = proxied.get(&key).cloned() {
				let mut state = conn.lock().await;
				let reason = if state.is_stopped() {
					Some("forwarding stopped")
				} else {
					self.stale_reason(&conn, peer, &conf, &relay, info)
				};
				if let Some(reason) = reason {
					info!(peer = %key, reason, "resetting proxied peer");
					state.stop_conn();
					proxied.remove(&key);
					registry.remove_proxy_peer_if(&key, conn.id());
					drop(state);
					to_add.push(peer.clone());
				}
				continue;
			}

			let existing = direct
				.iter()
				.find(|(_, p)| p.key() == key)
				.map(|(ip, p)| (*ip, Arc::clone(p)));
			if let Some((ip, existing)) = existing {
				// Ext-client descriptors never carry an endpoint; a resolved
				// direct entry stays until the peer leaves or needs proxying.
				let ip_changed = match peer.endpoint {
					None if conf.is_attached_ext_client => false,
					endpoint => endpoint.map(|e| e.ip()) != Some(ip),
				};
				if conf.proxy_enabled || ip_changed {
					debug!(peer = %key, proxy = conf.proxy_enabled, ip_changed, "resetting direct peer");
					direct.remove(&ip);
					self.stop_direct(&existing, &ip).await;
					to_add.push(peer.clone());
				}
				continue;
			}

			to_add.push(peer.clone());
		}

		(proxied, direct, to_add)
	}

	/// Cancels watchers for peers that are gone or no longer ext-clients.
	fn prune_ext_client_waits(&self, update: &PeerUpdate) {
		for key in self.registry.ext_client_wait_keys() {
			let still_ext = update.conf_for(&key).is_some_and(|c| c.is_attached_ext_client);
			if !still_ext {
				debug!(peer = %key, "cancelling ext-client watcher");
				self.registry.delete_ext_client_wait(&key);
			}
		}
	}

	/// Why a live connection no longer matches the update, if it doesn't.
	/// Checks run in a fixed order and the first hit wins.
	fn stale_reason(
		&self,
		conn: &PeerConnection,
		peer: &PeerDescriptor,
		conf: &PeerConf,
		relay: &RelaySettings,
		info: &DeviceInfo,
	) -> Option<&'static str> {
		let cfg = conn.config();

		if cfg.is_attached_ext_client {
			return match self.registry.ext_client_endpoint(&cfg.peer_endpoint) {
				Some(_) => None,
				None => Some("ext-client endpoint unresolved"),
			};
		}
		if !conf.proxy_enabled {
			return Some("proxy disabled");
		}
		if let Some(device_peer) = info.peer(&cfg.key) {
			if device_peer.endpoint != Some(cfg.local_addr) {
				return Some("device endpoint diverged");
			}
		}

		let (is_relayed, relayed_to) = relay.for_peer(conf);
		if cfg.is_relayed != is_relayed {
			return Some("relay status changed");
		}
		if let (Some(current), Some(wanted)) = (cfg.relayed_to, relayed_to) {
			if current != wanted {
				return Some("relay endpoint changed");
			}
		}
		if conf.public_listen_port != 0 && cfg.listen_port != conf.public_listen_port {
			return Some("listen port changed");
		}
		match peer.endpoint {
			None => Some("endpoint missing"),
			Some(endpoint) if endpoint.ip() != cfg.peer_endpoint.ip() => Some("endpoint changed"),
			Some(_) => None,
		}
	}

	async fn create_peers(
		&self,
		update: &PeerUpdate,
		to_add: Vec<PeerDescriptor>,
		proxied: &mut ProxyMap,
		direct: &mut DirectMap,
	) {
		let relay = RelaySettings::from_update(update);

		for peer in to_add {
			let key = peer.public_key;
			let conf = update.conf_for(&key).cloned().unwrap_or_default();

			if conf.is_attached_ext_client {
				if !self.registry.has_ext_client_wait(&key) {
					self.watch_ext_client(peer, conf, relay, &update.interface_name);
				}
				continue;
			}
			if peer.endpoint.is_none() {
				debug!(peer = %key, "peer has no endpoint, skipping");
				continue;
			}

			match self.add_peer(&update.interface_name, &peer, &conf, &relay).await {
				Ok(AddedPeer::Proxied(conn)) => {
					proxied.insert(key, conn);
				}
				Ok(AddedPeer::Direct(added)) => {
					let ip = added.endpoint().ip();
					if let Some(previous) = direct.insert(ip, added) {
						warn!(peer = %previous.key(), %ip, "direct peer displaced by endpoint collision");
						previous.lock().await.stop_conn();
					}
				}
				Err(e) => warn!(peer = %key, error = %e, "failed to add peer"),
			}
		}
	}

	#[instrument(skip(self, peer, conf, relay), fields(peer = %peer.public_key))]
	async fn add_peer(
		&self,
		iface: &str,
		peer: &PeerDescriptor,
		conf: &PeerConf,
		relay: &RelaySettings,
	) -> Result<AddedPeer> {
		let key = peer.public_key;
		let endpoint = peer.endpoint.ok_or_else(|| EngineError::NoEndpoint(key.to_string()))?;

		if !conf.proxy_enabled {
			self.device
				.set_peer_endpoint(iface, &key, endpoint, peer.persistent_keepalive)
				.await?;
			debug!(%endpoint, "peer reached directly");
			return Ok(AddedPeer::Direct(Arc::new(NoProxyPeer::new(key, endpoint))));
		}

		let listen_port = if conf.public_listen_port != 0 {
			conf.public_listen_port
		} else {
			PROXY_PORT
		};
		let (is_relayed, relayed_to) = relay.for_peer(conf);
		let remote_addr = match (is_relayed, relayed_to) {
			_ if conf.is_attached_ext_client => endpoint,
			(true, Some(relay_addr)) => relay_addr,
			_ => SocketAddr::new(endpoint.ip(), listen_port),
		};

		let wg_listen_port = self
			.registry
			.interface_binding()
			.map(|b| b.listen_port)
			.ok_or(EngineError::NoInterface)?;
		let ctx = ConnContext {
			registry: Arc::clone(&self.registry),
			outbound: self.outbound.clone(),
			wg_listen_port,
			parent: self.cancel.clone(),
		};
		let config = PeerConnConfig {
			key,
			local_addr: SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), 0),
			remote_addr,
			peer_endpoint: endpoint,
			is_relayed,
			relayed_to,
			listen_port,
			is_attached_ext_client: conf.is_attached_ext_client,
		};

		let conn = PeerConnection::start(config, &ctx).await?;
		if let Err(e) = self
			.device
			.set_peer_endpoint(iface, &key, conn.config().local_addr, peer.persistent_keepalive)
			.await
		{
			conn.lock().await.stop_conn();
			return Err(e.into());
		}
		Ok(AddedPeer::Proxied(conn))
	}

	fn watch_ext_client(&self, peer: PeerDescriptor, conf: PeerConf, relay: RelaySettings, iface: &str) {
		let key = peer.public_key;
		let (endpoint_tx, mut endpoint_rx) = mpsc::channel(EXT_CLIENT_QUEUE);
		let cancel = self.cancel.child_token();

		let wait = RemotePeer {
			public_key: key,
			endpoint: None,
			watch: Some(ExtClientWatch {
				cancel: cancel.clone(),
				endpoint_tx,
			}),
		};
		if !self.registry.save_ext_client_wait(wait) {
			return;
		}

		let events = self.events_tx.clone();
		let iface = iface.to_string();
		info!(peer = %key, "waiting for ext-client endpoint");
		tokio::spawn(async move {
			tokio::select! {
				_ = cancel.cancelled() => {
					debug!(peer = %key, "ext-client watcher cancelled");
				}
				Some(endpoint) = endpoint_rx.recv() => {
					let event = ManagerEvent::ExtClientResolved {
						peer: peer.with_endpoint(endpoint),
						conf,
						relay,
						iface,
						cancel,
					};
					if events.send(event).await.is_err() {
						debug!(peer = %key, "manager gone before ext-client resolved");
					}
				}
			}
		});
	}

	async fn handle_event(&mut self, event: ManagerEvent) {
		match event {
			ManagerEvent::ExtClientResolved {
				peer,
				conf,
				relay,
				iface,
				cancel,
			} => {
				let key = peer.public_key;
				if cancel.is_cancelled() || self.registry.take_ext_client_wait(&key).is_none() {
					debug!(peer = %key, "ext-client resolved after its wait was dropped");
					return;
				}

				match self.add_peer(&iface, &peer, &conf, &relay).await {
					Ok(AddedPeer::Proxied(conn)) => {
						info!(peer = %key, endpoint = %conn.config().peer_endpoint, "ext-client connected");
						self.registry.save_ext_client_endpoint(conn.config().peer_endpoint, key);
						self.registry.insert_proxy_peer(conn);
					}
					Ok(AddedPeer::Direct(added)) => {
						if let Some(previous) = self.registry.insert_no_proxy_peer(added) {
							previous.lock().await.stop_conn();
						}
					}
					Err(e) => warn!(peer = %key, error = %e, "failed to connect ext-client"),
				}
				self.toggle_metrics();
			}
		}
	}

	/// Writes the reconciled maps back, leaving out connections whose
	/// forwarding has died in the meantime.
	async fn publish(&self, proxied: ProxyMap, direct: DirectMap) {
		let mut live = HashMap::with_capacity(proxied.len());
		for (key, conn) in proxied {
			if conn.is_stopped().await {
				debug!(peer = %key, "not publishing stopped connection");
				continue;
			}
			live.insert(key, conn);
		}
		self.registry.replace_proxy_peers(live);
		self.registry.replace_no_proxy_peers(direct);
	}

	async fn stop_proxied(&self, conn: &PeerConnection) {
		let mut state = conn.lock().await;
		state.stop_conn();
		self.registry.remove_proxy_peer_if(&conn.key(), conn.id());
	}

	async fn stop_direct(&self, peer: &NoProxyPeer, ip: &IpAddr) {
		let mut state = peer.lock().await;
		state.stop_conn();
		self.registry.remove_no_proxy_peer(ip);
	}

	/// Stops every proxied and direct peer. Ext-client watchers survive.
	async fn teardown_all(&self) {
		for (key, conn) in self.registry.proxy_peers() {
			debug!(peer = %key, "tearing down proxied peer");
			if conn.config().is_attached_ext_client {
				self.registry.delete_ext_client_endpoint(&conn.config().peer_endpoint);
			}
			self.stop_proxied(&conn).await;
		}
		for (ip, peer) in self.registry.no_proxy_peers() {
			self.stop_direct(&peer, &ip).await;
		}
	}

	/// Metrics run only while nothing is proxied.
	fn toggle_metrics(&self) {
		let proxying = self.last_action == ProxyAction::ProxyOn && self.registry.proxy_peer_count() > 0;
		if proxying {
			if self.registry.stop_metrics() {
				info!("peers proxied, metrics collection stopped");
			}
		} else if let Some(token) = self.registry.start_metrics(&self.cancel) {
			spawn_metrics_collector(
				Arc::clone(&self.registry),
				Arc::clone(&self.device),
				self.config.metrics_interval,
				token,
			);
		}
	}

	async fn shutdown(&mut self) {
		self.teardown_all().await;
		for key in self.registry.ext_client_wait_keys() {
			self.registry.delete_ext_client_wait(&key);
		}
		self.router.stop();
		self.registry.stop_metrics();
	}
}
