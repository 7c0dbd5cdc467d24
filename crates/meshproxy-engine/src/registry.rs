// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Shared proxy state.
//!
//! One [`ProxyRegistry`] is created per proxy session and handed to every
//! component. Locks are never held across an await point, so every
//! operation is atomic at the call site.

use crate::ingress::{IngressRoutingInfo, RouteDirection};
use crate::peer_conn::{NoProxyPeer, PeerConnection};
use meshproxy_common::{HostInfo, IngressRoute, WgPublicKey};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// WireGuard interface the proxy is attached to, as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceBinding {
	pub name: String,
	pub listen_port: u16,
}

/// Handle to a running ext-client watcher.
#[derive(Debug, Clone)]
pub struct ExtClientWatch {
	pub cancel: CancellationToken,
	pub endpoint_tx: mpsc::Sender<SocketAddr>,
}

/// A peer known by key and (eventually) endpoint, but not proxied by us.
/// Used for relay routing and for ext-clients awaiting their endpoint.
#[derive(Debug, Clone)]
pub struct RemotePeer {
	pub public_key: WgPublicKey,
	pub endpoint: Option<SocketAddr>,
	pub watch: Option<ExtClientWatch>,
}

impl RemotePeer {
	pub fn relayed(public_key: WgPublicKey, endpoint: SocketAddr) -> Self {
		Self {
			public_key,
			endpoint: Some(endpoint),
			watch: None,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMetrics {
	pub rx_bytes: u64,
	pub tx_bytes: u64,
	pub last_handshake: Option<SystemTime>,
	pub proxied: bool,
}

pub struct ProxyRegistry {
	local_key: WgPublicKey,
	host: RwLock<Option<HostInfo>>,
	iface: RwLock<Option<InterfaceBinding>>,
	proxy_peers: RwLock<HashMap<WgPublicKey, Arc<PeerConnection>>>,
	no_proxy_peers: RwLock<HashMap<IpAddr, Arc<NoProxyPeer>>>,
	relayed_peers: RwLock<HashMap<WgPublicKey, HashMap<WgPublicKey, RemotePeer>>>,
	ext_client_waits: RwLock<HashMap<WgPublicKey, RemotePeer>>,
	ext_client_endpoints: RwLock<HashMap<SocketAddr, WgPublicKey>>,
	ingress_routes: RwLock<HashMap<(IpAddr, RouteDirection), IngressRoutingInfo>>,
	is_relay: AtomicBool,
	is_ingress: AtomicBool,
	is_relayed: AtomicBool,
	metrics_cancel: Mutex<Option<CancellationToken>>,
	peer_metrics: RwLock<HashMap<WgPublicKey, PeerMetrics>>,
}

impl ProxyRegistry {
	pub fn new(local_key: WgPublicKey) -> Self {
		Self {
			local_key,
			host: RwLock::new(None),
			iface: RwLock::new(None),
			proxy_peers: RwLock::new(HashMap::new()),
			no_proxy_peers: RwLock::new(HashMap::new()),
			relayed_peers: RwLock::new(HashMap::new()),
			ext_client_waits: RwLock::new(HashMap::new()),
			ext_client_endpoints: RwLock::new(HashMap::new()),
			ingress_routes: RwLock::new(HashMap::new()),
			is_relay: AtomicBool::new(false),
			is_ingress: AtomicBool::new(false),
			is_relayed: AtomicBool::new(false),
			metrics_cancel: Mutex::new(None),
			peer_metrics: RwLock::new(HashMap::new()),
		}
	}

	pub fn local_key(&self) -> WgPublicKey {
		self.local_key
	}

	pub fn host_info(&self) -> Option<HostInfo> {
		*self.host.read()
	}

	pub fn set_host_info(&self, host: HostInfo) {
		*self.host.write() = Some(host);
	}

	pub fn interface_binding(&self) -> Option<InterfaceBinding> {
		self.iface.read().clone()
	}

	pub fn set_interface_binding(&self, binding: InterfaceBinding) {
		*self.iface.write() = Some(binding);
	}

	pub fn interface_name(&self) -> Option<String> {
		self.iface.read().as_ref().map(|b| b.name.clone())
	}

	// Proxied peers

	pub fn proxy_peers(&self) -> HashMap<WgPublicKey, Arc<PeerConnection>> {
		self.proxy_peers.read().clone()
	}

	pub fn proxy_peer(&self, key: &WgPublicKey) -> Option<Arc<PeerConnection>> {
		self.proxy_peers.read().get(key).cloned()
	}

	pub fn proxy_peer_count(&self) -> usize {
		self.proxy_peers.read().len()
	}

	pub fn insert_proxy_peer(&self, conn: Arc<PeerConnection>) -> Option<Arc<PeerConnection>> {
		self.proxy_peers.write().insert(conn.key(), conn)
	}

	pub fn remove_proxy_peer(&self, key: &WgPublicKey) -> Option<Arc<PeerConnection>> {
		self.proxy_peers.write().remove(key)
	}

	/// Removes the entry only if it is still the connection with `id`, so a
	/// dying task cannot evict its replacement.
	pub fn remove_proxy_peer_if(&self, key: &WgPublicKey, id: u64) -> bool {
		let mut peers = self.proxy_peers.write();
		match peers.get(key) {
			Some(conn) if conn.id() == id => {
				peers.remove(key);
				true
			}
			_ => false,
		}
	}

	pub fn replace_proxy_peers(&self, peers: HashMap<WgPublicKey, Arc<PeerConnection>>) {
		*self.proxy_peers.write() = peers;
	}

	pub fn proxy_peer_by_remote(&self, addr: SocketAddr) -> Option<Arc<PeerConnection>> {
		self
			.proxy_peers
			.read()
			.values()
			.find(|c| c.config().remote_addr == addr)
			.cloned()
	}

	// No-proxy peers

	pub fn no_proxy_peers(&self) -> HashMap<IpAddr, Arc<NoProxyPeer>> {
		self.no_proxy_peers.read().clone()
	}

	pub fn no_proxy_peer_count(&self) -> usize {
		self.no_proxy_peers.read().len()
	}

	pub fn insert_no_proxy_peer(&self, peer: Arc<NoProxyPeer>) -> Option<Arc<NoProxyPeer>> {
		self.no_proxy_peers.write().insert(peer.endpoint().ip(), peer)
	}

	pub fn remove_no_proxy_peer(&self, ip: &IpAddr) -> Option<Arc<NoProxyPeer>> {
		self.no_proxy_peers.write().remove(ip)
	}

	pub fn replace_no_proxy_peers(&self, peers: HashMap<IpAddr, Arc<NoProxyPeer>>) {
		*self.no_proxy_peers.write() = peers;
	}

	pub fn is_no_proxy_peer(&self, key: &WgPublicKey) -> bool {
		self.no_proxy_peers.read().values().any(|p| p.key() == *key)
	}

	// Relayed peers

	pub fn save_relayed_peer(&self, relayed_node: WgPublicKey, peer: RemotePeer) {
		self
			.relayed_peers
			.write()
			.entry(relayed_node)
			.or_default()
			.insert(peer.public_key, peer);
	}

	pub fn replace_relayed_peers(&self, peers: HashMap<WgPublicKey, HashMap<WgPublicKey, RemotePeer>>) {
		*self.relayed_peers.write() = peers;
	}

	pub fn relayed_peers(&self, relayed_node: &WgPublicKey) -> Vec<RemotePeer> {
		self
			.relayed_peers
			.read()
			.get(relayed_node)
			.map(|peers| peers.values().cloned().collect())
			.unwrap_or_default()
	}

	pub fn relayed_node_count(&self) -> usize {
		self.relayed_peers.read().len()
	}

	pub fn delete_relayed_peers(&self) {
		let mut relayed = self.relayed_peers.write();
		if !relayed.is_empty() {
			info!(nodes = relayed.len(), "deleting relayed peers");
		}
		relayed.clear();
	}

	/// Where a relay should forward a datagram addressed to `receiver`.
	pub fn relay_destination(&self, receiver: &WgPublicKey) -> Option<SocketAddr> {
		let relayed = self.relayed_peers.read();
		if let Some(node) = relayed.get(receiver).and_then(|peers| peers.get(receiver)) {
			return node.endpoint;
		}
		relayed
			.values()
			.find_map(|peers| peers.get(receiver))
			.and_then(|p| p.endpoint)
	}

	// Ext-client watchers

	/// Registers a watcher. Returns false if one already exists for the key.
	pub fn save_ext_client_wait(&self, peer: RemotePeer) -> bool {
		let mut waits = self.ext_client_waits.write();
		if waits.contains_key(&peer.public_key) {
			return false;
		}
		waits.insert(peer.public_key, peer);
		true
	}

	pub fn has_ext_client_wait(&self, key: &WgPublicKey) -> bool {
		self.ext_client_waits.read().contains_key(key)
	}

	pub fn ext_client_wait_keys(&self) -> Vec<WgPublicKey> {
		self.ext_client_waits.read().keys().copied().collect()
	}

	/// Removes the wait entry and cancels its watcher.
	pub fn delete_ext_client_wait(&self, key: &WgPublicKey) -> bool {
		match self.ext_client_waits.write().remove(key) {
			Some(peer) => {
				if let Some(watch) = peer.watch {
					watch.cancel.cancel();
				}
				debug!(peer = %key, "deleted ext-client wait entry");
				true
			}
			None => false,
		}
	}

	/// Removes the wait entry without cancelling, used once the watcher has
	/// delivered its endpoint.
	pub fn take_ext_client_wait(&self, key: &WgPublicKey) -> Option<RemotePeer> {
		self.ext_client_waits.write().remove(key)
	}

	/// Hands a freshly observed source address to a pending watcher.
	pub fn notify_ext_client(&self, key: &WgPublicKey, endpoint: SocketAddr) -> bool {
		let waits = self.ext_client_waits.read();
		let Some(watch) = waits.get(key).and_then(|p| p.watch.as_ref()) else {
			return false;
		};
		watch.endpoint_tx.try_send(endpoint).is_ok()
	}

	pub fn save_ext_client_endpoint(&self, endpoint: SocketAddr, key: WgPublicKey) {
		self.ext_client_endpoints.write().insert(endpoint, key);
	}

	pub fn ext_client_endpoint(&self, endpoint: &SocketAddr) -> Option<WgPublicKey> {
		self.ext_client_endpoints.read().get(endpoint).copied()
	}

	pub fn delete_ext_client_endpoint(&self, endpoint: &SocketAddr) {
		self.ext_client_endpoints.write().remove(endpoint);
	}

	// Flags

	pub fn is_relay(&self) -> bool {
		self.is_relay.load(Ordering::SeqCst)
	}

	pub fn set_relay(&self, value: bool) {
		self.is_relay.store(value, Ordering::SeqCst);
	}

	pub fn is_ingress(&self) -> bool {
		self.is_ingress.load(Ordering::SeqCst)
	}

	pub fn set_ingress(&self, value: bool) {
		self.is_ingress.store(value, Ordering::SeqCst);
	}

	pub fn is_relayed(&self) -> bool {
		self.is_relayed.load(Ordering::SeqCst)
	}

	/// Returns the previous value.
	pub fn set_relayed(&self, value: bool) -> bool {
		self.is_relayed.swap(value, Ordering::SeqCst)
	}

	// Ingress routing

	pub fn set_ingress_routes(&self, routes: &[IngressRoute]) {
		let mut table = HashMap::with_capacity(routes.len() * 2);
		for route in routes {
			let inbound = IngressRoutingInfo::new(*route, RouteDirection::Inbound);
			let outbound = IngressRoutingInfo::new(*route, RouteDirection::Outbound);
			table.insert((route.external_ip, RouteDirection::Inbound), inbound);
			table.insert((route.internal_ip, RouteDirection::Outbound), outbound);
		}
		*self.ingress_routes.write() = table;
	}

	pub fn clear_ingress_routes(&self) {
		self.ingress_routes.write().clear();
	}

	pub fn ingress_route(&self, ip: IpAddr, direction: RouteDirection) -> Option<IngressRoutingInfo> {
		self.ingress_routes.read().get(&(ip, direction)).copied()
	}

	pub fn ingress_route_count(&self) -> usize {
		self.ingress_routes.read().len()
	}

	// Metrics

	pub fn metrics_running(&self) -> bool {
		self.metrics_cancel.lock().is_some()
	}

	/// Returns a token for the collector task, or `None` if one is running.
	pub fn start_metrics(&self, parent: &CancellationToken) -> Option<CancellationToken> {
		let mut slot = self.metrics_cancel.lock();
		if slot.is_some() {
			return None;
		}
		let token = parent.child_token();
		*slot = Some(token.clone());
		Some(token)
	}

	pub fn stop_metrics(&self) -> bool {
		match self.metrics_cancel.lock().take() {
			Some(token) => {
				token.cancel();
				true
			}
			None => false,
		}
	}

	pub fn record_peer_metrics(&self, metrics: HashMap<WgPublicKey, PeerMetrics>) {
		*self.peer_metrics.write() = metrics;
	}

	pub fn peer_metrics(&self) -> HashMap<WgPublicKey, PeerMetrics> {
		self.peer_metrics.read().clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(b: u8) -> WgPublicKey {
		WgPublicKey::from_bytes([b; 32])
	}

	#[test]
	fn test_metrics_start_is_idempotent() {
		let registry = ProxyRegistry::new(key(0));
		let root = CancellationToken::new();

		let first = registry.start_metrics(&root);
		assert!(first.is_some());
		assert!(registry.start_metrics(&root).is_none());
		assert!(registry.metrics_running());

		assert!(registry.stop_metrics());
		assert!(first.unwrap().is_cancelled());
		assert!(!registry.stop_metrics());
		assert!(!registry.metrics_running());
	}

	#[test]
	fn test_set_relayed_reports_previous() {
		let registry = ProxyRegistry::new(key(0));
		assert!(!registry.set_relayed(true));
		assert!(registry.set_relayed(true));
		assert!(registry.set_relayed(false));
	}

	#[test]
	fn test_relay_destination() {
		let registry = ProxyRegistry::new(key(0));
		let node = key(1);
		let peer = key(2);
		registry.save_relayed_peer(node, RemotePeer::relayed(node, "10.0.0.1:51722".parse().unwrap()));
		registry.save_relayed_peer(node, RemotePeer::relayed(peer, "10.0.0.2:51722".parse().unwrap()));

		assert_eq!(registry.relay_destination(&node), Some("10.0.0.1:51722".parse().unwrap()));
		assert_eq!(registry.relay_destination(&peer), Some("10.0.0.2:51722".parse().unwrap()));
		assert_eq!(registry.relay_destination(&key(3)), None);

		registry.delete_relayed_peers();
		assert_eq!(registry.relayed_node_count(), 0);
		assert_eq!(registry.relay_destination(&node), None);
	}

	#[test]
	fn test_ext_client_wait_is_unique_per_key() {
		let registry = ProxyRegistry::new(key(0));
		let (tx, mut rx) = mpsc::channel(1);
		let cancel = CancellationToken::new();
		let wait = RemotePeer {
			public_key: key(4),
			endpoint: None,
			watch: Some(ExtClientWatch {
				cancel: cancel.clone(),
				endpoint_tx: tx,
			}),
		};

		assert!(registry.save_ext_client_wait(wait.clone()));
		assert!(!registry.save_ext_client_wait(wait));

		let endpoint: SocketAddr = "198.51.100.9:41000".parse().unwrap();
		assert!(registry.notify_ext_client(&key(4), endpoint));
		assert_eq!(rx.try_recv().unwrap(), endpoint);

		assert!(registry.delete_ext_client_wait(&key(4)));
		assert!(cancel.is_cancelled());
		assert!(!registry.notify_ext_client(&key(4), endpoint));
	}

	#[test]
	fn test_ingress_routes_by_direction() {
		let registry = ProxyRegistry::new(key(0));
		let route = IngressRoute {
			external_ip: "192.168.50.10".parse().unwrap(),
			internal_ip: "10.10.0.5".parse().unwrap(),
		};
		registry.set_ingress_routes(&[route]);

		let inbound = registry
			.ingress_route(route.external_ip, RouteDirection::Inbound)
			.unwrap();
		assert_eq!(inbound.internal_ip, route.internal_ip);
		assert!(registry
			.ingress_route(route.external_ip, RouteDirection::Outbound)
			.is_none());
		assert!(registry
			.ingress_route(route.internal_ip, RouteDirection::Outbound)
			.is_some());

		registry.clear_ingress_routes();
		assert_eq!(registry.ingress_route_count(), 0);
	}
}
