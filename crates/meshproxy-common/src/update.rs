// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peer topology updates pushed by the coordination server.

use crate::keys::WgPublicKey;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

/// Well-known port the proxy listens on and relayed peers are reached at.
pub const PROXY_PORT: u16 = 51722;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum UpdateError {
	#[error("peer update has an empty interface name")]
	EmptyInterface,

	#[error("peer update carries no peers")]
	NoPeers,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyAction {
	ProxyOn,
	NoProxy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
	pub public_key: WgPublicKey,
	#[serde(default)]
	pub endpoint: Option<SocketAddr>,
	#[serde(default)]
	pub allowed_ips: Vec<IpNet>,
	#[serde(default)]
	pub persistent_keepalive: Option<u16>,
}

impl PeerDescriptor {
	pub fn new(public_key: WgPublicKey) -> Self {
		Self {
			public_key,
			endpoint: None,
			allowed_ips: Vec::new(),
			persistent_keepalive: None,
		}
	}

	pub fn with_endpoint(mut self, endpoint: SocketAddr) -> Self {
		self.endpoint = Some(endpoint);
		self
	}

	pub fn with_keepalive(mut self, secs: u16) -> Self {
		self.persistent_keepalive = Some(secs);
		self
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConf {
	pub proxy_enabled: bool,
	pub is_relayed: bool,
	pub relayed_to: Option<SocketAddr>,
	pub public_listen_port: u16,
	pub is_attached_ext_client: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedNodeConf {
	#[serde(default)]
	pub peers: Vec<PeerDescriptor>,
	pub relayed_peer_endpoint: Option<SocketAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRoute {
	pub external_ip: IpAddr,
	pub internal_ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
	pub action: ProxyAction,
	pub interface_name: String,
	#[serde(default)]
	pub is_relay: bool,
	#[serde(default)]
	pub is_ingress: bool,
	#[serde(default)]
	pub is_relayed: bool,
	#[serde(default)]
	pub relayed_to: Option<SocketAddr>,
	#[serde(default)]
	pub peers: Vec<PeerDescriptor>,
	#[serde(default)]
	pub peer_map: HashMap<WgPublicKey, PeerConf>,
	#[serde(default)]
	pub relayed_peer_conf: HashMap<WgPublicKey, RelayedNodeConf>,
	#[serde(default)]
	pub ingress_routes: Vec<IngressRoute>,
	/// This node's own mesh address. Ingress capture ignores traffic to it.
	#[serde(default)]
	pub wg_addr: Option<IpAddr>,
}

impl PeerUpdate {
	pub fn new(action: ProxyAction, interface_name: impl Into<String>) -> Self {
		Self {
			action,
			interface_name: interface_name.into(),
			is_relay: false,
			is_ingress: false,
			is_relayed: false,
			relayed_to: None,
			peers: Vec::new(),
			peer_map: HashMap::new(),
			relayed_peer_conf: HashMap::new(),
			ingress_routes: Vec::new(),
			wg_addr: None,
		}
	}

	pub fn with_peer(mut self, peer: PeerDescriptor, conf: PeerConf) -> Self {
		self.peer_map.insert(peer.public_key, conf);
		self.peers.push(peer);
		self
	}

	/// Rejects updates that cannot be reconciled. `NoProxy` events are allowed
	/// to carry no peers since they only tear state down.
	pub fn validate(&self) -> Result<(), UpdateError> {
		if self.interface_name.trim().is_empty() {
			return Err(UpdateError::EmptyInterface);
		}
		if self.action == ProxyAction::ProxyOn && self.peers.is_empty() {
			return Err(UpdateError::NoPeers);
		}
		Ok(())
	}

	pub fn conf_for(&self, key: &WgPublicKey) -> Option<&PeerConf> {
		self.peer_map.get(key)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn key(b: u8) -> WgPublicKey {
		WgPublicKey::from_bytes([b; 32])
	}

	#[test]
	fn validate_rejects_empty_interface() {
		let update = PeerUpdate::new(ProxyAction::ProxyOn, "  ")
			.with_peer(PeerDescriptor::new(key(1)), PeerConf::default());
		assert_eq!(update.validate(), Err(UpdateError::EmptyInterface));
	}

	#[test]
	fn validate_rejects_proxy_on_without_peers() {
		let update = PeerUpdate::new(ProxyAction::ProxyOn, "nm0");
		assert_eq!(update.validate(), Err(UpdateError::NoPeers));
	}

	#[test]
	fn validate_allows_empty_no_proxy() {
		let update = PeerUpdate::new(ProxyAction::NoProxy, "nm0");
		assert!(update.validate().is_ok());
	}

	#[test]
	fn deserializes_minimal_json() {
		let k = key(3);
		let json = format!(
			r#"{{
				"action": "proxy_on",
				"interface_name": "nm0",
				"peers": [{{"public_key": "{k}", "endpoint": "10.0.0.2:51820"}}],
				"peer_map": {{"{k}": {{"proxy_enabled": true, "public_listen_port": 51821}}}}
			}}"#
		);
		let update: PeerUpdate = serde_json::from_str(&json).unwrap();

		assert_eq!(update.action, ProxyAction::ProxyOn);
		assert_eq!(update.peers.len(), 1);
		assert_eq!(update.peers[0].endpoint, Some("10.0.0.2:51820".parse().unwrap()));
		let conf = update.conf_for(&k).unwrap();
		assert!(conf.proxy_enabled);
		assert!(!conf.is_relayed);
		assert_eq!(conf.public_listen_port, 51821);
		assert!(update.ingress_routes.is_empty());
	}
}
