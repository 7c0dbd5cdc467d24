// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::registry::{ProxyRegistry, RemotePeer};
use meshproxy_common::{RelayedNodeConf, WgPublicKey, PROXY_PORT};
use std::collections::HashMap;
use std::net::SocketAddr;
use tracing::{debug, instrument};

/// Peers behind a relay are always reached on their proxy port.
pub fn normalize_port(endpoint: SocketAddr) -> SocketAddr {
	SocketAddr::new(endpoint.ip(), PROXY_PORT)
}

/// Rebuilds the relay table from the nodes relayed through us: the
/// endpoints of each node's peers and of the node itself. Peers without an
/// endpoint are skipped, and nodes no longer listed lose their routes.
#[instrument(skip_all, fields(nodes = relayed.len()))]
pub fn register_relayed_peers(registry: &ProxyRegistry, relayed: &HashMap<WgPublicKey, RelayedNodeConf>) {
	let mut table: HashMap<WgPublicKey, HashMap<WgPublicKey, RemotePeer>> = HashMap::with_capacity(relayed.len());

	for (node_key, conf) in relayed {
		let routes = table.entry(*node_key).or_default();
		for peer in &conf.peers {
			let Some(endpoint) = peer.endpoint else {
				continue;
			};
			routes.insert(peer.public_key, RemotePeer::relayed(peer.public_key, normalize_port(endpoint)));
		}

		match conf.relayed_peer_endpoint {
			Some(endpoint) => {
				routes.insert(*node_key, RemotePeer::relayed(*node_key, normalize_port(endpoint)));
			}
			None => debug!(node = %node_key, "relayed node has no endpoint yet"),
		}
		debug!(node = %node_key, peers = conf.peers.len(), "registered relayed node");
	}

	registry.replace_relayed_peers(table);
}
