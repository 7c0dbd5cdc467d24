// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Per-peer traffic sampling, active only while nothing is proxied.

use crate::error::{EngineError, Result};
use crate::registry::{PeerMetrics, ProxyRegistry};
use meshproxy_conn::WgDevice;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Samples the device once and stores the result in the registry.
pub async fn collect_metrics(registry: &ProxyRegistry, device: &dyn WgDevice) -> Result<usize> {
	let iface = registry.interface_name().ok_or(EngineError::NoInterface)?;
	let info = device.device(&iface).await?;
	let now = SystemTime::now();

	let mut samples = HashMap::with_capacity(info.peers.len());
	for peer in info.peers {
		let handshake_age = peer
			.last_handshake
			.and_then(|t| now.duration_since(t).ok())
			.map(|d| d.as_secs());
		debug!(
			peer = %peer.public_key,
			rx = peer.rx_bytes,
			tx = peer.tx_bytes,
			handshake_age_secs = ?handshake_age,
			"peer metrics"
		);
		samples.insert(
			peer.public_key,
			PeerMetrics {
				rx_bytes: peer.rx_bytes,
				tx_bytes: peer.tx_bytes,
				last_handshake: peer.last_handshake,
				proxied: registry.proxy_peer(&peer.public_key).is_some(),
			},
		);
	}

	let count = samples.len();
	registry.record_peer_metrics(samples);
	Ok(count)
}

pub fn spawn_metrics_collector(
	registry: Arc<ProxyRegistry>,
	device: Arc<dyn WgDevice>,
	interval: Duration,
	cancel: CancellationToken,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		info!(interval_secs = interval.as_secs(), "metrics collection started");
		let mut ticker = tokio::time::interval(interval);
		ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

		loop {
			tokio::select! {
				biased;

				_ = cancel.cancelled() => break,

				_ = ticker.tick() => {
					match collect_metrics(&registry, device.as_ref()).await {
						Ok(peers) => debug!(peers, "collected peer metrics"),
						Err(EngineError::NoInterface) => debug!("no interface yet, skipping metrics"),
						Err(e) => warn!(error = %e, "metrics collection failed"),
					}
				}
			}
		}

		info!("metrics collection stopped");
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::registry::InterfaceBinding;
	use async_trait::async_trait;
	use meshproxy_common::WgPublicKey;
	use meshproxy_conn::{DeviceInfo, DevicePeer};
	use std::net::SocketAddr;

	struct CountingDevice {
		peers: Vec<DevicePeer>,
	}

	#[async_trait]
	impl WgDevice for CountingDevice {
		async fn device(&self, _iface: &str) -> meshproxy_conn::Result<DeviceInfo> {
			Ok(DeviceInfo {
				listen_port: 51820,
				public_key: None,
				peers: self.peers.clone(),
			})
		}

		async fn set_peer_endpoint(
			&self,
			_iface: &str,
			_key: &WgPublicKey,
			_endpoint: SocketAddr,
			_keepalive: Option<u16>,
		) -> meshproxy_conn::Result<()> {
			Ok(())
		}
	}

	fn device() -> CountingDevice {
		let mut peer = DevicePeer::new(WgPublicKey::from_bytes([2; 32]));
		peer.rx_bytes = 1200;
		peer.tx_bytes = 800;
		CountingDevice { peers: vec![peer] }
	}

	#[tokio::test]
	async fn test_collect_requires_interface() {
		let registry = ProxyRegistry::new(WgPublicKey::from_bytes([1; 32]));
		let err = collect_metrics(&registry, &device()).await.unwrap_err();
		assert!(matches!(err, EngineError::NoInterface));
	}

	#[tokio::test]
	async fn test_collect_records_samples() {
		let registry = ProxyRegistry::new(WgPublicKey::from_bytes([1; 32]));
		registry.set_interface_binding(InterfaceBinding {
			name: "nm-test".to_string(),
			listen_port: 51820,
		});

		let count = collect_metrics(&registry, &device()).await.unwrap();
		assert_eq!(count, 1);

		let metrics = registry.peer_metrics();
		let sample = &metrics[&WgPublicKey::from_bytes([2; 32])];
		assert_eq!(sample.rx_bytes, 1200);
		assert_eq!(sample.tx_bytes, 800);
		assert!(!sample.proxied);
	}

	#[tokio::test]
	async fn test_collector_stops_on_cancel() {
		let registry = Arc::new(ProxyRegistry::new(WgPublicKey::from_bytes([1; 32])));
		let cancel = CancellationToken::new();
		let handle = spawn_metrics_collector(
			registry,
			Arc::new(device()),
			Duration::from_millis(10),
			cancel.clone(),
		);

		cancel.cancel();
		tokio::time::timeout(Duration::from_secs(1), handle)
			.await
			.unwrap()
			.unwrap();
	}
}
