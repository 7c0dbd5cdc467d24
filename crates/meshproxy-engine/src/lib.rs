// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Userspace proxy engine for mesh WireGuard peers.
//!
//! A [`ProxyManager`] consumes peer updates and keeps one forwarding
//! connection per proxied peer, a [`ProxyServer`] owns the shared UDP socket
//! and an [`IngressRouter`] rewrites gateway traffic on ingress nodes. All
//! of them share a single [`ProxyRegistry`].

mod error;
pub mod ingress;
mod manager;
mod metrics;
mod peer_conn;
mod registry;
mod relay;
mod server;

pub use error::{EngineError, Result};
pub use ingress::{IngressRouter, PacketCapture, RawSocketCapture, RouterState};
pub use manager::{EngineConfig, ProxyManager};
pub use metrics::{collect_metrics, spawn_metrics_collector};
pub use peer_conn::{ConnContext, ConnState, NoProxyPeer, PeerConnConfig, PeerConnection};
pub use registry::{ExtClientWatch, InterfaceBinding, PeerMetrics, ProxyRegistry, RemotePeer};
pub use relay::{normalize_port, register_relayed_peers};
pub use server::{dispatch_datagram, Dispatch, OutboundDatagram, OutboundSender, ProxyServer};
