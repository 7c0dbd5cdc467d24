// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Connectivity plumbing for the mesh proxy: STUN-based NAT discovery, the
//! header carried on proxied datagrams, and access to the WireGuard device.

pub mod device;
pub mod error;
pub mod nat;
pub mod stun;
pub mod wire;

pub use device::{DeviceInfo, DevicePeer, UapiDevice, WgDevice};
pub use error::{ConnError, Result};
pub use nat::{classify_nat, discover_host_info};
pub use stun::{resolve_stun_servers, StunError, DEFAULT_STUN_SERVERS};
pub use wire::{ProxyHeader, HEADER_LEN, PROXY_MAGIC};
