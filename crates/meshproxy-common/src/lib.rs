// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod host;
pub mod keys;
pub mod update;

pub use host::{HostInfo, NatType};
pub use keys::{KeyError, WgPublicKey};
pub use update::{
	IngressRoute, PeerConf, PeerDescriptor, PeerUpdate, ProxyAction, RelayedNodeConf, UpdateError,
	PROXY_PORT,
};
