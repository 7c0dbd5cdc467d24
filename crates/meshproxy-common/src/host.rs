// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
	/// The host's local address is its public address.
	Public,
	/// Every destination sees the same mapped address.
	Cone,
	/// The mapping changes per destination; hole punching will not work.
	Symmetric,
	Unknown,
}

impl fmt::Display for NatType {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			NatType::Public => "public",
			NatType::Cone => "cone",
			NatType::Symmetric => "symmetric",
			NatType::Unknown => "unknown",
		};
		f.write_str(s)
	}
}

/// Result of NAT discovery. Replaced wholesale, never patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
	pub private_ip: IpAddr,
	pub private_port: u16,
	pub public_ip: IpAddr,
	pub public_port: u16,
	pub nat_type: NatType,
}

impl HostInfo {
	pub fn private_addr(&self) -> SocketAddr {
		SocketAddr::new(self.private_ip, self.private_port)
	}

	pub fn public_addr(&self) -> SocketAddr {
		SocketAddr::new(self.public_ip, self.public_port)
	}

	pub fn is_behind_nat(&self) -> bool {
		!matches!(self.nat_type, NatType::Public)
	}
}
