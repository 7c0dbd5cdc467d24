// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use crate::error::Result;
use crate::stun::{self, StunError};
use meshproxy_common::{HostInfo, NatType};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{info, instrument, warn};

/// Classifies the NAT from the address we bound and what each STUN server saw.
/// Returns the public address to advertise alongside the class.
pub fn classify_nat(private: SocketAddr, mapped: &[SocketAddr]) -> (NatType, SocketAddr) {
	let Some(first) = mapped.first().copied() else {
		return (NatType::Unknown, private);
	};

	if mapped.iter().all(|m| *m == first) {
		if first == private {
			(NatType::Public, first)
		} else {
			(NatType::Cone, first)
		}
	} else {
		(NatType::Symmetric, first)
	}
}

/// Local address the kernel would use to reach `target`. No packet is sent.
async fn route_source_ip(target: SocketAddr) -> Option<IpAddr> {
	let probe = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await.ok()?;
	probe.connect(target).await.ok()?;
	probe.local_addr().ok().map(|a| a.ip())
}

/// Runs NAT discovery from the proxy port. The discovery socket is closed
/// before returning so the proxy server can bind the same port.
#[instrument(skip(stun_servers), fields(servers = stun_servers.len()))]
pub async fn discover_host_info(listen_port: u16, stun_servers: &[SocketAddr]) -> Result<HostInfo> {
	let private_ip = match stun_servers.first() {
		Some(server) => route_source_ip(*server).await,
		None => None,
	}
	.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

	let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, listen_port)).await?;
	let private_port = socket.local_addr()?.port();
	let private = SocketAddr::new(private_ip, private_port);

	let mapped: Vec<SocketAddr> = match stun::query_mappings(&socket, stun_servers).await {
		Ok(mappings) => mappings.into_iter().map(|m| m.mapped).collect(),
		Err(StunError::NoServers) => {
			warn!("no STUN servers configured, NAT type unknown");
			Vec::new()
		}
		Err(e) => return Err(e.into()),
	};
	drop(socket);

	let (nat_type, public) = classify_nat(private, &mapped);
	if nat_type == NatType::Unknown {
		warn!(%private, "no STUN server answered, using private address as public");
	}

	let host = HostInfo {
		private_ip,
		private_port,
		public_ip: public.ip(),
		public_port: public.port(),
		nat_type,
	};
	info!(%private, %public, %nat_type, "discovered host info");
	Ok(host)
}

#[cfg(test)]
mod tests {
	use super::*;

	fn addr(s: &str) -> SocketAddr {
		s.parse().unwrap()
	}

	#[test]
	fn test_classify_public() {
		let private = addr("203.0.113.5:51722");
		let (nat, public) = classify_nat(private, &[private, private]);
		assert_eq!(nat, NatType::Public);
		assert_eq!(public, private);
	}

	#[test]
	fn test_classify_cone() {
		let mapped = addr("203.0.113.5:40000");
		let (nat, public) = classify_nat(addr("192.168.1.2:51722"), &[mapped, mapped]);
		assert_eq!(nat, NatType::Cone);
		assert_eq!(public, mapped);
	}

	#[test]
	fn test_classify_symmetric() {
		let (nat, public) = classify_nat(
			addr("192.168.1.2:51722"),
			&[addr("203.0.113.5:40000"), addr("203.0.113.5:40001")],
		);
		assert_eq!(nat, NatType::Symmetric);
		assert_eq!(public, addr("203.0.113.5:40000"));
	}

	#[test]
	fn test_classify_no_answers_falls_back_to_private() {
		let private = addr("192.168.1.2:51722");
		assert_eq!(classify_nat(private, &[]), (NatType::Unknown, private));
	}

	#[tokio::test]
	async fn test_discover_without_servers() {
		let host = discover_host_info(0, &[]).await.unwrap();
		assert_eq!(host.nat_type, NatType::Unknown);
		assert_ne!(host.private_port, 0);
		assert_eq!(host.public_addr(), host.private_addr());
	}
}
