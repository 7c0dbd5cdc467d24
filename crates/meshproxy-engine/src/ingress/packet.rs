// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Address rewriting for packets crossing the ingress gateway.

use meshproxy_common::IngressRoute;
use pnet_packet::icmpv6::{self, MutableIcmpv6Packet};
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::{self, MutableIpv4Packet};
use pnet_packet::ipv6::MutableIpv6Packet;
use pnet_packet::tcp::{self, MutableTcpPacket};
use pnet_packet::udp::{self, MutableUdpPacket};
use pnet_packet::MutablePacket;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
	#[error("empty packet")]
	Empty,

	#[error("unsupported IP version {0}")]
	UnsupportedVersion(u8),

	#[error("truncated IPv{0} packet")]
	Truncated(u8),

	#[error("address family mismatch: packet is IPv{packet}, mapping is {mapped}")]
	FamilyMismatch { packet: u8, mapped: IpAddr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteDirection {
	/// External network towards the mesh. Looked up by source address.
	Inbound,
	/// Mesh towards the external network. Looked up by destination address.
	Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngressRoutingInfo {
	pub external_ip: IpAddr,
	pub internal_ip: IpAddr,
	pub direction: RouteDirection,
}

impl IngressRoutingInfo {
	pub fn new(route: IngressRoute, direction: RouteDirection) -> Self {
		Self {
			external_ip: route.external_ip,
			internal_ip: route.internal_ip,
			direction,
		}
	}
}

pub enum IpPacket<'a> {
	V4(MutableIpv4Packet<'a>),
	V6(MutableIpv6Packet<'a>),
}

impl<'a> IpPacket<'a> {
	pub fn parse(buf: &'a mut [u8]) -> Result<Self, PacketError> {
		let version = buf.first().ok_or(PacketError::Empty)? >> 4;
		match version {
			4 => MutableIpv4Packet::new(buf)
				.map(IpPacket::V4)
				.ok_or(PacketError::Truncated(4)),
			6 => MutableIpv6Packet::new(buf)
				.map(IpPacket::V6)
				.ok_or(PacketError::Truncated(6)),
			v => Err(PacketError::UnsupportedVersion(v)),
		}
	}

	pub fn version(&self) -> u8 {
		match self {
			IpPacket::V4(_) => 4,
			IpPacket::V6(_) => 6,
		}
	}

	pub fn source(&self) -> IpAddr {
		match self {
			IpPacket::V4(p) => IpAddr::V4(p.get_source()),
			IpPacket::V6(p) => IpAddr::V6(p.get_source()),
		}
	}

	pub fn destination(&self) -> IpAddr {
		match self {
			IpPacket::V4(p) => IpAddr::V4(p.get_destination()),
			IpPacket::V6(p) => IpAddr::V6(p.get_destination()),
		}
	}

	/// Rewrites both addresses and recomputes every checksum they feed.
	pub fn set_addresses(&mut self, source: IpAddr, destination: IpAddr) -> Result<(), PacketError> {
		match (self, source, destination) {
			(IpPacket::V4(p), IpAddr::V4(src), IpAddr::V4(dst)) => {
				p.set_source(src);
				p.set_destination(dst);
				fix_ipv4_checksums(p);
				Ok(())
			}
			(IpPacket::V6(p), IpAddr::V6(src), IpAddr::V6(dst)) => {
				p.set_source(src);
				p.set_destination(dst);
				fix_ipv6_checksums(p);
				Ok(())
			}
			(packet, src, dst) => {
				let mapped = if src.is_ipv4() == (packet.version() == 4) { dst } else { src };
				Err(PacketError::FamilyMismatch {
					packet: packet.version(),
					mapped,
				})
			}
		}
	}
}

fn fix_ipv4_checksums(p: &mut MutableIpv4Packet<'_>) {
	let src = p.get_source();
	let dst = p.get_destination();
	let proto = p.get_next_level_protocol();

	// Only the first fragment carries the transport header.
	if p.get_fragment_offset() == 0 {
		fix_transport_v4(proto, p.payload_mut(), &src, &dst);
	}

	let sum = ipv4::checksum(&p.to_immutable());
	p.set_checksum(sum);
}

fn fix_transport_v4(proto: IpNextHeaderProtocol, payload: &mut [u8], src: &Ipv4Addr, dst: &Ipv4Addr) {
	match proto {
		IpNextHeaderProtocols::Tcp => {
			if let Some(mut tcp) = MutableTcpPacket::new(payload) {
				let sum = tcp::ipv4_checksum(&tcp.to_immutable(), src, dst);
				tcp.set_checksum(sum);
			}
		}
		IpNextHeaderProtocols::Udp => {
			if let Some(mut udp) = MutableUdpPacket::new(payload) {
				// Zero means the sender opted out of the checksum.
				if udp.get_checksum() != 0 {
					let sum = udp::ipv4_checksum(&udp.to_immutable(), src, dst);
					udp.set_checksum(sum);
				}
			}
		}
		_ => {}
	}
}

fn fix_ipv6_checksums(p: &mut MutableIpv6Packet<'_>) {
	let src = p.get_source();
	let dst = p.get_destination();
	let next = p.get_next_header();
	fix_transport_v6(next, p.payload_mut(), &src, &dst);
}

fn fix_transport_v6(next: IpNextHeaderProtocol, payload: &mut [u8], src: &Ipv6Addr, dst: &Ipv6Addr) {
	match next {
		IpNextHeaderProtocols::Tcp => {
			if let Some(mut tcp) = MutableTcpPacket::new(payload) {
				let sum = tcp::ipv6_checksum(&tcp.to_immutable(), src, dst);
				tcp.set_checksum(sum);
			}
		}
		IpNextHeaderProtocols::Udp => {
			if let Some(mut udp) = MutableUdpPacket::new(payload) {
				let sum = udp::ipv6_checksum(&udp.to_immutable(), src, dst);
				udp.set_checksum(sum);
			}
		}
		IpNextHeaderProtocols::Icmpv6 => {
			if let Some(mut icmp) = MutableIcmpv6Packet::new(payload) {
				let sum = icmpv6::checksum(&icmp.to_immutable(), src, dst);
				icmp.set_checksum(sum);
			}
		}
		_ => {}
	}
}

/// Rewrites `buf` in place if a route matches. Returns whether the packet
/// was rewritten and should be injected.
///
/// Inbound packets are matched on their source and get the internal mesh
/// address as the new source. Outbound packets are matched on their
/// destination and get the external address as the new destination.
pub fn route_packet<F>(buf: &mut [u8], direction: RouteDirection, lookup: F) -> Result<bool, PacketError>
where
	F: Fn(IpAddr, RouteDirection) -> Option<IngressRoutingInfo>,
{
	let mut packet = IpPacket::parse(buf)?;
	let src = packet.source();
	let dst = packet.destination();

	let rewritten = match direction {
		RouteDirection::Inbound => lookup(src, direction).map(|info| (info.internal_ip, dst)),
		RouteDirection::Outbound => lookup(dst, direction).map(|info| (src, info.external_ip)),
	};

	match rewritten {
		Some((new_src, new_dst)) => {
			packet.set_addresses(new_src, new_dst)?;
			Ok(true)
		}
		None => Ok(false),
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pnet_packet::icmpv6::Icmpv6Packet;
	use pnet_packet::ipv4::Ipv4Packet;
	use pnet_packet::ipv6::Ipv6Packet;
	use pnet_packet::tcp::TcpPacket;
	use pnet_packet::udp::UdpPacket;

	const EXTERNAL: &str = "192.168.50.10";
	const INTERNAL: &str = "10.10.0.5";
	const MESH_PEER: &str = "10.10.0.1";

	fn ip(s: &str) -> IpAddr {
		s.parse().unwrap()
	}

	fn v4(s: &str) -> Ipv4Addr {
		s.parse().unwrap()
	}

	fn udp_v4(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
		let total = 20 + 8 + payload.len();
		let mut buf = vec![0u8; total];
		{
			let mut ipp = MutableIpv4Packet::new(&mut buf).unwrap();
			ipp.set_version(4);
			ipp.set_header_length(5);
			ipp.set_total_length(total as u16);
			ipp.set_ttl(64);
			ipp.set_next_level_protocol(IpNextHeaderProtocols::Udp);
			ipp.set_source(src);
			ipp.set_destination(dst);
		}
		{
			let mut udpp = MutableUdpPacket::new(&mut buf[20..]).unwrap();
			udpp.set_source(40000);
			udpp.set_destination(53);
			udpp.set_length((8 + payload.len()) as u16);
			udpp.set_payload(payload);
			let sum = udp::ipv4_checksum(&udpp.to_immutable(), &src, &dst);
			udpp.set_checksum(sum);
		}
		{
			let mut ipp = MutableIpv4Packet::new(&mut buf).unwrap();
			let sum = ipv4::checksum(&ipp.to_immutable());
			ipp.set_checksum(sum);
		}
		buf
	}

	fn v6_packet(next: IpNextHeaderProtocol, src: Ipv6Addr, dst: Ipv6Addr, transport: &[u8]) -> Vec<u8> {
		let mut buf = vec![0u8; 40 + transport.len()];
		{
			let mut ipp = MutableIpv6Packet::new(&mut buf).unwrap();
			ipp.set_version(6);
			ipp.set_payload_length(transport.len() as u16);
			ipp.set_next_header(next);
			ipp.set_hop_limit(64);
			ipp.set_source(src);
			ipp.set_destination(dst);
		}
		buf[40..].copy_from_slice(transport);
		buf
	}

	fn udp_v4_checksums_ok(buf: &[u8]) -> bool {
		let ipp = Ipv4Packet::new(buf).unwrap();
		let udpp = UdpPacket::new(&buf[20..]).unwrap();
		ipv4::checksum(&ipp) == ipp.get_checksum()
			&& udp::ipv4_checksum(&udpp, &ipp.get_source(), &ipp.get_destination()) == udpp.get_checksum()
	}

	fn table(addr: IpAddr, direction: RouteDirection) -> Option<IngressRoutingInfo> {
		let route = IngressRoute {
			external_ip: ip(EXTERNAL),
			internal_ip: ip(INTERNAL),
		};
		match direction {
			RouteDirection::Inbound if addr == route.external_ip => Some(IngressRoutingInfo::new(route, direction)),
			RouteDirection::Outbound if addr == route.internal_ip => Some(IngressRoutingInfo::new(route, direction)),
			_ => None,
		}
	}

	#[test]
	fn test_inbound_rewrites_source_to_internal() {
		let mut buf = udp_v4(v4(EXTERNAL), v4(MESH_PEER), b"query");

		assert_eq!(route_packet(&mut buf, RouteDirection::Inbound, table), Ok(true));

		let ipp = Ipv4Packet::new(&buf).unwrap();
		assert_eq!(ipp.get_source(), v4(INTERNAL));
		assert_eq!(ipp.get_destination(), v4(MESH_PEER));
		assert!(udp_v4_checksums_ok(&buf));
	}

	#[test]
	fn test_outbound_rewrites_destination_to_external() {
		let mut buf = udp_v4(v4(MESH_PEER), v4(INTERNAL), b"answer");

		assert_eq!(route_packet(&mut buf, RouteDirection::Outbound, table), Ok(true));

		let ipp = Ipv4Packet::new(&buf).unwrap();
		assert_eq!(ipp.get_source(), v4(MESH_PEER));
		assert_eq!(ipp.get_destination(), v4(EXTERNAL));
		assert!(udp_v4_checksums_ok(&buf));
	}

	#[test]
	fn test_unmapped_packet_is_untouched() {
		let original = udp_v4(v4("172.16.0.1"), v4(MESH_PEER), b"x");
		let mut buf = original.clone();

		assert_eq!(route_packet(&mut buf, RouteDirection::Inbound, table), Ok(false));
		assert_eq!(buf, original);
	}

	#[test]
	fn test_non_first_fragment_only_gets_header_checksum() {
		let mut buf = udp_v4(v4(EXTERNAL), v4(MESH_PEER), b"fragment-body");
		{
			let mut ipp = MutableIpv4Packet::new(&mut buf).unwrap();
			ipp.set_fragment_offset(10);
		}
		let transport_before = buf[20..].to_vec();

		assert_eq!(route_packet(&mut buf, RouteDirection::Inbound, table), Ok(true));

		let ipp = Ipv4Packet::new(&buf).unwrap();
		assert_eq!(ipv4::checksum(&ipp), ipp.get_checksum());
		assert_eq!(&buf[20..], &transport_before[..]);
	}

	#[test]
	fn test_ipv6_tcp_checksum_recomputed() {
		let src: Ipv6Addr = "fd00::10".parse().unwrap();
		let dst: Ipv6Addr = "fd00::1".parse().unwrap();
		let mut tcp_bytes = vec![0u8; 20];
		{
			let mut tcpp = MutableTcpPacket::new(&mut tcp_bytes).unwrap();
			tcpp.set_source(443);
			tcpp.set_destination(50000);
			tcpp.set_data_offset(5);
		}
		let mut buf = v6_packet(IpNextHeaderProtocols::Tcp, src, dst, &tcp_bytes);
		let internal: Ipv6Addr = "fd00::99".parse().unwrap();
		let lookup = |addr: IpAddr, direction: RouteDirection| {
			(addr == IpAddr::V6(src)).then(|| {
				IngressRoutingInfo::new(
					IngressRoute {
						external_ip: IpAddr::V6(src),
						internal_ip: IpAddr::V6(internal),
					},
					direction,
				)
			})
		};

		assert_eq!(route_packet(&mut buf, RouteDirection::Inbound, lookup), Ok(true));

		let ipp = Ipv6Packet::new(&buf).unwrap();
		assert_eq!(ipp.get_source(), internal);
		let tcpp = TcpPacket::new(&buf[40..]).unwrap();
		assert_eq!(tcp::ipv6_checksum(&tcpp, &internal, &dst), tcpp.get_checksum());
	}

	#[test]
	fn test_ipv6_icmp_checksum_recomputed() {
		let src: Ipv6Addr = "fd00::1".parse().unwrap();
		let internal: Ipv6Addr = "fd00::20".parse().unwrap();
		let external: Ipv6Addr = "2001:db8::7".parse().unwrap();
		let icmp_bytes = [128u8, 0, 0, 0, 0, 1, 0, 1];
		let mut buf = v6_packet(IpNextHeaderProtocols::Icmpv6, src, internal, &icmp_bytes);
		let lookup = |addr: IpAddr, direction: RouteDirection| {
			(addr == IpAddr::V6(internal)).then(|| {
				IngressRoutingInfo::new(
					IngressRoute {
						external_ip: IpAddr::V6(external),
						internal_ip: IpAddr::V6(internal),
					},
					direction,
				)
			})
		};

		assert_eq!(route_packet(&mut buf, RouteDirection::Outbound, lookup), Ok(true));

		let icmp = Icmpv6Packet::new(&buf[40..]).unwrap();
		assert_eq!(icmpv6::checksum(&icmp, &src, &external), icmp.get_checksum());
	}

	#[test]
	fn test_family_mismatch_is_error() {
		let mut buf = udp_v4(v4(EXTERNAL), v4(MESH_PEER), b"x");
		let lookup = |_: IpAddr, direction: RouteDirection| {
			Some(IngressRoutingInfo::new(
				IngressRoute {
					external_ip: ip(EXTERNAL),
					internal_ip: ip("fd00::5"),
				},
				direction,
			))
		};

		let err = route_packet(&mut buf, RouteDirection::Inbound, lookup).unwrap_err();
		assert_eq!(
			err,
			PacketError::FamilyMismatch {
				packet: 4,
				mapped: ip("fd00::5"),
			}
		);
	}

	#[test]
	fn test_garbage_is_rejected() {
		assert_eq!(IpPacket::parse(&mut []).err(), Some(PacketError::Empty));
		assert_eq!(
			IpPacket::parse(&mut [0x50, 0, 0]).err(),
			Some(PacketError::UnsupportedVersion(5))
		);
		assert_eq!(IpPacket::parse(&mut [0x45, 0, 0]).err(), Some(PacketError::Truncated(4)));
	}
}
