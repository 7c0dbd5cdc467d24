// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Live packet capture and raw injection on a named interface.

use std::fmt;
use std::net::IpAddr;
use std::time::Duration;
use thiserror::Error;

/// How long a capture read may block before cancellation is rechecked.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum CaptureError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("interface {0} not found")]
	InterfaceNotFound(String),

	#[error("invalid interface name: {0}")]
	InvalidInterface(String),

	#[error("packet capture is not supported on this platform")]
	Unsupported,
}

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureDirection {
	Incoming,
	Outgoing,
}

/// Which packets a handle should surface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureFilter {
	pub direction: CaptureDirection,
	pub exclude_hosts: Vec<IpAddr>,
}

impl CaptureFilter {
	pub fn new(direction: CaptureDirection) -> Self {
		Self {
			direction,
			exclude_hosts: Vec::new(),
		}
	}

	pub fn excluding(mut self, host: IpAddr) -> Self {
		self.exclude_hosts.push(host);
		self
	}

	pub fn matches(&self, packet_direction: CaptureDirection, src: IpAddr, dst: IpAddr) -> bool {
		packet_direction == self.direction
			&& !self
				.exclude_hosts
				.iter()
				.any(|host| *host == src || *host == dst)
	}
}

/// Renders in pcap filter syntax for logs.
impl fmt::Display for CaptureFilter {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.direction {
			CaptureDirection::Incoming => f.write_str("inbound")?,
			CaptureDirection::Outgoing => f.write_str("outbound")?,
		}
		for host in &self.exclude_hosts {
			write!(f, " and not host {host}")?;
		}
		Ok(())
	}
}

pub trait CaptureHandle: Send {
	fn set_filter(&mut self, filter: &CaptureFilter) -> Result<()>;

	/// Reads one network-layer packet into `buf`. Returns `Ok(None)` when the
	/// poll timeout elapses without a matching packet.
	fn next_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>>;

	fn inject(&mut self, packet: &[u8]) -> Result<()>;
}

pub trait PacketCapture: Send + Sync {
	fn open(&self, iface: &str, direction: CaptureDirection) -> Result<Box<dyn CaptureHandle>>;
}

/// `AF_PACKET` capture with `IPPROTO_RAW` injection.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawSocketCapture;

#[cfg(target_os = "linux")]
mod linux {
	use super::*;
	use socket2::{Domain, Protocol, SockAddr, Socket, Type};
	use std::io;
	use std::mem::{self, MaybeUninit};
	use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
	use tracing::debug;

	const ETH_P_ALL: u16 = 0x0003;
	const PACKET_OUTGOING: u8 = 4;

	pub(super) struct RawHandle {
		iface: String,
		capture: Socket,
		inject_v4: Option<Socket>,
		inject_v6: Option<Socket>,
		filter: CaptureFilter,
	}

	fn interface_index(iface: &str) -> Result<u32> {
		let name =
			std::ffi::CString::new(iface).map_err(|_| CaptureError::InvalidInterface(iface.to_string()))?;
		// SAFETY: `name` is a valid NUL-terminated string for the duration of the call.
		let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
		if index == 0 {
			return Err(CaptureError::InterfaceNotFound(iface.to_string()));
		}
		Ok(index)
	}

	fn link_layer_addr(index: u32) -> SockAddr {
		// SAFETY: sockaddr_ll fits in sockaddr_storage and every field is
		// written before the storage is handed to SockAddr.
		unsafe {
			let mut storage: libc::sockaddr_storage = mem::zeroed();
			let ll = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_ll;
			(*ll).sll_family = libc::AF_PACKET as u16;
			(*ll).sll_protocol = ETH_P_ALL.to_be();
			(*ll).sll_ifindex = index as i32;
			SockAddr::new(storage, mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t)
		}
	}

	fn packet_type(addr: &SockAddr) -> u8 {
		// SAFETY: addresses returned by an AF_PACKET socket are sockaddr_ll.
		unsafe { (*addr.as_ptr().cast::<libc::sockaddr_ll>()).sll_pkttype }
	}

	fn raw_injector(domain: Domain, iface: &str) -> io::Result<Socket> {
		let socket = Socket::new(domain, Type::RAW, Some(Protocol::from(libc::IPPROTO_RAW)))?;
		socket.bind_device(Some(iface.as_bytes()))?;
		Ok(socket)
	}

	fn addresses(packet: &[u8]) -> Option<(IpAddr, IpAddr)> {
		match packet.first()? >> 4 {
			4 if packet.len() >= 20 => {
				let src: [u8; 4] = packet[12..16].try_into().ok()?;
				let dst: [u8; 4] = packet[16..20].try_into().ok()?;
				Some((Ipv4Addr::from(src).into(), Ipv4Addr::from(dst).into()))
			}
			6 if packet.len() >= 40 => {
				let src: [u8; 16] = packet[8..24].try_into().ok()?;
				let dst: [u8; 16] = packet[24..40].try_into().ok()?;
				Some((Ipv6Addr::from(src).into(), Ipv6Addr::from(dst).into()))
			}
			_ => None,
		}
	}

	impl RawHandle {
		pub(super) fn open(iface: &str, direction: CaptureDirection) -> Result<Self> {
			let index = interface_index(iface)?;
			let capture = Socket::new(
				Domain::PACKET,
				Type::DGRAM,
				Some(Protocol::from(i32::from(ETH_P_ALL.to_be()))),
			)?;
			capture.bind(&link_layer_addr(index))?;
			capture.set_read_timeout(Some(POLL_TIMEOUT))?;
			debug!(iface, index, ?direction, "opened capture socket");

			Ok(Self {
				iface: iface.to_string(),
				capture,
				inject_v4: None,
				inject_v6: None,
				filter: CaptureFilter::new(direction),
			})
		}
	}

	impl CaptureHandle for RawHandle {
		fn set_filter(&mut self, filter: &CaptureFilter) -> Result<()> {
			self.filter = filter.clone();
			Ok(())
		}

		fn next_packet(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
			// SAFETY: recv_from only writes initialized bytes into the buffer
			// and reports how many it wrote.
			let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
			let (len, from) = match self.capture.recv_from(uninit) {
				Ok(res) => res,
				Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
					return Ok(None)
				}
				Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(None),
				Err(e) => return Err(e.into()),
			};

			let direction = if packet_type(&from) == PACKET_OUTGOING {
				CaptureDirection::Outgoing
			} else {
				CaptureDirection::Incoming
			};

			match addresses(&buf[..len]) {
				Some((src, dst)) if self.filter.matches(direction, src, dst) => Ok(Some(len)),
				_ => Ok(None),
			}
		}

		fn inject(&mut self, packet: &[u8]) -> Result<()> {
			let Some((_, dst)) = addresses(packet) else {
				return Ok(());
			};
			let (slot, domain) = match dst {
				IpAddr::V4(_) => (&mut self.inject_v4, Domain::IPV4),
				IpAddr::V6(_) => (&mut self.inject_v6, Domain::IPV6),
			};
			if slot.is_none() {
				*slot = Some(raw_injector(domain, &self.iface)?);
			}
			if let Some(socket) = slot.as_ref() {
				socket.send_to(packet, &SocketAddr::new(dst, 0).into())?;
			}
			Ok(())
		}
	}
}

impl PacketCapture for RawSocketCapture {
	#[cfg(target_os = "linux")]
	fn open(&self, iface: &str, direction: CaptureDirection) -> Result<Box<dyn CaptureHandle>> {
		Ok(Box::new(linux::RawHandle::open(iface, direction)?))
	}

	#[cfg(not(target_os = "linux"))]
	fn open(&self, _iface: &str, _direction: CaptureDirection) -> Result<Box<dyn CaptureHandle>> {
		Err(CaptureError::Unsupported)
	}
}
