// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Gateway packet router.
//!
//! On ingress nodes two capture loops run on the mesh interface: inbound
//! packets from the external network get their source rewritten to the
//! internal mesh address, outbound packets get their destination rewritten
//! back to the external address.

mod capture;
mod packet;

pub use capture::{
	CaptureDirection, CaptureError, CaptureFilter, CaptureHandle, PacketCapture, RawSocketCapture,
	POLL_TIMEOUT,
};
pub use packet::{route_packet, IngressRoutingInfo, IpPacket, PacketError, RouteDirection};

use crate::registry::ProxyRegistry;
use parking_lot::Mutex;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const MAX_PACKET: usize = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterState {
	Stopped,
	Starting,
	Running,
}

/// Current state plus the id of the run it belongs to. A finished run only
/// marks the router stopped if no newer run has started since.
#[derive(Debug)]
struct RunState {
	state: RouterState,
	run: u64,
}

pub struct IngressRouter {
	registry: Arc<ProxyRegistry>,
	capture: Arc<dyn PacketCapture>,
	state: Arc<Mutex<RunState>>,
	cancel: Mutex<Option<CancellationToken>>,
}

impl IngressRouter {
	pub fn new(registry: Arc<ProxyRegistry>, capture: Arc<dyn PacketCapture>) -> Self {
		Self {
			registry,
			capture,
			state: Arc::new(Mutex::new(RunState {
				state: RouterState::Stopped,
				run: 0,
			})),
			cancel: Mutex::new(None),
		}
	}

	pub fn state(&self) -> RouterState {
		self.state.lock().state
	}

	pub fn is_running(&self) -> bool {
		self.state() != RouterState::Stopped
	}

	/// Opens both capture handles and launches the loops. A no-op if the
	/// router is already starting or running. Any setup failure leaves it
	/// stopped.
	#[instrument(skip(self, parent))]
	pub fn start(
		&self,
		iface: &str,
		gateway_ip: Option<IpAddr>,
		parent: &CancellationToken,
	) -> crate::Result<()> {
		let run = {
			let mut current = self.state.lock();
			if current.state != RouterState::Stopped {
				debug!(state = ?current.state, "ingress router already active");
				return Ok(());
			}
			current.state = RouterState::Starting;
			current.run += 1;
			current.run
		};

		match self.launch(iface, gateway_ip, parent, run) {
			Ok(token) => {
				*self.cancel.lock() = Some(token);
				info!("ingress router running");
				Ok(())
			}
			Err(e) => {
				self.mark_stopped(run);
				warn!(error = %e, "failed to start ingress router");
				Err(e)
			}
		}
	}

	fn launch(
		&self,
		iface: &str,
		gateway_ip: Option<IpAddr>,
		parent: &CancellationToken,
		run: u64,
	) -> crate::Result<CancellationToken> {
		if iface.is_empty() {
			return Err(crate::EngineError::NoInterface);
		}

		let mut outbound = self.capture.open(iface, CaptureDirection::Outgoing)?;
		let mut inbound = self.capture.open(iface, CaptureDirection::Incoming)?;

		let mut in_filter = CaptureFilter::new(CaptureDirection::Incoming);
		let mut out_filter = CaptureFilter::new(CaptureDirection::Outgoing);
		if let Some(gw) = gateway_ip {
			in_filter = in_filter.excluding(gw);
			out_filter = out_filter.excluding(gw);
		}
		inbound.set_filter(&in_filter)?;
		outbound.set_filter(&out_filter)?;
		debug!(inbound = %in_filter, outbound = %out_filter, "capture filters installed");

		let token = parent.child_token();
		let in_task = spawn_capture_loop(
			inbound,
			RouteDirection::Inbound,
			Arc::clone(&self.registry),
			token.clone(),
		);
		let out_task = spawn_capture_loop(
			outbound,
			RouteDirection::Outbound,
			Arc::clone(&self.registry),
			token.clone(),
		);

		self.state.lock().state = RouterState::Running;

		let state = Arc::clone(&self.state);
		let supervisor_token = token.clone();
		tokio::spawn(async move {
			let (in_res, out_res) = tokio::join!(in_task, out_task);
			if let Err(e) = in_res.and(out_res) {
				warn!(error = %e, "capture loop panicked");
			}
			// Either loop ending on its own takes the other one down too.
			supervisor_token.cancel();
			let mut current = state.lock();
			if current.run == run {
				current.state = RouterState::Stopped;
				info!("ingress router stopped");
			}
		});

		Ok(token)
	}

	/// Cancels the current run. The router counts as stopped right away so a
	/// following `start` launches a new run while the old loops drain.
	pub fn stop(&self) {
		if let Some(token) = self.cancel.lock().take() {
			info!("stopping ingress router");
			token.cancel();
			self.state.lock().state = RouterState::Stopped;
		}
	}

	fn mark_stopped(&self, run: u64) {
		let mut current = self.state.lock();
		if current.run == run {
			current.state = RouterState::Stopped;
		}
	}
}

fn spawn_capture_loop(
	mut handle: Box<dyn CaptureHandle>,
	direction: RouteDirection,
	registry: Arc<ProxyRegistry>,
	cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
	tokio::task::spawn_blocking(move || {
		let mut buf = vec![0u8; MAX_PACKET];
		debug!(?direction, "capture loop started");

		while !cancel.is_cancelled() {
			let len = match handle.next_packet(&mut buf) {
				Ok(Some(len)) => len,
				Ok(None) => continue,
				Err(e) => {
					warn!(?direction, error = %e, "capture failed, stopping loop");
					cancel.cancel();
					break;
				}
			};

			let packet = &mut buf[..len];
			match route_packet(packet, direction, |ip, dir| registry.ingress_route(ip, dir)) {
				Ok(true) => {
					if let Err(e) = handle.inject(packet) {
						warn!(?direction, error = %e, "failed to inject packet");
					}
				}
				Ok(false) => {}
				Err(e) => debug!(?direction, error = %e, "dropping packet"),
			}
		}

		debug!(?direction, "capture loop exited");
	})
}

const IPV4_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";
const IPV6_FORWARD: &str = "/proc/sys/net/ipv6/conf/all/forwarding";

/// Turns on kernel IP forwarding for both families.
pub fn enable_ip_forwarding() -> std::io::Result<()> {
	enable_forwarding_at(Path::new(IPV4_FORWARD), Path::new(IPV6_FORWARD))
}

pub(crate) fn enable_forwarding_at(v4: &Path, v6: &Path) -> std::io::Result<()> {
	for path in [v4, v6] {
		let current = std::fs::read_to_string(path).unwrap_or_default();
		if current.trim() == "1" {
			continue;
		}
		std::fs::write(path, "1")?;
		info!(path = %path.display(), "enabled IP forwarding");
	}
	Ok(())
}
