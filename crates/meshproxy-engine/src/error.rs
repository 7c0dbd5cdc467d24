// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("connection error: {0}")]
	Conn(#[from] meshproxy_conn::ConnError),

	#[error("invalid peer update: {0}")]
	InvalidUpdate(#[from] meshproxy_common::UpdateError),

	#[error("capture error: {0}")]
	Capture(#[from] crate::ingress::CaptureError),

	#[error("failed to bind proxy socket on {addr}: {source}")]
	Bind {
		addr: std::net::SocketAddr,
		source: std::io::Error,
	},

	#[error("peer {0} has no endpoint")]
	NoEndpoint(String),

	#[error("no WireGuard interface bound")]
	NoInterface,
}

pub type Result<T> = std::result::Result<T, EngineError>;
