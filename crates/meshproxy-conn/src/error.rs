// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConnError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("STUN error: {0}")]
	Stun(#[from] crate::stun::StunError),

	#[error("key error: {0}")]
	Key(#[from] meshproxy_common::KeyError),

	#[error("WireGuard interface {0} not found")]
	InterfaceNotFound(String),

	#[error("WireGuard device returned errno {0}")]
	DeviceErrno(i32),

	#[error("malformed UAPI response: {0}")]
	MalformedUapi(String),

	#[error("datagram too short for proxy header: {0} bytes")]
	ShortDatagram(usize),
}

pub type Result<T> = std::result::Result<T, ConnError>;
