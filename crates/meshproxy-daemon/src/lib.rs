// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Mesh proxy daemon: configuration loading and session wiring.

pub mod config;
pub mod daemon;
pub mod error;
pub mod input;

pub use config::{load_config, LogFormat, ProxyConfig};
pub use daemon::ProxyDaemon;
pub use error::{ConfigError, DaemonError, Result};
pub use input::forward_updates;
