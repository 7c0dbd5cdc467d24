// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use clap::Parser;
use meshproxy_daemon::{forward_updates, load_config, LogFormat, ProxyDaemon};
use std::path::PathBuf;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const UPDATE_QUEUE: usize = 32;

/// Userspace NAT-traversal proxy for a mesh WireGuard interface.
///
/// Peer updates are read from stdin as newline-delimited JSON.
#[derive(Parser, Debug)]
#[command(name = "meshproxy", version)]
struct Args {
	/// Path to a TOML configuration file.
	#[arg(short, long, env = "MESHPROXY_CONFIG")]
	config: Option<PathBuf>,
}

fn init_tracing(format: LogFormat) {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let registry = tracing_subscriber::registry().with(filter);
	match format {
		LogFormat::Json => registry
			.with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
			.init(),
		LogFormat::Pretty => registry
			.with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
			.init(),
	}
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let config = load_config(args.config.as_deref())?;
	init_tracing(config.log_format);

	info!(
		iface = %config.interface,
		port = config.listen_port,
		public_key = %config.public_key,
		"starting meshproxy"
	);

	let shutdown = CancellationToken::new();
	let (tx, rx) = mpsc::channel(UPDATE_QUEUE);

	let reader = tokio::spawn(async move {
		forward_updates(BufReader::new(tokio::io::stdin()), tx).await;
	});

	let signal_token = shutdown.clone();
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => {
				info!("interrupt received, shutting down");
				signal_token.cancel();
			}
			Err(e) => warn!(error = %e, "failed to listen for interrupt"),
		}
	});

	ProxyDaemon::new(config).run(rx, shutdown).await?;
	reader.abort();
	Ok(())
}
