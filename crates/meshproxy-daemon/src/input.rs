// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use meshproxy_common::PeerUpdate;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Reads newline-delimited JSON updates and forwards them to the manager.
/// Malformed lines are logged and skipped. Returns the number of updates
/// forwarded once the reader hits EOF or the manager goes away.
pub async fn forward_updates<R>(reader: R, tx: mpsc::Sender<PeerUpdate>) -> usize
where
	R: AsyncBufRead + Unpin,
{
	let mut lines = reader.lines();
	let mut forwarded = 0;
	let mut line_no = 0usize;

	loop {
		let line = match lines.next_line().await {
			Ok(Some(line)) => line,
			Ok(None) => {
				info!(forwarded, "update stream ended");
				break;
			}
			Err(e) => {
				warn!(error = %e, "failed to read update stream");
				break;
			}
		};
		line_no += 1;

		let trimmed = line.trim();
		if trimmed.is_empty() {
			continue;
		}

		let update: PeerUpdate = match serde_json::from_str(trimmed) {
			Ok(update) => update,
			Err(e) => {
				warn!(line = line_no, error = %e, "skipping malformed peer update");
				continue;
			}
		};

		debug!(line = line_no, peers = update.peers.len(), action = ?update.action, "read peer update");
		if tx.send(update).await.is_err() {
			debug!("manager closed, stopping update reader");
			break;
		}
		forwarded += 1;
	}

	forwarded
}
