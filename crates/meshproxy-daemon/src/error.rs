// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DaemonError {
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),

	#[error("engine error: {0}")]
	Engine(#[from] meshproxy_engine::EngineError),

	#[error("connection error: {0}")]
	Conn(#[from] meshproxy_conn::ConnError),

	#[error("task failed: {0}")]
	Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("failed to read config file {path}: {source}")]
	FileRead {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("failed to parse config file {path}: {source}")]
	TomlParse {
		path: PathBuf,
		#[source]
		source: toml::de::Error,
	},

	#[error("invalid value for {key}: {value}")]
	InvalidValue { key: String, value: String },

	#[error("validation error: {0}")]
	Validation(String),
}

pub type Result<T> = std::result::Result<T, DaemonError>;
