// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Daemon configuration.
//!
//! Layers are merged in precedence order: built-in defaults, an optional
//! TOML file, then `MESHPROXY_*` environment variables.

use crate::error::ConfigError;
use meshproxy_common::{WgPublicKey, PROXY_PORT};
use meshproxy_conn::device::DEFAULT_UAPI_DIR;
use meshproxy_conn::DEFAULT_STUN_SERVERS;
use meshproxy_engine::EngineConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, trace};

const ENV_PREFIX: &str = "MESHPROXY_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
	#[default]
	Pretty,
	Json,
}

impl FromStr for LogFormat {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s.trim().to_ascii_lowercase().as_str() {
			"pretty" => Ok(Self::Pretty),
			"json" => Ok(Self::Json),
			other => Err(ConfigError::InvalidValue {
				key: "log_format".to_string(),
				value: other.to_string(),
			}),
		}
	}
}

impl fmt::Display for LogFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Pretty => write!(f, "pretty"),
			Self::Json => write!(f, "json"),
		}
	}
}

/// Fully resolved daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyConfig {
	pub interface: String,
	pub public_key: WgPublicKey,
	pub listen_port: u16,
	pub stun_servers: Vec<String>,
	pub uapi_dir: PathBuf,
	pub metrics_interval: Duration,
	pub manage_ip_forwarding: bool,
	pub log_format: LogFormat,
}

impl ProxyConfig {
	pub fn engine_config(&self) -> EngineConfig {
		EngineConfig {
			metrics_interval: self.metrics_interval,
			manage_ip_forwarding: self.manage_ip_forwarding,
		}
	}
}

/// One partially specified configuration layer.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProxyConfigLayer {
	pub interface: Option<String>,
	pub public_key: Option<String>,
	pub listen_port: Option<u16>,
	pub stun_servers: Option<Vec<String>>,
	pub uapi_dir: Option<PathBuf>,
	pub metrics_interval_secs: Option<u64>,
	pub manage_ip_forwarding: Option<bool>,
	pub log_format: Option<LogFormat>,
}

impl ProxyConfigLayer {
	/// Values set in `other` win.
	pub fn merge(&mut self, other: ProxyConfigLayer) {
		self.interface = other.interface.or(self.interface.take());
		self.public_key = other.public_key.or(self.public_key.take());
		self.listen_port = other.listen_port.or(self.listen_port);
		self.stun_servers = other.stun_servers.or(self.stun_servers.take());
		self.uapi_dir = other.uapi_dir.or(self.uapi_dir.take());
		self.metrics_interval_secs = other.metrics_interval_secs.or(self.metrics_interval_secs);
		self.manage_ip_forwarding = other.manage_ip_forwarding.or(self.manage_ip_forwarding);
		self.log_format = other.log_format.or(self.log_format);
	}

	pub fn finalize(self) -> Result<ProxyConfig, ConfigError> {
		let interface = self.interface.unwrap_or_default();
		if interface.trim().is_empty() {
			return Err(ConfigError::Validation("interface must not be empty".to_string()));
		}

		let raw_key = self
			.public_key
			.ok_or_else(|| ConfigError::Validation("public_key is required".to_string()))?;
		let public_key =
			WgPublicKey::from_base64(raw_key.trim()).map_err(|_| ConfigError::InvalidValue {
				key: "public_key".to_string(),
				value: raw_key.clone(),
			})?;

		let listen_port = self.listen_port.unwrap_or(PROXY_PORT);
		if listen_port == 0 {
			return Err(ConfigError::Validation("listen_port must not be 0".to_string()));
		}

		let metrics_interval_secs = self.metrics_interval_secs.unwrap_or(15);
		if metrics_interval_secs == 0 {
			return Err(ConfigError::Validation(
				"metrics_interval_secs must be at least 1".to_string(),
			));
		}

		Ok(ProxyConfig {
			interface,
			public_key,
			listen_port,
			stun_servers: self.stun_servers.unwrap_or_default(),
			uapi_dir: self.uapi_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_UAPI_DIR)),
			metrics_interval: Duration::from_secs(metrics_interval_secs),
			manage_ip_forwarding: self.manage_ip_forwarding.unwrap_or(true),
			log_format: self.log_format.unwrap_or_default(),
		})
	}
}

/// Source precedence levels (higher = overrides lower).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
	Defaults = 10,
	ConfigFile = 20,
	Environment = 50,
}

pub trait ConfigSource: Send + Sync {
	fn name(&self) -> &'static str;
	fn precedence(&self) -> Precedence;
	fn load(&self) -> Result<ProxyConfigLayer, ConfigError>;
}

pub struct DefaultsSource;

impl ConfigSource for DefaultsSource {
	fn name(&self) -> &'static str {
		"defaults"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Defaults
	}

	fn load(&self) -> Result<ProxyConfigLayer, ConfigError> {
		Ok(ProxyConfigLayer {
			interface: Some("nm0".to_string()),
			public_key: None,
			listen_port: Some(PROXY_PORT),
			stun_servers: Some(DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()),
			uapi_dir: Some(PathBuf::from(DEFAULT_UAPI_DIR)),
			metrics_interval_secs: Some(15),
			manage_ip_forwarding: Some(true),
			log_format: Some(LogFormat::Pretty),
		})
	}
}

pub struct TomlSource {
	path: PathBuf,
}

impl TomlSource {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl ConfigSource for TomlSource {
	fn name(&self) -> &'static str {
		"toml-config"
	}

	fn precedence(&self) -> Precedence {
		Precedence::ConfigFile
	}

	fn load(&self) -> Result<ProxyConfigLayer, ConfigError> {
		if !self.path.exists() {
			debug!(path = %self.path.display(), "config file not found, skipping");
			return Ok(ProxyConfigLayer::default());
		}

		debug!(path = %self.path.display(), "loading config file");
		let content = std::fs::read_to_string(&self.path).map_err(|e| ConfigError::FileRead {
			path: self.path.clone(),
			source: e,
		})?;

		toml::from_str(&content).map_err(|e| ConfigError::TomlParse {
			path: self.path.clone(),
			source: e,
		})
	}
}

/// Environment variable source.
///
/// Convention: `MESHPROXY_<FIELD>`, lists comma separated.
pub struct EnvSource {
	vars: HashMap<String, String>,
}

impl EnvSource {
	pub fn from_process() -> Self {
		Self::from_vars(std::env::vars())
	}

	pub fn from_vars<I, K, V>(vars: I) -> Self
	where
		I: IntoIterator<Item = (K, V)>,
		K: Into<String>,
		V: Into<String>,
	{
		let vars = vars
			.into_iter()
			.map(|(k, v)| -> (String, String) { (k.into(), v.into()) })
			.filter(|(k, _)| k.starts_with(ENV_PREFIX))
			.collect();
		Self { vars }
	}

	fn get(&self, field: &str) -> Option<&str> {
		self
			.vars
			.get(&format!("{ENV_PREFIX}{field}"))
			.map(String::as_str)
			.filter(|v| !v.trim().is_empty())
	}

	fn parse<T: FromStr>(&self, field: &str) -> Result<Option<T>, ConfigError> {
		match self.get(field) {
			Some(raw) => raw
				.trim()
				.parse()
				.map(Some)
				.map_err(|_| ConfigError::InvalidValue {
					key: format!("{ENV_PREFIX}{field}"),
					value: raw.to_string(),
				}),
			None => Ok(None),
		}
	}

	fn parse_bool(&self, field: &str) -> Result<Option<bool>, ConfigError> {
		let Some(raw) = self.get(field) else {
			return Ok(None);
		};
		match raw.trim().to_ascii_lowercase().as_str() {
			"1" | "true" | "yes" | "on" => Ok(Some(true)),
			"0" | "false" | "no" | "off" => Ok(Some(false)),
			_ => Err(ConfigError::InvalidValue {
				key: format!("{ENV_PREFIX}{field}"),
				value: raw.to_string(),
			}),
		}
	}
}

impl ConfigSource for EnvSource {
	fn name(&self) -> &'static str {
		"environment"
	}

	fn precedence(&self) -> Precedence {
		Precedence::Environment
	}

	fn load(&self) -> Result<ProxyConfigLayer, ConfigError> {
		trace!(vars = self.vars.len(), "loading environment variables");
		Ok(ProxyConfigLayer {
			interface: self.get("INTERFACE").map(str::to_string),
			public_key: self.get("PUBLIC_KEY").map(str::to_string),
			listen_port: self.parse("LISTEN_PORT")?,
			stun_servers: self.get("STUN_SERVERS").map(|raw| {
				raw.split(',')
					.map(str::trim)
					.filter(|s| !s.is_empty())
					.map(str::to_string)
					.collect()
			}),
			uapi_dir: self.get("UAPI_DIR").map(PathBuf::from),
			metrics_interval_secs: self.parse("METRICS_INTERVAL_SECS")?,
			manage_ip_forwarding: self.parse_bool("MANAGE_IP_FORWARDING")?,
			log_format: self.parse("LOG_FORMAT")?,
		})
	}
}

/// Merges the given sources in precedence order and validates the result.
pub fn load_from_sources(mut sources: Vec<Box<dyn ConfigSource>>) -> Result<ProxyConfig, ConfigError> {
	sources.sort_by_key(|s| s.precedence());

	let mut merged = ProxyConfigLayer::default();
	for source in &sources {
		debug!(source = source.name(), "applying config source");
		merged.merge(source.load()?);
	}
	merged.finalize()
}

/// Defaults, then `config_file` if given, then the process environment.
pub fn load_config(config_file: Option<&Path>) -> Result<ProxyConfig, ConfigError> {
	let mut sources: Vec<Box<dyn ConfigSource>> = vec![Box::new(DefaultsSource)];
	if let Some(path) = config_file {
		sources.push(Box::new(TomlSource::new(path)));
	}
	sources.push(Box::new(EnvSource::from_process()));
	load_from_sources(sources)
}
