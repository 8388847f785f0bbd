// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! JSON configuration
//!
//! Durations are strings such as `"500ms"` or `"1m 30s"`. Empty durations take
//! the documented default; unparseable ones log a warning and take it too.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::AgentOptions;
use crate::bridge::DEFAULT_CLOSE_GRACE;
use crate::dialer::{DialerOptions, DEFAULT_TIMEOUT};
use crate::network::{tls, NetworkError};
use crate::pool::DEFAULT_CACHE;
use crate::portal::{PortalOptions, DEFAULT_HEART, DEFAULT_HEART_TIMEOUT};

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("failed to read {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("invalid configuration: {0}")]
  Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Config {
  pub logger: LoggerConfig,
  pub pool: PoolConfig,
  pub dialer: Vec<DialerConfig>,
  pub listener: Vec<ListenerConfig>,
  pub bridge: Vec<BridgeConfig>,
}

impl Config {
  pub fn from_json(json: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(json)?)
  }

  pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&json)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoggerConfig {
  /// `debug`, `info`, `warn` or `error`; anything else means `info`
  pub level: String,
  /// Include source locations in log lines
  pub source: bool,
}

impl LoggerConfig {
  /// The level as a tracing filter directive
  pub fn directive(&self) -> &'static str {
    match self.level.to_ascii_lowercase().as_str() {
      "debug" => "debug",
      "warn" => "warn",
      "error" => "error",
      _ => "info",
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PoolConfig {
  /// Buffer length; below 4KiB means 32KiB
  pub size: usize,
  /// Buffers kept for reuse; absent means [DEFAULT_CACHE], `0` turns reuse off
  pub cache: usize,
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self {
      size: 0,
      cache: DEFAULT_CACHE,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DialerConfig {
  pub tag: String,
  pub url: String,
  /// Defaults to 500ms; `"0s"` leaves connects bounded only by the caller
  pub timeout: String,
  pub network: String,
  pub addr: String,
  pub allow_insecure: bool,
  pub retry: usize,
  pub header: BTreeMap<String, Vec<String>>,
  pub access: String,
}

impl DialerConfig {
  pub fn options(&self) -> DialerOptions {
    DialerOptions {
      tag: self.tag.clone(),
      url: self.url.clone(),
      network: non_empty(&self.network),
      addr: non_empty(&self.addr),
      timeout: parse_duration("timeout", &self.timeout, DEFAULT_TIMEOUT),
      retry: self.retry,
      allow_insecure: self.allow_insecure,
      headers: self
        .header
        .iter()
        .flat_map(|(name, values)| values.iter().map(move |value| (name.clone(), value.clone())))
        .collect(),
      access: non_empty(&self.access),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListenerConfig {
  pub tag: String,
  /// `basic`, `websocket` or `portal`
  pub mode: String,
  pub network: String,
  pub addr: String,
  pub tls: TlsConfig,
  pub dialer: ConnectDialer,
  pub portal: PortalConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TlsConfig {
  pub cert_file: String,
  pub key_file: String,
  /// Inline PEM, preferred over the files
  pub cert: String,
  pub key: String,
  pub alpn: Vec<String>,
}

impl TlsConfig {
  pub fn is_secure(&self) -> bool {
    (!self.cert.is_empty() && !self.key.is_empty())
      || (!self.cert_file.is_empty() && !self.key_file.is_empty())
  }

  /// The server configuration, or `None` when no certificate is configured
  pub fn server_config(&self) -> Result<Option<Arc<rustls::ServerConfig>>, NetworkError> {
    let alpn: Vec<String> = if self.alpn.is_empty() {
      tls::DEFAULT_ALPN.iter().map(|p| p.to_string()).collect()
    } else {
      self.alpn.clone()
    };
    if !self.cert.is_empty() && !self.key.is_empty() {
      tls::parse_server_config(&self.cert, &self.key, &alpn).map(Some)
    } else if !self.cert_file.is_empty() && !self.key_file.is_empty() {
      tls::load_server_config(&self.cert_file, &self.key_file, &alpn).map(Some)
    } else {
      Ok(None)
    }
  }
}

/// Which dialer a listener or bridge forwards to
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectDialer {
  pub tag: String,
  /// Close grace once one direction of a bridge ends; defaults to 1s
  pub close: String,
}

impl ConnectDialer {
  pub fn close_grace(&self) -> Duration {
    parse_duration("close", &self.close, DEFAULT_CLOSE_GRACE)
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PortalConfig {
  /// Registered portal address; defaults to the listener tag
  pub tag: String,
  pub timeout: String,
  pub heart: String,
  pub heart_timeout: String,
}

impl PortalConfig {
  pub fn options(&self) -> PortalOptions {
    PortalOptions {
      timeout: parse_duration("timeout", &self.timeout, crate::portal::DEFAULT_TIMEOUT),
      heart: parse_duration("heart", &self.heart, DEFAULT_HEART),
      heart_timeout: parse_duration("heartTimeout", &self.heart_timeout, DEFAULT_HEART_TIMEOUT),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BridgeConfig {
  pub tag: String,
  pub url: String,
  pub network: String,
  pub addr: String,
  pub allow_insecure: bool,
  pub dialer: ConnectDialer,
}

impl BridgeConfig {
  pub fn options(&self) -> AgentOptions {
    AgentOptions {
      tag: non_empty(&self.tag),
      url: self.url.clone(),
      network: non_empty(&self.network),
      addr: non_empty(&self.addr),
      allow_insecure: self.allow_insecure,
    }
  }
}

fn non_empty(value: &str) -> Option<String> {
  (!value.is_empty()).then(|| value.to_string())
}

/// Parses `value`, falling back to `default` when it is empty or invalid
pub fn parse_duration(field: &str, value: &str, default: Duration) -> Duration {
  if value.is_empty() {
    return default;
  }
  match humantime::parse_duration(value) {
    Ok(duration) => duration,
    Err(error) => {
      tracing::warn!(
        field,
        value,
        %error,
        default = %humantime::format_duration(default),
        "unparseable duration, using default"
      );
      default
    }
  }
}
