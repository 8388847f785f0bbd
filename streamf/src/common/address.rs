// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use serde::Serialize;

/// Describes where an outbound connection went, for logs and status output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteAddr {
  /// Tag of the dialer that produced the connection
  pub dialer: String,
  pub network: String,
  pub addr: String,
  pub secure: bool,
  pub url: String,
}

impl std::fmt::Display for RemoteAddr {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let scheme = if self.secure {
      format!("{}+tls", self.network)
    } else {
      self.network.clone()
    };
    write!(f, "{} {}://{}", self.dialer, scheme, self.addr)
  }
}
