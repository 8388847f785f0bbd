// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Outbound connections to configured destinations

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use percent_encoding::percent_decode_str;
use serde::Serialize;
use tokio_tungstenite::tungstenite::{self, http::Uri};

use crate::common::{Close, Endpoint, RemoteAddr};
use crate::network::{Network, NetworkError, NetworkKind};
use crate::portal::PortalError;
use crate::util::{Context, ContextError};

pub mod basic;
pub mod race;
pub mod websocket;

pub use basic::BasicDialer;
pub use race::ConnectRace;
pub use websocket::WebSocketDialer;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(thiserror::Error, Debug)]
pub enum DialError {
  #[error("dialer already closed")]
  Closed,
  #[error("context canceled")]
  Canceled,
  #[error("context deadline exceeded")]
  DeadlineExceeded,
  #[error(transparent)]
  Io(#[from] std::io::Error),
  #[error("tls handshake: {0}")]
  Tls(#[source] std::io::Error),
  #[error("websocket handshake: {0}")]
  WebSocket(#[source] Box<tungstenite::Error>),
  #[error(transparent)]
  Portal(#[from] PortalError),
  #[error(transparent)]
  Network(#[from] NetworkError),
  #[error("tag must not be empty")]
  EmptyTag,
  #[error("url invalid: {0:?}")]
  InvalidUrl(String),
  #[error("url scheme not supported: {0:?}")]
  UnsupportedScheme(String),
  #[error("invalid header {0:?}")]
  InvalidHeader(String),
}

impl DialError {
  /// The dialer, or something owning it, was shut down
  pub fn is_shutdown(&self) -> bool {
    matches!(self, DialError::Closed)
  }

  /// The caller's context ended before a connection was produced
  pub fn is_cancellation(&self) -> bool {
    matches!(self, DialError::Canceled | DialError::DeadlineExceeded)
  }
}

impl From<ContextError> for DialError {
  fn from(error: ContextError) -> Self {
    match error {
      ContextError::Canceled => DialError::Canceled,
      ContextError::DeadlineExceeded => DialError::DeadlineExceeded,
    }
  }
}

impl From<tungstenite::Error> for DialError {
  fn from(error: tungstenite::Error) -> Self {
    DialError::WebSocket(Box::new(error))
  }
}

/// A connected outbound endpoint and where it leads
pub struct Conn {
  pub remote: RemoteAddr,
  pub endpoint: Endpoint,
}

impl std::fmt::Debug for Conn {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Conn")
      .field("remote", &self.remote)
      .field("endpoint", &self.endpoint)
      .finish()
  }
}

impl Close for Conn {
  fn close(self) -> BoxFuture<'static, ()> {
    self.endpoint.close()
  }
}

pub trait Dialer: Send + Sync {
  fn tag(&self) -> &str;

  fn connect<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Conn, DialError>>;

  /// Fails in-flight connects and releases pending registrations; a second close reports [DialError::Closed]
  fn close(&self) -> Result<(), DialError>;

  fn info(&self) -> DialerInfo;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DialerInfo {
  pub tag: String,
  pub url: String,
  pub network: String,
  pub addr: String,
  pub secure: bool,
  /// Whether connections are message-framed
  pub message: bool,
  pub timeout: String,
  pub retry: usize,
  pub closed: bool,
  /// Whether a deferred address has been registered yet
  pub ready: bool,
}

/// Everything needed to build a [Dialer]
#[derive(Debug, Clone, Default)]
pub struct DialerOptions {
  pub tag: String,
  /// `basic://`, `basic+tls://`, `ws://` or `wss://`
  pub url: String,
  /// Overrides the network implied by the url
  pub network: Option<String>,
  /// Overrides the address implied by the url
  pub addr: Option<String>,
  /// Zero leaves connects bounded only by the caller
  pub timeout: Duration,
  pub retry: usize,
  pub allow_insecure: bool,
  /// Extra request headers for WebSocket dialers
  pub headers: Vec<(String, String)>,
  /// Sent as a bearer token by WebSocket dialers
  pub access: Option<String>,
}

pub fn new_dialer(network: &Network, options: &DialerOptions) -> Result<Arc<dyn Dialer>, DialError> {
  if options.tag.is_empty() {
    return Err(DialError::EmptyTag);
  }
  let uri: Uri = options
    .url
    .parse()
    .map_err(|_| DialError::InvalidUrl(options.url.clone()))?;
  let dialer: Arc<dyn Dialer> = match uri.scheme_str() {
    Some("basic") => Arc::new(BasicDialer::new(network, options, &uri, false)?),
    Some("basic+tls") => Arc::new(BasicDialer::new(network, options, &uri, true)?),
    Some("ws") => Arc::new(WebSocketDialer::new(network, options, &uri, false)?),
    Some("wss") => Arc::new(WebSocketDialer::new(network, options, &uri, true)?),
    _ => return Err(DialError::UnsupportedScheme(options.url.clone())),
  };
  Ok(dialer)
}

/// Looks up `name` in the url's query string, percent-decoded
pub(crate) fn query_param(uri: &Uri, name: &str) -> Option<String> {
  uri
    .query()?
    .split('&')
    .filter_map(|pair| pair.split_once('='))
    .find(|(key, _)| *key == name)
    .map(|(_, value)| percent_decode_str(value).decode_utf8_lossy().into_owned())
    .filter(|value| !value.is_empty())
}

pub(crate) fn parse_network(name: &str) -> Result<NetworkKind, DialError> {
  Ok(name.parse::<NetworkKind>()?)
}

pub(crate) fn format_timeout(timeout: Option<Duration>) -> String {
  match timeout {
    Some(timeout) => humantime::format_duration(timeout).to_string(),
    None => "0s".to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::{new_dialer, query_param, DialError, DialerOptions};
  use crate::network::Network;
  use tokio_tungstenite::tungstenite::http::Uri;

  #[test]
  fn query_lookup() {
    let uri: Uri = "basic://svc?network=pipe&addr=inner&empty=".parse().unwrap();
    assert_eq!(query_param(&uri, "network").as_deref(), Some("pipe"));
    assert_eq!(query_param(&uri, "addr").as_deref(), Some("inner"));
    assert_eq!(query_param(&uri, "empty"), None);
    assert_eq!(query_param(&uri, "missing"), None);
  }

  #[test]
  fn query_values_are_percent_decoded() {
    let uri: Uri = "basic://svc?network=unix&addr=%2Frun%2Fstreamf%20a.sock&bad=%zz"
      .parse()
      .unwrap();
    assert_eq!(query_param(&uri, "addr").as_deref(), Some("/run/streamf a.sock"));
    assert_eq!(query_param(&uri, "bad").as_deref(), Some("%zz"));
  }

  #[tokio::test]
  async fn construction_errors() {
    let network = Network::new();
    let options = |tag: &str, url: &str| DialerOptions {
      tag: tag.into(),
      url: url.into(),
      ..Default::default()
    };
    assert!(matches!(
      new_dialer(&network, &options("", "basic://127.0.0.1:1")),
      Err(DialError::EmptyTag)
    ));
    assert!(matches!(
      new_dialer(&network, &options("x", "socks5://127.0.0.1:1")),
      Err(DialError::UnsupportedScheme(_))
    ));
    assert!(matches!(
      new_dialer(&network, &options("x", "basic://127.0.0.1:1?network=udp")),
      Err(DialError::Network(_))
    ));
    let dialer = new_dialer(&network, &options("x", "ws://example.com/tunnel")).unwrap();
    assert_eq!(dialer.tag(), "x");
    assert_eq!(dialer.info().addr, "example.com:80");
  }
}
