// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Resolves logical addresses to live transports
//!
//! Stream sockets (`tcp`, `unix`) are dialed directly. `pipe` and `portal`
//! addresses exist only inside the process: a listener registers them with the
//! network's registry task, and dialers built for them wait until that happens.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

pub mod dialer;
pub mod listener;
pub mod pipe;
pub mod registry;
pub mod tls;

pub use dialer::RawDialer;
pub use listener::{Incoming, NetListener};
pub use pipe::PipeListener;
pub use registry::{DialSource, RegistrySnapshot, Source};
pub use tls::TlsClient;

use crate::portal::{PortalDialer, PortalOptions};
use crate::util::dropkick::Dropkick;
use listener::Socket;
use registry::{Command, Registry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
  Tcp,
  Unix,
  Pipe,
  Portal,
}

impl NetworkKind {
  /// Whether addresses on this network only exist once something registers them
  pub fn is_deferred(self) -> bool {
    matches!(self, NetworkKind::Pipe | NetworkKind::Portal)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      NetworkKind::Tcp => "tcp",
      NetworkKind::Unix => "unix",
      NetworkKind::Pipe => "pipe",
      NetworkKind::Portal => "portal",
    }
  }
}

impl std::fmt::Display for NetworkKind {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for NetworkKind {
  type Err = NetworkError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "tcp" | "tcp4" | "tcp6" => Ok(NetworkKind::Tcp),
      #[cfg(unix)]
      "unix" => Ok(NetworkKind::Unix),
      "pipe" => Ok(NetworkKind::Pipe),
      "portal" => Ok(NetworkKind::Portal),
      other => Err(NetworkError::UnsupportedNetwork(other.to_string())),
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum NetworkError {
  #[error("unsupported network {0:?}")]
  UnsupportedNetwork(String),
  #[error("address {0}:{1} already in use")]
  AddressInUse(NetworkKind, String),
  #[error("network already closed")]
  Closed,
  #[error("tls listener requires a server certificate")]
  MissingCertificate,
  #[error("no usable certificate or key in {0}")]
  InvalidCertificate(String),
  #[error("invalid tls server name {0:?}")]
  InvalidServerName(String),
  #[error("tls configuration: {0}")]
  Tls(#[from] rustls::Error),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

/// Keeps an address registered; dropping it releases the address
pub struct Registration {
  kind: NetworkKind,
  address: String,
  fulfilled: Vec<u64>,
  _release: Dropkick<(Command, mpsc::UnboundedSender<Command>)>,
}

impl Registration {
  pub fn kind(&self) -> NetworkKind {
    self.kind
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  /// Ids of the pending dialers this registration fulfilled, in the order they were fulfilled
  pub fn fulfilled(&self) -> &[u64] {
    &self.fulfilled
  }
}

impl std::fmt::Debug for Registration {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Registration")
      .field("kind", &self.kind)
      .field("address", &self.address)
      .field("fulfilled", &self.fulfilled)
      .finish()
  }
}

impl Default for Network {
  fn default() -> Self {
    Self::new()
  }
}

/// Handle to the addressing fabric; clones share the same registry
///
/// Must be created inside a Tokio runtime, which hosts the registry task.
#[derive(Clone)]
pub struct Network {
  commands: mpsc::UnboundedSender<Command>,
  shutdown: CancellationToken,
  next_id: Arc<AtomicU64>,
}

impl Network {
  pub fn new() -> Self {
    let (commands, receiver) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    tokio::spawn(
      Registry::default()
        .run(receiver, shutdown.clone())
        .instrument(tracing::debug_span!("network_registry")),
    );
    Self {
      commands,
      shutdown,
      next_id: Arc::new(AtomicU64::new(1)),
    }
  }

  pub fn is_closed(&self) -> bool {
    self.shutdown.is_cancelled()
  }

  /// Stops the registry; dialers still waiting for a registration fail as closed
  pub fn close(&self) {
    self.shutdown.cancel();
  }

  fn send(&self, command: Command) -> Result<(), NetworkError> {
    if self.is_closed() {
      return Err(NetworkError::Closed);
    }
    self.commands.send(command).map_err(|_| NetworkError::Closed)
  }

  /// Binds a deferred address to `source`, fulfilling every dialer already waiting on it
  pub async fn register(
    &self,
    kind: NetworkKind,
    address: &str,
    source: Source,
  ) -> Result<Registration, NetworkError> {
    if !kind.is_deferred() {
      return Err(NetworkError::UnsupportedNetwork(kind.to_string()));
    }
    let key = (kind, address.to_string());
    let (reply, result) = oneshot::channel();
    self.send(Command::Register {
      key: key.clone(),
      source,
      reply,
    })?;
    let fulfilled = result.await.map_err(|_| NetworkError::Closed)??;
    Ok(Registration {
      kind,
      address: address.to_string(),
      fulfilled,
      _release: Dropkick::new((Command::Unregister { key }, self.commands.clone())),
    })
  }

  /// Builds a dialer for `address`; pipe and portal dialers enqueue a pending request
  pub fn dialer(
    &self,
    kind: NetworkKind,
    address: &str,
    tls: Option<TlsClient>,
  ) -> Result<RawDialer, NetworkError> {
    if !kind.is_deferred() {
      return Ok(RawDialer::direct(kind, address, tls));
    }
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (slot, ready) = oneshot::channel();
    self.send(Command::Pend {
      id,
      key: (kind, address.to_string()),
      slot,
    })?;
    tracing::trace!(id, network = %kind, address, "pending dial request");
    Ok(RawDialer::deferred(
      kind,
      address,
      tls,
      id,
      ready,
      self.commands.clone(),
    ))
  }

  pub async fn listen(&self, kind: NetworkKind, address: &str) -> Result<NetListener, NetworkError> {
    let socket = match kind {
      NetworkKind::Tcp => Socket::Tcp(TcpListener::bind(address).await?),
      #[cfg(unix)]
      NetworkKind::Unix => Socket::Unix(tokio::net::UnixListener::bind(address)?),
      NetworkKind::Pipe => {
        let (connector, incoming) = PipeListener::channel();
        let registration = self
          .register(NetworkKind::Pipe, address, Arc::new(connector))
          .await?;
        Socket::Pipe(PipeListener::new(address.to_string(), incoming, registration))
      }
      other => return Err(NetworkError::UnsupportedNetwork(other.to_string())),
    };
    Ok(NetListener::new(socket, kind, address.to_string()))
  }

  pub async fn listen_tls(
    &self,
    kind: NetworkKind,
    address: &str,
    config: Option<Arc<rustls::ServerConfig>>,
  ) -> Result<NetListener, NetworkError> {
    let config = config.ok_or(NetworkError::MissingCertificate)?;
    let listener = self.listen(kind, address).await?;
    Ok(listener.with_tls(tls::acceptor(config)))
  }

  /// Creates a portal served from `listener` and registers it as `portal:<tag>`
  pub async fn new_portal(
    &self,
    tag: &str,
    listener: NetListener,
    options: PortalOptions,
  ) -> Result<(Arc<PortalDialer>, Registration), NetworkError> {
    let portal = Arc::new(PortalDialer::new(tag, listener, options));
    let registration = self
      .register(NetworkKind::Portal, tag, portal.clone())
      .await?;
    Ok((portal, registration))
  }

  pub async fn snapshot(&self) -> Result<RegistrySnapshot, NetworkError> {
    let (reply, result) = oneshot::channel();
    self.send(Command::Snapshot { reply })?;
    result.await.map_err(|_| NetworkError::Closed)
  }
}

#[cfg(test)]
mod tests {
  use super::{tls, Network, NetworkError, NetworkKind, TlsClient};
  use crate::common::WrappedStream;
  use crate::dialer::DialError;
  use crate::util::Context;
  use futures::future::join_all;
  use std::sync::Arc;
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[test]
  fn unsupported_networks_are_rejected() {
    assert_eq!("pipe".parse::<NetworkKind>().unwrap(), NetworkKind::Pipe);
    assert_eq!("tcp6".parse::<NetworkKind>().unwrap(), NetworkKind::Tcp);
    assert!(matches!(
      "udp".parse::<NetworkKind>(),
      Err(NetworkError::UnsupportedNetwork(name)) if name == "udp"
    ));
  }

  #[tokio::test]
  async fn pending_dialers_are_fulfilled_in_order_with_distinct_transports() {
    let network = Network::new();
    let dialers: Vec<_> = (0..3)
      .map(|_| Arc::new(network.dialer(NetworkKind::Pipe, "svc", None).unwrap()))
      .collect();
    assert!(dialers.iter().all(|d| !d.is_ready()));

    let dials = join_all(dialers.iter().enumerate().map(|(index, dialer)| {
      let dialer = dialer.clone();
      tokio::spawn(async move {
        let mut stream = dialer.dial(&Context::background()).await.unwrap();
        stream.write_all(&[index as u8]).await.unwrap();
        stream
      })
    }));

    let mut listener = network.listen(NetworkKind::Pipe, "svc").await.unwrap();
    let pending_ids: Vec<_> = dialers.iter().filter_map(|d| d.pending_id()).collect();
    let snapshot = network.snapshot().await.unwrap();
    assert_eq!(snapshot.registered, vec!["pipe:svc".to_string()]);
    assert!(snapshot.pending.is_empty());
    assert_eq!(pending_ids.len(), 3);

    let _streams = dials.await;
    let mut seen = Vec::new();
    for _ in 0..3 {
      let incoming = listener.accept().await.unwrap();
      let mut stream = incoming.establish(&Context::background()).await.unwrap();
      let mut tag = [0u8; 1];
      stream.read_exact(&mut tag).await.unwrap();
      seen.push(tag[0]);
    }
    seen.sort();
    assert_eq!(seen, vec![0, 1, 2]);
  }

  #[tokio::test]
  async fn fulfilment_follows_request_order() {
    let network = Network::new();
    let first = network.dialer(NetworkKind::Portal, "edge", None).unwrap();
    let second = network.dialer(NetworkKind::Portal, "edge", None).unwrap();
    let (connector, _incoming) = super::PipeListener::channel();
    let registration = network
      .register(NetworkKind::Portal, "edge", Arc::new(connector))
      .await
      .unwrap();
    assert_eq!(
      registration.fulfilled(),
      &[first.pending_id().unwrap(), second.pending_id().unwrap()]
    );
  }

  #[tokio::test]
  async fn duplicate_listen_is_rejected() {
    let network = Network::new();
    let dialer = network.dialer(NetworkKind::Pipe, "svc", None).unwrap();
    let _first = network.listen(NetworkKind::Pipe, "svc").await.unwrap();
    match network.listen(NetworkKind::Pipe, "svc").await {
      Err(NetworkError::AddressInUse(NetworkKind::Pipe, address)) => assert_eq!(address, "svc"),
      Err(other) => panic!("expected AddressInUse, got {}", other),
      Ok(_) => panic!("second registration must fail"),
    }
    assert!(dialer.dial(&Context::background()).await.is_ok());
  }

  #[tokio::test]
  async fn closed_dialers_leave_the_pending_list() {
    let network = Network::new();
    let kept = network.dialer(NetworkKind::Pipe, "svc", None).unwrap();
    let closed = network.dialer(NetworkKind::Pipe, "svc", None).unwrap();
    let dropped = network.dialer(NetworkKind::Pipe, "svc", None).unwrap();
    closed.close();
    drop(dropped);
    assert_eq!(
      network.snapshot().await.unwrap().pending,
      vec![kept.pending_id().unwrap()]
    );
    assert!(matches!(
      closed.dial(&Context::background()).await,
      Err(DialError::Closed)
    ));
  }

  #[tokio::test(start_paused = true)]
  async fn waiting_dial_honours_context() {
    let network = Network::new();
    let dialer = network.dialer(NetworkKind::Pipe, "nobody", None).unwrap();
    let ctx = Context::background().with_timeout(Duration::from_millis(50));
    assert!(matches!(
      dialer.dial(&ctx).await,
      Err(DialError::DeadlineExceeded)
    ));
  }

  #[tokio::test]
  async fn closing_the_network_fails_waiting_dials() {
    let network = Network::new();
    let dialer = network.dialer(NetworkKind::Pipe, "svc", None).unwrap();
    network.close();
    assert!(matches!(
      dialer.dial(&Context::background()).await,
      Err(DialError::Closed)
    ));
    assert!(matches!(
      network.dialer(NetworkKind::Pipe, "svc", None),
      Err(NetworkError::Closed)
    ));
  }

  #[tokio::test]
  async fn tls_listeners_need_a_certificate() {
    let network = Network::new();
    assert!(matches!(
      network.listen_tls(NetworkKind::Tcp, "127.0.0.1:0", None).await,
      Err(NetworkError::MissingCertificate)
    ));
  }

  const CERT: &str = include_str!("testdata/localhost.pem");
  const KEY: &str = include_str!("testdata/localhost.key");

  fn insecure_client() -> TlsClient {
    TlsClient::new("localhost", true, &["http/1.1".to_string()]).unwrap()
  }

  #[tokio::test]
  async fn tls_round_trip_over_sockets_and_pipes() {
    let network = Network::new();
    let config = tls::parse_server_config(CERT, KEY, &["http/1.1".to_string()]).unwrap();
    for (kind, address) in [(NetworkKind::Tcp, "127.0.0.1:0"), (NetworkKind::Pipe, "secure")] {
      let mut listener = network
        .listen_tls(kind, address, Some(config.clone()))
        .await
        .unwrap();
      assert!(listener.is_secure());
      let dialer = network
        .dialer(kind, &listener.local_addr(), Some(insecure_client()))
        .unwrap();

      let server = tokio::spawn(async move {
        let incoming = listener.accept().await.unwrap();
        let mut stream = incoming.establish(&Context::background()).await.unwrap();
        assert!(matches!(stream, WrappedStream::TlsServer(_)));
        let mut request = [0u8; 5];
        stream.read_exact(&mut request).await.unwrap();
        stream.write_all(&request).await.unwrap();
        stream.shutdown().await.unwrap();
      });

      let mut stream = dialer.dial(&Context::background()).await.unwrap();
      assert!(matches!(stream, WrappedStream::TlsClient(_)));
      stream.write_all(b"hello").await.unwrap();
      let mut echoed = Vec::new();
      stream.read_to_end(&mut echoed).await.unwrap();
      assert_eq!(echoed, b"hello");
      server.await.unwrap();
    }
  }

  #[tokio::test]
  async fn failed_client_handshake_closes_the_transport() {
    let network = Network::new();
    let mut listener = network.listen(NetworkKind::Pipe, "plain").await.unwrap();
    let dialer = network
      .dialer(NetworkKind::Pipe, "plain", Some(insecure_client()))
      .unwrap();

    let server = tokio::spawn(async move {
      let incoming = listener.accept().await.unwrap();
      let mut stream = incoming.establish(&Context::background()).await.unwrap();
      let mut record = [0u8; 5];
      stream.read_exact(&mut record).await.unwrap();
      // 0x16 opens a handshake record
      assert_eq!(record[0], 0x16);
      stream.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await.unwrap();
      let mut rest = Vec::new();
      let _ = stream.read_to_end(&mut rest).await;
    });

    assert!(matches!(
      dialer.dial(&Context::background()).await,
      Err(DialError::Tls(_))
    ));
    // The server only finishes once the client side of the pipe is gone
    tokio::time::timeout(Duration::from_secs(5), server)
      .await
      .expect("raw transport must be closed after a failed handshake")
      .unwrap();
  }
}
