// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Inbound connections, each forwarded to a configured dialer

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::bridge::{bridging_until, BridgeReport};
use crate::common::{Close, Endpoint};
use crate::dialer::{format_timeout, DialError, Dialer};
use crate::network::{Incoming, NetListener, NetworkError};
use crate::pool::BufferPool;
use crate::portal::{PortalError, PortalInfo};
use crate::util::{Backoff, Context};

pub mod basic;
pub mod portal;
pub mod websocket;

pub use basic::BasicListener;
pub use portal::PortalListener;
pub use websocket::WebSocketListener;

/// Upper bound on the TLS or WebSocket handshake of an accepted connection
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum ListenerError {
  #[error("listener already closed")]
  Closed,
  #[error("listener is already being served")]
  AlreadyServing,
  #[error(transparent)]
  Network(#[from] NetworkError),
  #[error(transparent)]
  Portal(#[from] PortalError),
  #[error(transparent)]
  Dial(#[from] DialError),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub trait Listener: Send + Sync {
  fn tag(&self) -> &str;

  /// Accepts until closed; resolves once the accept loop and its sessions are done
  fn serve(self: Arc<Self>) -> BoxFuture<'static, Result<(), ListenerError>>;

  /// Stops accepting and ends live sessions; a second close reports [ListenerError::Closed]
  fn close(&self) -> Result<(), ListenerError>;

  fn info(&self) -> ListenerInfo;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ListenerInfo {
  pub tag: String,
  pub mode: String,
  pub network: String,
  pub addr: String,
  pub secure: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub dialer: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub close: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub portal: Option<PortalInfo>,
  pub closed: bool,
}

/// `"<mode> <network>[+tls]://<bound address>"`, used when a listener has no configured tag
pub fn default_tag(mode: &str, listener: &NetListener) -> String {
  format!("{} {}", mode, listener.scheme_address())
}

/// Where accepted connections go: a dialer, and how to bridge to what it returns
#[derive(Clone)]
pub struct Forwarder {
  dialer: Arc<dyn Dialer>,
  pool: Arc<BufferPool>,
  close_grace: Duration,
}

impl Forwarder {
  pub fn new(dialer: Arc<dyn Dialer>, pool: Arc<BufferPool>, close_grace: Duration) -> Self {
    Self {
      dialer,
      pool,
      close_grace,
    }
  }

  pub fn dialer(&self) -> &Arc<dyn Dialer> {
    &self.dialer
  }

  pub fn close_grace(&self) -> Duration {
    self.close_grace
  }

  /// Connects the dialer and bridges `inbound` to it until either side ends or `ctx` is done
  ///
  /// `inbound` is closed when the dialer fails, and `None` is returned. A bridge
  /// stopped by `ctx` still closes both of its endpoints.
  pub async fn forward(&self, inbound: Endpoint, ctx: &Context) -> Option<BridgeReport> {
    let conn = match self.dialer.connect(ctx).await {
      Ok(conn) => conn,
      Err(error) => {
        tracing::warn!(dialer = self.dialer.tag(), %error, "connect failed");
        inbound.close().await;
        return None;
      }
    };
    tracing::debug!(remote = %conn.remote, "bridging");
    let report = bridging_until(inbound, conn.endpoint, &self.pool, self.close_grace, ctx).await;
    tracing::debug!(?report, "bridge finished");
    Some(report)
  }
}

/// Accept-side state shared by stream-accepting listeners
pub(crate) struct Acceptor {
  socket: Mutex<Option<NetListener>>,
  shutdown: CancellationToken,
  closed: AtomicBool,
  network: String,
  addr: String,
  secure: bool,
}

impl Acceptor {
  pub(crate) fn new(listener: NetListener) -> Self {
    Self {
      network: listener.kind().to_string(),
      addr: listener.local_addr(),
      secure: listener.is_secure(),
      socket: Mutex::new(Some(listener)),
      shutdown: CancellationToken::new(),
      closed: AtomicBool::new(false),
    }
  }

  pub(crate) fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// A context ended by [Acceptor::close], for one session
  pub(crate) fn context(&self) -> Context {
    Context::from(self.shutdown.child_token())
  }

  /// The accepted connections, until closed
  pub(crate) fn incoming(
    &self,
  ) -> Result<impl Stream<Item = Incoming> + Send + 'static, ListenerError> {
    if self.is_closed() {
      return Err(ListenerError::Closed);
    }
    let listener = self
      .socket
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take()
      .ok_or(ListenerError::AlreadyServing)?;
    let shutdown = self.shutdown.clone();
    Ok(accept_stream(listener).take_until(async move { shutdown.cancelled().await }))
  }

  /// Runs `session` on every accepted connection until closed, then waits for live sessions
  ///
  /// Each session gets its own context, ended by [Acceptor::close].
  pub(crate) async fn serve<F, Fut>(&self, mut session: F) -> Result<(), ListenerError>
  where
    F: FnMut(Incoming, Context) -> Fut,
    Fut: Future<Output = ()>,
  {
    let incoming = self.incoming()?;
    tracing::info!("serving");
    incoming
      .for_each_concurrent(None, |incoming| {
        let peer = incoming.peer().to_string();
        session(incoming, self.context()).instrument(tracing::debug_span!("session", %peer))
      })
      .await;
    tracing::info!("stopped");
    Ok(())
  }

  pub(crate) fn close(&self) -> Result<(), ListenerError> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Err(ListenerError::Closed);
    }
    self.shutdown.cancel();
    drop(
      self
        .socket
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take(),
    );
    Ok(())
  }

  pub(crate) fn info(&self, tag: &str, mode: &str, forwarder: &Forwarder) -> ListenerInfo {
    ListenerInfo {
      tag: tag.to_string(),
      mode: mode.to_string(),
      network: self.network.clone(),
      addr: self.addr.clone(),
      secure: self.secure,
      dialer: Some(forwarder.dialer().tag().to_string()),
      close: Some(format_timeout(Some(forwarder.close_grace()))),
      portal: None,
      closed: self.is_closed(),
    }
  }
}

/// Accepts forever; failed accepts back off from 5ms up to 1s
fn accept_stream(listener: NetListener) -> impl Stream<Item = Incoming> + Send + 'static {
  futures::stream::unfold(
    (listener, Backoff::default()),
    |(mut listener, mut backoff)| async move {
      loop {
        match listener.accept().await {
          Ok(incoming) => {
            backoff.reset();
            return Some((incoming, (listener, backoff)));
          }
          Err(error) => {
            let delay = backoff.next_delay();
            tracing::warn!(%error, ?delay, "accept failed");
            tokio::time::sleep(delay).await;
          }
        }
      }
    },
  )
}
