// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Mutex;

use futures::future::{FutureExt, Shared};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use super::registry::{Command, Source};
use super::tls::TlsClient;
use super::NetworkKind;
use crate::common::WrappedStream;
use crate::dialer::DialError;
use crate::util::dropkick::Dropkick;
use crate::util::Context;

type ForgetGuard = Dropkick<(Command, mpsc::UnboundedSender<Command>)>;

enum Target {
  Tcp(String),
  #[cfg(unix)]
  Unix(std::path::PathBuf),
  Deferred {
    id: u64,
    ready: Shared<oneshot::Receiver<Source>>,
    forget: Mutex<Option<ForgetGuard>>,
  },
}

/// Produces raw transports to one address on one network
///
/// Pipe and portal dialers may be built before their address is registered;
/// they wait for the registration on each dial, racing the caller's context.
/// Dropping or closing a waiting dialer withdraws its pending request.
pub struct RawDialer {
  kind: NetworkKind,
  address: String,
  target: Target,
  tls: Option<TlsClient>,
}

impl std::fmt::Debug for RawDialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RawDialer")
      .field("kind", &self.kind)
      .field("address", &self.address)
      .field("tls", &self.tls.is_some())
      .finish()
  }
}

impl RawDialer {
  pub(crate) fn direct(kind: NetworkKind, address: &str, tls: Option<TlsClient>) -> Self {
    let target = match kind {
      #[cfg(unix)]
      NetworkKind::Unix => Target::Unix(address.into()),
      _ => Target::Tcp(address.to_string()),
    };
    Self {
      kind,
      address: address.to_string(),
      target,
      tls,
    }
  }

  pub(crate) fn deferred(
    kind: NetworkKind,
    address: &str,
    tls: Option<TlsClient>,
    id: u64,
    ready: oneshot::Receiver<Source>,
    commands: mpsc::UnboundedSender<Command>,
  ) -> Self {
    let forget = Dropkick::new((Command::Forget { id }, commands));
    Self {
      kind,
      address: address.to_string(),
      target: Target::Deferred {
        id,
        ready: ready.shared(),
        forget: Mutex::new(Some(forget)),
      },
      tls,
    }
  }

  pub fn kind(&self) -> NetworkKind {
    self.kind
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  pub fn is_secure(&self) -> bool {
    self.tls.is_some()
  }

  /// The pending request id of a deferred dialer
  pub fn pending_id(&self) -> Option<u64> {
    match &self.target {
      Target::Deferred { id, .. } => Some(*id),
      _ => None,
    }
  }

  /// Whether a deferred dialer's address has been registered; direct dialers are always ready
  pub fn is_ready(&self) -> bool {
    match &self.target {
      Target::Deferred { ready, .. } => matches!(ready.peek(), Some(Ok(_))),
      _ => true,
    }
  }

  pub async fn dial(&self, ctx: &Context) -> Result<WrappedStream, DialError> {
    if let Some(e) = ctx.err() {
      return Err(e.into());
    }
    let stream = match &self.target {
      Target::Tcp(address) => {
        let stream = tokio::select! {
          biased;
          e = ctx.done() => return Err(e.into()),
          res = TcpStream::connect(address.as_str()) => res?,
        };
        let _ = stream.set_nodelay(true);
        WrappedStream::Tcp(stream)
      }
      #[cfg(unix)]
      Target::Unix(path) => tokio::select! {
        biased;
        e = ctx.done() => return Err(e.into()),
        res = tokio::net::UnixStream::connect(path) => WrappedStream::Unix(res?),
      },
      Target::Deferred { ready, .. } => {
        let source = tokio::select! {
          biased;
          e = ctx.done() => return Err(e.into()),
          res = ready.clone() => res.map_err(|_| DialError::Closed)?,
        };
        source.open(ctx.clone()).await?
      }
    };
    match &self.tls {
      None => Ok(stream),
      Some(tls) => tls.handshake(ctx, stream).await,
    }
  }

  /// Withdraws a still-pending request; later dials of an unfulfilled dialer fail as closed
  pub fn close(&self) {
    if let Target::Deferred { forget, .. } = &self.target {
      let guard = forget
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
      drop(guard);
    }
  }
}
