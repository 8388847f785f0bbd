// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::Error as IOError;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_rustls::TlsAcceptor;

use super::pipe::PipeListener;
use super::NetworkKind;
use crate::common::WrappedStream;
use crate::util::Context;

pub(crate) enum Socket {
  Tcp(TcpListener),
  #[cfg(unix)]
  Unix(UnixListener),
  Pipe(PipeListener),
}

/// A bound listener on any of the stream networks, optionally terminating TLS
pub struct NetListener {
  socket: Socket,
  kind: NetworkKind,
  address: String,
  tls: Option<TlsAcceptor>,
}

/// A freshly accepted transport; TLS, if any, has not been negotiated yet
pub struct Incoming {
  stream: WrappedStream,
  peer: String,
  tls: Option<TlsAcceptor>,
}

impl NetListener {
  pub(crate) fn new(socket: Socket, kind: NetworkKind, address: String) -> Self {
    Self {
      socket,
      kind,
      address,
      tls: None,
    }
  }

  pub(crate) fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
    self.tls = Some(acceptor);
    self
  }

  pub fn kind(&self) -> NetworkKind {
    self.kind
  }

  pub fn is_secure(&self) -> bool {
    self.tls.is_some()
  }

  /// The configured address
  pub fn address(&self) -> &str {
    &self.address
  }

  /// The address actually bound, which differs from [NetListener::address] for ephemeral ports
  pub fn local_addr(&self) -> String {
    match &self.socket {
      Socket::Tcp(listener) => listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| self.address.clone()),
      #[cfg(unix)]
      Socket::Unix(_) => self.address.clone(),
      Socket::Pipe(listener) => listener.address().to_string(),
    }
  }

  /// `network[+tls]://address` of the bound address, as used in listener tags
  pub fn scheme_address(&self) -> String {
    let tls = if self.is_secure() { "+tls" } else { "" };
    format!("{}{}://{}", self.kind, tls, self.local_addr())
  }

  pub async fn accept(&mut self) -> Result<Incoming, IOError> {
    let (stream, peer) = match &mut self.socket {
      Socket::Tcp(listener) => {
        let (stream, peer) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        (WrappedStream::Tcp(stream), peer.to_string())
      }
      #[cfg(unix)]
      Socket::Unix(listener) => {
        let (stream, peer) = listener.accept().await?;
        let peer = peer
          .as_pathname()
          .map(|path| path.display().to_string())
          .unwrap_or_else(|| "unix".to_string());
        (WrappedStream::Unix(stream), peer)
      }
      Socket::Pipe(listener) => {
        let stream = listener.accept().await?;
        (WrappedStream::Duplex(stream), format!("pipe:{}", listener.address()))
      }
    };
    Ok(Incoming {
      stream,
      peer,
      tls: self.tls.clone(),
    })
  }
}

impl Incoming {
  pub fn peer(&self) -> &str {
    &self.peer
  }

  /// Completes the server side of TLS when the listener terminates it, racing `ctx`
  pub async fn establish(self, ctx: &Context) -> Result<WrappedStream, IOError> {
    let acceptor = match self.tls {
      None => return Ok(self.stream),
      Some(acceptor) => acceptor,
    };
    tokio::select! {
      biased;
      e = ctx.done() => Err(IOError::new(std::io::ErrorKind::TimedOut, e)),
      res = acceptor.accept(self.stream) => res.map(|s| WrappedStream::TlsServer(Box::new(s))),
    }
  }
}
