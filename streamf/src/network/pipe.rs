// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! In-process pipes: each dial produces an entangled duplex pair, one half per side

use futures::future::{BoxFuture, FutureExt};
use std::io::{Error as IOError, ErrorKind};
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use super::registry::DialSource;
use super::Registration;
use crate::common::WrappedStream;
use crate::dialer::DialError;
use crate::util::Context;

/// Bytes buffered in each direction of a pipe
pub const PIPE_BUFFER: usize = 64 * 1024;
const ACCEPT_BACKLOG: usize = 128;

/// Accepting side of a registered pipe address
pub struct PipeListener {
  address: String,
  incoming: mpsc::Receiver<DuplexStream>,
  // Released when the listener goes away, freeing the address
  _registration: Registration,
}

impl PipeListener {
  pub(crate) fn channel() -> (PipeConnector, mpsc::Receiver<DuplexStream>) {
    let (sender, incoming) = mpsc::channel(ACCEPT_BACKLOG);
    (PipeConnector { sender }, incoming)
  }

  pub(crate) fn new(
    address: String,
    incoming: mpsc::Receiver<DuplexStream>,
    registration: Registration,
  ) -> Self {
    Self {
      address,
      incoming,
      _registration: registration,
    }
  }

  pub fn address(&self) -> &str {
    &self.address
  }

  pub async fn accept(&mut self) -> Result<DuplexStream, IOError> {
    self
      .incoming
      .recv()
      .await
      .ok_or_else(|| IOError::new(ErrorKind::NotConnected, "pipe listener closed"))
  }
}

/// Dial source registered for a pipe address
pub(crate) struct PipeConnector {
  sender: mpsc::Sender<DuplexStream>,
}

impl DialSource for PipeConnector {
  fn open(&self, ctx: Context) -> BoxFuture<'_, Result<WrappedStream, DialError>> {
    async move {
      let (near, far) = tokio::io::duplex(PIPE_BUFFER);
      tokio::select! {
        biased;
        e = ctx.done() => Err(e.into()),
        sent = self.sender.send(far) => match sent {
          Ok(()) => Ok(WrappedStream::Duplex(near)),
          Err(_) => Err(DialError::Io(IOError::new(
            ErrorKind::ConnectionRefused,
            "pipe listener closed",
          ))),
        },
      }
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::PipeListener;
  use crate::dialer::DialError;
  use crate::network::registry::DialSource;
  use crate::util::Context;
  use std::io::ErrorKind;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn connector_hands_over_the_far_half() {
    let (connector, mut incoming) = PipeListener::channel();
    let mut near = connector.open(Context::background()).await.unwrap();
    let mut far = incoming.recv().await.unwrap();
    near.write_all(b"hi").await.unwrap();
    let mut received = [0u8; 2];
    far.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"hi");
  }

  #[tokio::test]
  async fn connector_refuses_after_listener_drops() {
    let (connector, incoming) = PipeListener::channel();
    drop(incoming);
    match connector.open(Context::background()).await {
      Err(DialError::Io(e)) => assert_eq!(e.kind(), ErrorKind::ConnectionRefused),
      other => panic!("expected refusal, got {:?}", other.map(|_| ())),
    }
  }
}
