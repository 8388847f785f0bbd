// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::{Error as IOError, ErrorKind};
use std::pin::Pin;

use futures::future::{BoxFuture, FutureExt};
use futures::sink::{Sink, SinkExt};
use futures::stream::{BoxStream, Stream, StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use super::stream::{Close, WrappedStream};

/// One whole application message on a message-framed endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
  Binary(Vec<u8>),
  Text(String),
}

impl Frame {
  pub fn as_bytes(&self) -> &[u8] {
    match self {
      Frame::Binary(data) => data,
      Frame::Text(text) => text.as_bytes(),
    }
  }

  pub fn len(&self) -> usize {
    self.as_bytes().len()
  }

  pub fn is_empty(&self) -> bool {
    self.as_bytes().is_empty()
  }
}

impl From<Frame> for Message {
  fn from(frame: Frame) -> Self {
    match frame {
      Frame::Binary(data) => Message::Binary(data),
      Frame::Text(text) => Message::Text(text),
    }
  }
}

pub type FrameSink = Pin<Box<dyn Sink<Frame, Error = IOError> + Send>>;

/// A duplex connection whose reads and writes are whole messages
pub struct MessageEndpoint {
  pub stream: BoxStream<'static, Result<Frame, IOError>>,
  pub sink: FrameSink,
}

impl MessageEndpoint {
  pub fn new<St, Si>(stream: St, sink: Si) -> Self
  where
    St: Stream<Item = Result<Frame, IOError>> + Send + 'static,
    Si: Sink<Frame, Error = IOError> + Send + 'static,
  {
    Self {
      stream: stream.boxed(),
      sink: Box::pin(sink),
    }
  }

  /// Adapts a WebSocket connection; control frames are handled by the socket and never surface
  pub fn from_websocket<S>(socket: WebSocketStream<S>) -> Self
  where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
  {
    let (sink, stream) = socket.split();
    let stream = stream
      .map_err(websocket_io_error)
      .try_filter_map(|message| {
        futures::future::ready(Ok(match message {
          Message::Binary(data) => Some(Frame::Binary(data)),
          Message::Text(text) => Some(Frame::Text(text)),
          _ => None,
        }))
      });
    let sink = sink
      .sink_map_err(websocket_io_error)
      .with(|frame: Frame| futures::future::ready(Ok::<_, IOError>(Message::from(frame))));
    Self::new(stream, sink)
  }
}

pub(crate) fn websocket_io_error(error: tungstenite::Error) -> IOError {
  match error {
    tungstenite::Error::Io(inner) => inner,
    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
      IOError::from(ErrorKind::NotConnected)
    }
    other => IOError::new(ErrorKind::Other, other),
  }
}

/// A live connection, tagged with its shape
pub enum Endpoint {
  Stream(WrappedStream),
  Message(MessageEndpoint),
}

impl std::fmt::Debug for Endpoint {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Endpoint::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
      Endpoint::Message(_) => f.write_str("Message"),
    }
  }
}

impl From<WrappedStream> for Endpoint {
  fn from(stream: WrappedStream) -> Self {
    Endpoint::Stream(stream)
  }
}

impl From<MessageEndpoint> for Endpoint {
  fn from(endpoint: MessageEndpoint) -> Self {
    Endpoint::Message(endpoint)
  }
}

impl Close for Endpoint {
  fn close(self) -> BoxFuture<'static, ()> {
    match self {
      Endpoint::Stream(stream) => stream.close(),
      Endpoint::Message(mut endpoint) => async move {
        let _ = endpoint.sink.close().await;
      }
      .boxed(),
    }
  }
}
