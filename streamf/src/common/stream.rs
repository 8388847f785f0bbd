// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::io::{Cursor, Error as IOError};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use tokio::io::{
  AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, Chain, DuplexStream,
  ReadBuf,
};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;

/// A duplex byte stream usable as a transport
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> TunnelStream for T {}

/// Anything the fabric hands out that must be explicitly shut down when abandoned
pub trait Close: Send + 'static {
  fn close(self) -> BoxFuture<'static, ()>;
}

/// Every transport shape the fabric can produce, resolved when the connection is made
pub enum WrappedStream {
  Tcp(TcpStream),
  #[cfg(unix)]
  Unix(UnixStream),
  /// In-process pipe half
  Duplex(DuplexStream),
  TlsClient(Box<tokio_rustls::client::TlsStream<WrappedStream>>),
  TlsServer(Box<tokio_rustls::server::TlsStream<WrappedStream>>),
  /// A stream whose reads already go through a buffer; copies drain that buffer directly
  Buffered(Box<BufReader<WrappedStream>>),
  Boxed(Box<dyn TunnelStream>),
}

impl std::fmt::Debug for WrappedStream {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let shape = match self {
      WrappedStream::Tcp(_) => "Tcp",
      #[cfg(unix)]
      WrappedStream::Unix(_) => "Unix",
      WrappedStream::Duplex(_) => "Duplex",
      WrappedStream::TlsClient(_) => "TlsClient",
      WrappedStream::TlsServer(_) => "TlsServer",
      WrappedStream::Buffered(_) => "Buffered",
      WrappedStream::Boxed(_) => "Boxed",
    };
    f.debug_tuple("WrappedStream").field(&shape).finish()
  }
}

impl WrappedStream {
  pub fn duplex(max_buf_size: usize) -> (WrappedStream, WrappedStream) {
    let (a, b) = tokio::io::duplex(max_buf_size);
    (a.into(), b.into())
  }

  pub fn boxed<S: TunnelStream + 'static>(stream: S) -> Self {
    WrappedStream::Boxed(Box::new(stream))
  }

  pub fn buffered(self, capacity: usize) -> Self {
    WrappedStream::Buffered(Box::new(BufReader::with_capacity(capacity, self)))
  }

  pub fn is_secure(&self) -> bool {
    match self {
      WrappedStream::TlsClient(_) | WrappedStream::TlsServer(_) => true,
      WrappedStream::Buffered(inner) => inner.get_ref().is_secure(),
      _ => false,
    }
  }

  /// Splits into independently owned halves
  ///
  /// Socket transports split without locking; everything else shares the
  /// stream through [tokio::io::split]. Bytes already buffered by a
  /// [WrappedStream::Buffered] stream stay at the front of the read half.
  pub fn into_split(self) -> (StreamReader, StreamWriter) {
    match self {
      WrappedStream::Tcp(s) => {
        let (r, w) = s.into_split();
        (StreamReader::Tcp(r), StreamWriter::Tcp(w))
      }
      #[cfg(unix)]
      WrappedStream::Unix(s) => {
        let (r, w) = s.into_split();
        (StreamReader::Unix(r), StreamWriter::Unix(w))
      }
      WrappedStream::Buffered(reader) => {
        let pending = reader.buffer().to_vec();
        let capacity = reader.capacity();
        let (r, w) = tokio::io::split(reader.into_inner());
        let reader = BufReader::with_capacity(capacity, Cursor::new(pending).chain(r));
        (StreamReader::Buffered(reader), StreamWriter::Split(w))
      }
      other => {
        let (r, w) = tokio::io::split(other);
        (StreamReader::Split(r), StreamWriter::Split(w))
      }
    }
  }
}

impl From<DuplexStream> for WrappedStream {
  fn from(stream: DuplexStream) -> Self {
    WrappedStream::Duplex(stream)
  }
}

impl From<TcpStream> for WrappedStream {
  fn from(stream: TcpStream) -> Self {
    WrappedStream::Tcp(stream)
  }
}

impl AsyncRead for WrappedStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      #[cfg(unix)]
      WrappedStream::Unix(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::Duplex(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      WrappedStream::TlsClient(ref mut s) => AsyncRead::poll_read(Pin::new(&mut **s), cx, buf),
      WrappedStream::TlsServer(ref mut s) => AsyncRead::poll_read(Pin::new(&mut **s), cx, buf),
      WrappedStream::Buffered(ref mut s) => AsyncRead::poll_read(Pin::new(&mut **s), cx, buf),
      WrappedStream::Boxed(ref mut s) => AsyncRead::poll_read(Pin::new(&mut **s), cx, buf),
    }
  }
}

impl AsyncWrite for WrappedStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      #[cfg(unix)]
      WrappedStream::Unix(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::Duplex(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      WrappedStream::TlsClient(ref mut s) => AsyncWrite::poll_write(Pin::new(&mut **s), cx, buf),
      WrappedStream::TlsServer(ref mut s) => AsyncWrite::poll_write(Pin::new(&mut **s), cx, buf),
      WrappedStream::Buffered(ref mut s) => AsyncWrite::poll_write(Pin::new(&mut **s), cx, buf),
      WrappedStream::Boxed(ref mut s) => AsyncWrite::poll_write(Pin::new(&mut **s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      #[cfg(unix)]
      WrappedStream::Unix(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::Duplex(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      WrappedStream::TlsClient(ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut **s), cx),
      WrappedStream::TlsServer(ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut **s), cx),
      WrappedStream::Buffered(ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut **s), cx),
      WrappedStream::Boxed(ref mut s) => AsyncWrite::poll_flush(Pin::new(&mut **s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      WrappedStream::Tcp(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      #[cfg(unix)]
      WrappedStream::Unix(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::Duplex(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      WrappedStream::TlsClient(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut **s), cx),
      WrappedStream::TlsServer(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut **s), cx),
      WrappedStream::Buffered(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut **s), cx),
      WrappedStream::Boxed(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(&mut **s), cx),
    }
  }
}

impl Close for WrappedStream {
  fn close(mut self) -> BoxFuture<'static, ()> {
    async move {
      if let Err(error) = self.shutdown().await {
        tracing::trace!(?error, "shutdown of abandoned stream failed");
      }
    }
    .boxed()
  }
}

type BufferedHalf = BufReader<Chain<Cursor<Vec<u8>>, tokio::io::ReadHalf<WrappedStream>>>;

/// Owned read side of a [WrappedStream]; the buffered variant can be copied from without another buffer
pub enum StreamReader {
  Tcp(tokio::net::tcp::OwnedReadHalf),
  #[cfg(unix)]
  Unix(tokio::net::unix::OwnedReadHalf),
  Buffered(BufferedHalf),
  Split(tokio::io::ReadHalf<WrappedStream>),
}

impl AsyncRead for StreamReader {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      StreamReader::Tcp(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      #[cfg(unix)]
      StreamReader::Unix(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      StreamReader::Buffered(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
      StreamReader::Split(ref mut s) => AsyncRead::poll_read(Pin::new(s), cx, buf),
    }
  }
}

/// Owned write side of a [WrappedStream]
pub enum StreamWriter {
  Tcp(tokio::net::tcp::OwnedWriteHalf),
  #[cfg(unix)]
  Unix(tokio::net::unix::OwnedWriteHalf),
  Split(tokio::io::WriteHalf<WrappedStream>),
}

impl AsyncWrite for StreamWriter {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, IOError>> {
    match self.get_mut() {
      StreamWriter::Tcp(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      #[cfg(unix)]
      StreamWriter::Unix(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
      StreamWriter::Split(ref mut s) => AsyncWrite::poll_write(Pin::new(s), cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      StreamWriter::Tcp(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      #[cfg(unix)]
      StreamWriter::Unix(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
      StreamWriter::Split(ref mut s) => AsyncWrite::poll_flush(Pin::new(s), cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
    match self.get_mut() {
      StreamWriter::Tcp(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      #[cfg(unix)]
      StreamWriter::Unix(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
      StreamWriter::Split(ref mut s) => AsyncWrite::poll_shutdown(Pin::new(s), cx),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{StreamReader, WrappedStream};
  use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};

  #[test]
  fn _assert_traits() {
    fn is_tunnel<T: super::TunnelStream>() {}
    is_tunnel::<WrappedStream>();
    is_tunnel::<super::StreamWriter>();
  }

  #[tokio::test]
  async fn split_halves_are_independent() {
    let (near, mut far) = WrappedStream::duplex(64);
    let (mut reader, mut writer) = near.into_split();
    writer.write_all(b"ping").await.unwrap();
    let mut received = [0u8; 4];
    far.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"ping");

    far.write_all(b"pong").await.unwrap();
    reader.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"pong");
  }

  #[tokio::test]
  async fn buffered_split_keeps_prefetched_bytes() {
    let (near, mut far) = WrappedStream::duplex(64);
    far.write_all(b"first\nsecond").await.unwrap();
    far.shutdown().await.unwrap();

    let mut buffered = near.buffered(16);
    let mut line = String::new();
    if let WrappedStream::Buffered(ref mut inner) = buffered {
      inner.read_line(&mut line).await.unwrap();
    }
    assert_eq!(line, "first\n");

    let (mut reader, _writer) = buffered.into_split();
    assert!(matches!(reader, StreamReader::Buffered(_)));
    let mut rest = String::new();
    reader.read_to_string(&mut rest).await.unwrap();
    assert_eq!(rest, "second");
  }
}
