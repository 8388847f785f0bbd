// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Bidirectional copying between two live endpoints
//!
//! The copy strategy is picked from the endpoint shapes once, when the
//! endpoints are split. Raw streams copy through a pooled buffer (or straight
//! from their own buffer when they have one); message endpoints keep frame
//! boundaries between themselves and emit one binary frame per chunk read from
//! a raw stream. Boundaries are lost when messages are written into a raw stream.

use std::future::Future;
use std::io::Error as IOError;
use std::time::Duration;

use futures::future::Either;
use futures::{SinkExt, StreamExt, TryStreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::common::endpoint::FrameSink;
use crate::common::stream::{StreamReader, StreamWriter};
use crate::common::{Endpoint, Frame};
use crate::pool::BufferPool;
use crate::util::Context;

/// Grace periods at or below this close both sides as soon as one direction ends
pub const MIN_CLOSE_GRACE: Duration = Duration::from_millis(1);
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// How one direction of a bridge ended
#[derive(Debug)]
pub enum Transfer {
  /// Reached end of input after copying this many bytes, and half-closed the destination
  Completed(u64),
  Failed(IOError),
  /// Cut off by the close grace timer, or never given a chance to finish
  Interrupted,
}

impl Transfer {
  pub fn is_completed(&self) -> bool {
    matches!(self, Transfer::Completed(_))
  }
}

impl From<Result<u64, IOError>> for Transfer {
  fn from(result: Result<u64, IOError>) -> Self {
    match result {
      Ok(copied) => Transfer::Completed(copied),
      Err(error) => Transfer::Failed(error),
    }
  }
}

#[derive(Debug)]
pub struct BridgeReport {
  pub a_to_b: Transfer,
  pub b_to_a: Transfer,
}

enum Inbound {
  Stream(StreamReader),
  Message(futures::stream::BoxStream<'static, Result<Frame, IOError>>),
}

enum OutboundSink {
  Stream(StreamWriter),
  Message(FrameSink),
}

/// Write side of an endpoint; shut down at most once
struct Outbound {
  sink: OutboundSink,
  shut: bool,
}

impl Outbound {
  async fn shutdown(&mut self) -> Result<(), IOError> {
    if self.shut {
      return Ok(());
    }
    self.shut = true;
    match &mut self.sink {
      OutboundSink::Stream(writer) => writer.shutdown().await,
      OutboundSink::Message(sink) => sink.close().await,
    }
  }

  async fn close(mut self) {
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.shutdown()).await {
      Ok(Err(error)) => tracing::trace!(?error, "endpoint shutdown failed"),
      Err(_) => tracing::trace!("endpoint shutdown timed out"),
      Ok(Ok(())) => {}
    }
  }
}

fn split(endpoint: Endpoint) -> (Inbound, Outbound) {
  let (inbound, sink) = match endpoint {
    Endpoint::Stream(stream) => {
      let (reader, writer) = stream.into_split();
      (Inbound::Stream(reader), OutboundSink::Stream(writer))
    }
    Endpoint::Message(endpoint) => (
      Inbound::Message(endpoint.stream),
      OutboundSink::Message(endpoint.sink),
    ),
  };
  (inbound, Outbound { sink, shut: false })
}

/// Copies `a` and `b` into each other until one direction ends, then applies the close grace
///
/// A direction ending at a clean end of input half-closes its destination so the
/// peer can still finish. Once the first direction is over, the other gets up to
/// `close_grace` to finish (none at all when `close_grace` is at most
/// [MIN_CLOSE_GRACE]). Both endpoints are closed exactly once before this returns.
pub async fn bridging(
  a: Endpoint,
  b: Endpoint,
  pool: &BufferPool,
  close_grace: Duration,
) -> BridgeReport {
  bridging_until(a, b, pool, close_grace, &Context::background()).await
}

/// [bridging], stopped early when `ctx` is done
///
/// Stopping interrupts whatever is still copying; both endpoints still go through
/// their single shutdown before this returns.
#[tracing::instrument(level = "debug", skip_all, fields(close_grace = ?close_grace))]
pub async fn bridging_until(
  a: Endpoint,
  b: Endpoint,
  pool: &BufferPool,
  close_grace: Duration,
  ctx: &Context,
) -> BridgeReport {
  let (mut a_in, mut a_out) = split(a);
  let (mut b_in, mut b_out) = split(b);

  let (a_to_b, b_to_a) = {
    let forward = pump(&mut a_in, &mut b_out, pool);
    let backward = pump(&mut b_in, &mut a_out, pool);
    futures::pin_mut!(forward, backward);
    let first = tokio::select! {
      biased;
      reason = ctx.done() => {
        tracing::debug!(%reason, "bridge stopped");
        None
      }
      first = futures::future::select(forward, backward) => Some(first),
    };
    match first {
      None => (Transfer::Interrupted, Transfer::Interrupted),
      Some(Either::Left((done, rest))) => {
        (Transfer::from(done), linger(rest, close_grace, ctx).await)
      }
      Some(Either::Right((done, rest))) => {
        (linger(rest, close_grace, ctx).await, Transfer::from(done))
      }
    }
  };

  futures::future::join(a_out.close(), b_out.close()).await;
  drop((a_in, b_in));
  BridgeReport { a_to_b, b_to_a }
}

async fn linger<F>(rest: F, close_grace: Duration, ctx: &Context) -> Transfer
where
  F: Future<Output = Result<u64, IOError>> + Unpin,
{
  if close_grace <= MIN_CLOSE_GRACE {
    return Transfer::Interrupted;
  }
  tokio::select! {
    biased;
    _ = ctx.done() => Transfer::Interrupted,
    done = tokio::time::timeout(close_grace, rest) => match done {
      Ok(done) => done.into(),
      Err(_elapsed) => Transfer::Interrupted,
    },
  }
}

async fn pump(src: &mut Inbound, dst: &mut Outbound, pool: &BufferPool) -> Result<u64, IOError> {
  let copied = match (src, &mut dst.sink) {
    (Inbound::Stream(StreamReader::Buffered(reader)), OutboundSink::Stream(writer)) => {
      tokio::io::copy_buf(reader, writer).await?
    }
    (Inbound::Stream(reader), OutboundSink::Stream(writer)) => {
      copy_pooled(reader, writer, pool).await?
    }
    (Inbound::Stream(reader), OutboundSink::Message(sink)) => {
      chunks_to_messages(reader, sink, pool).await?
    }
    (Inbound::Message(stream), OutboundSink::Stream(writer)) => {
      messages_to_bytes(stream, writer).await?
    }
    (Inbound::Message(stream), OutboundSink::Message(sink)) => {
      let mut copied = 0u64;
      while let Some(frame) = stream.try_next().await? {
        copied += frame.len() as u64;
        sink.send(frame).await?;
      }
      copied
    }
  };
  dst.shutdown().await?;
  Ok(copied)
}

async fn copy_pooled(
  reader: &mut StreamReader,
  writer: &mut StreamWriter,
  pool: &BufferPool,
) -> Result<u64, IOError> {
  let mut buffer = pool.lease();
  let mut copied = 0u64;
  loop {
    let read = reader.read(&mut buffer).await?;
    if read == 0 {
      return Ok(copied);
    }
    writer.write_all(&buffer[..read]).await?;
    writer.flush().await?;
    copied += read as u64;
  }
}

async fn chunks_to_messages(
  reader: &mut StreamReader,
  sink: &mut FrameSink,
  pool: &BufferPool,
) -> Result<u64, IOError> {
  let mut buffer = pool.lease();
  let mut copied = 0u64;
  loop {
    let read = reader.read(&mut buffer).await?;
    if read == 0 {
      return Ok(copied);
    }
    sink.send(Frame::Binary(buffer[..read].to_vec())).await?;
    copied += read as u64;
  }
}

async fn messages_to_bytes(
  stream: &mut futures::stream::BoxStream<'static, Result<Frame, IOError>>,
  writer: &mut StreamWriter,
) -> Result<u64, IOError> {
  let mut copied = 0u64;
  while let Some(frame) = stream.next().await {
    let frame = frame?;
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await?;
    copied += frame.len() as u64;
  }
  Ok(copied)
}

#[cfg(test)]
mod tests {
  use super::{bridging, bridging_until, Transfer};
  use crate::common::endpoint::tests::channel_endpoint;
  use crate::common::{Endpoint, Frame, WrappedStream};
  use crate::pool::BufferPool;
  use futures::StreamExt;
  use std::io::Error as IOError;
  use std::pin::Pin;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::task::{Context, Poll};
  use std::time::Duration;
  use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

  /// Counts completed shutdowns and drops of the wrapped stream
  struct Counted {
    inner: DuplexStream,
    shutdowns: Arc<AtomicUsize>,
    drops: Arc<AtomicUsize>,
  }

  impl Drop for Counted {
    fn drop(&mut self) {
      self.drops.fetch_add(1, Ordering::SeqCst);
    }
  }

  impl AsyncRead for Counted {
    fn poll_read(
      mut self: Pin<&mut Self>,
      cx: &mut Context<'_>,
      buf: &mut ReadBuf<'_>,
    ) -> Poll<Result<(), IOError>> {
      Pin::new(&mut self.inner).poll_read(cx, buf)
    }
  }

  impl AsyncWrite for Counted {
    fn poll_write(
      mut self: Pin<&mut Self>,
      cx: &mut Context<'_>,
      buf: &[u8],
    ) -> Poll<Result<usize, IOError>> {
      Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
      Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), IOError>> {
      let polled = Pin::new(&mut self.inner).poll_shutdown(cx);
      if polled.is_ready() {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
      }
      polled
    }
  }

  fn counted(inner: DuplexStream) -> (Endpoint, Arc<AtomicUsize>, Arc<AtomicUsize>) {
    let shutdowns = Arc::new(AtomicUsize::new(0));
    let drops = Arc::new(AtomicUsize::new(0));
    let stream = WrappedStream::boxed(Counted {
      inner,
      shutdowns: shutdowns.clone(),
      drops: drops.clone(),
    });
    (Endpoint::Stream(stream), shutdowns, drops)
  }

  #[tokio::test]
  async fn each_side_is_closed_exactly_once() {
    for grace in [Duration::ZERO, Duration::from_millis(200)] {
      let (a_inner, mut a_peer) = tokio::io::duplex(1024);
      let (b_inner, b_peer) = tokio::io::duplex(1024);
      let (a, a_shutdowns, a_drops) = counted(a_inner);
      let (b, b_shutdowns, b_drops) = counted(b_inner);

      // Writes towards b fail; reads from b end immediately
      drop(b_peer);
      a_peer.write_all(b"doomed").await.unwrap();

      let pool = BufferPool::default();
      let report = bridging(a, b, &pool, grace).await;
      assert!(!report.a_to_b.is_completed() || !report.b_to_a.is_completed());
      for counter in [&a_shutdowns, &b_shutdowns, &a_drops, &b_drops] {
        assert_eq!(counter.load(Ordering::SeqCst), 1);
      }
      let mut rest = Vec::new();
      a_peer.read_to_end(&mut rest).await.unwrap();
      assert!(rest.is_empty());
    }
  }

  #[tokio::test]
  async fn stopping_still_closes_each_side_once() {
    let (a_inner, mut a_peer) = tokio::io::duplex(1024);
    let (b_inner, mut b_peer) = tokio::io::duplex(1024);
    let (a, a_shutdowns, a_drops) = counted(a_inner);
    let (b, b_shutdowns, b_drops) = counted(b_inner);
    let stop = tokio_util::sync::CancellationToken::new();
    let ctx = crate::util::Context::from(stop.clone());

    let bridge = tokio::spawn(async move {
      let pool = BufferPool::default();
      bridging_until(a, b, &pool, Duration::from_secs(30), &ctx).await
    });
    a_peer.write_all(b"ping").await.unwrap();
    let mut forwarded = [0u8; 4];
    b_peer.read_exact(&mut forwarded).await.unwrap();
    assert_eq!(&forwarded, b"ping");

    // Both directions are idle and open; only the stop ends the bridge
    stop.cancel();
    let report = bridge.await.unwrap();
    assert!(matches!(report.a_to_b, Transfer::Interrupted));
    assert!(matches!(report.b_to_a, Transfer::Interrupted));
    for counter in [&a_shutdowns, &b_shutdowns, &a_drops, &b_drops] {
      assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
    let mut rest = Vec::new();
    a_peer.read_to_end(&mut rest).await.unwrap();
    b_peer.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn lagging_direction_finishes_within_grace() {
    let (client, mut client_peer) = tokio::io::duplex(1024);
    let (server, mut server_peer) = tokio::io::duplex(1024);
    let server_task = tokio::spawn(async move {
      let mut request = Vec::new();
      server_peer.read_to_end(&mut request).await.unwrap();
      tokio::time::sleep(Duration::from_millis(500)).await;
      server_peer.write_all(b"response").await.unwrap();
      request
    });
    client_peer.write_all(b"request").await.unwrap();
    client_peer.shutdown().await.unwrap();

    let pool = BufferPool::default();
    let started = tokio::time::Instant::now();
    let report = bridging(
      WrappedStream::from(client).into(),
      WrappedStream::from(server).into(),
      &pool,
      Duration::from_secs(2),
    )
    .await;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_secs(2));
    assert!(matches!(report.a_to_b, Transfer::Completed(7)));
    assert!(matches!(report.b_to_a, Transfer::Completed(8)));

    let mut response = Vec::new();
    client_peer.read_to_end(&mut response).await.unwrap();
    assert_eq!(response, b"response");
    assert_eq!(server_task.await.unwrap(), b"request");
  }

  #[tokio::test(start_paused = true)]
  async fn grace_expiry_cuts_the_other_direction() {
    for (grace, expected) in [
      (Duration::from_millis(1), Duration::ZERO),
      (Duration::from_millis(100), Duration::from_millis(100)),
    ] {
      let (client, mut client_peer) = tokio::io::duplex(1024);
      let (server, _server_peer) = tokio::io::duplex(1024);
      client_peer.shutdown().await.unwrap();

      let pool = BufferPool::default();
      let started = tokio::time::Instant::now();
      let report = bridging(
        WrappedStream::from(client).into(),
        WrappedStream::from(server).into(),
        &pool,
        grace,
      )
      .await;
      let elapsed = started.elapsed();
      assert!(elapsed >= expected && elapsed < expected + Duration::from_millis(5));
      assert!(matches!(report.a_to_b, Transfer::Completed(0)));
      assert!(matches!(report.b_to_a, Transfer::Interrupted));
    }
  }

  #[tokio::test]
  async fn message_boundaries_survive() {
    let (a, a_in, _a_out) = channel_endpoint();
    let (b, _b_in, b_out) = channel_endpoint();
    for text in ["a", "bb", "ccc"] {
      a_in.unbounded_send(Frame::Text(text.into())).unwrap();
    }
    a_in.unbounded_send(Frame::Binary(vec![0, 1])).unwrap();
    drop(a_in);

    let pool = BufferPool::default();
    let report = bridging(a.into(), b.into(), &pool, Duration::ZERO).await;
    assert!(matches!(report.a_to_b, Transfer::Completed(8)));
    let received: Vec<Frame> = b_out.collect().await;
    assert_eq!(
      received,
      vec![
        Frame::Text("a".into()),
        Frame::Text("bb".into()),
        Frame::Text("ccc".into()),
        Frame::Binary(vec![0, 1]),
      ]
    );
  }

  #[tokio::test]
  async fn raw_and_message_endpoints_interoperate() {
    let (raw, mut raw_peer) = tokio::io::duplex(1024);
    let (message, message_in, message_out) = channel_endpoint();
    message_in.unbounded_send(Frame::Text("hi ".into())).unwrap();
    message_in.unbounded_send(Frame::Binary(b"there".to_vec())).unwrap();
    drop(message_in);
    raw_peer.write_all(b"hello").await.unwrap();
    raw_peer.shutdown().await.unwrap();

    let pool = BufferPool::default();
    let report = bridging(
      WrappedStream::from(raw).into(),
      message.into(),
      &pool,
      Duration::from_secs(1),
    )
    .await;
    assert!(report.a_to_b.is_completed() && report.b_to_a.is_completed());

    let mut text = String::new();
    raw_peer.read_to_string(&mut text).await.unwrap();
    assert_eq!(text, "hi there");
    let frames: Vec<Frame> = message_out.collect().await;
    let bytes: Vec<u8> = frames
      .iter()
      .inspect(|frame| assert!(matches!(frame, Frame::Binary(_))))
      .flat_map(|frame| frame.as_bytes().to_vec())
      .collect();
    assert_eq!(bytes, b"hello");
  }

  #[tokio::test]
  async fn buffered_sources_keep_prefetched_bytes() {
    let (a, mut a_peer) = WrappedStream::duplex(1024);
    let (b, mut b_peer) = WrappedStream::duplex(1024);
    a_peer.write_all(b"prefix|payload").await.unwrap();
    a_peer.shutdown().await.unwrap();
    b_peer.shutdown().await.unwrap();

    let mut a = a.buffered(64);
    if let WrappedStream::Buffered(ref mut reader) = a {
      let mut prefix = Vec::new();
      tokio::io::AsyncBufReadExt::read_until(&mut **reader, b'|', &mut prefix)
        .await
        .unwrap();
      assert_eq!(prefix, b"prefix|");
    }

    let pool = BufferPool::new(4096, 0);
    let report = bridging(a.into(), b.into(), &pool, Duration::from_secs(1)).await;
    assert!(matches!(report.a_to_b, Transfer::Completed(7)));
    let mut forwarded = Vec::new();
    b_peer.read_to_end(&mut forwarded).await.unwrap();
    assert_eq!(forwarded, b"payload");
  }
}
