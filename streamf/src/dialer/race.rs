// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Races a dial attempt against cancellation, timeout, and dialer shutdown

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::DialError;
use crate::common::Close;
use crate::util::Context;

/// Shutdown state, default timeout and retry bound shared by every connect of one dialer
///
/// Each connect runs its attempts in a spawned task and waits for the first of
/// {shutdown, context done, attempt result}. When the caller stops waiting,
/// anything the task still produces is closed rather than leaked. Shutdown also
/// drops the attempt itself, whatever it is waiting on.
#[derive(Debug)]
pub struct ConnectRace {
  shutdown: CancellationToken,
  closed: AtomicBool,
  timeout: Option<Duration>,
  retry: usize,
}

impl ConnectRace {
  /// `timeout` of zero means the caller's context alone bounds each connect;
  /// `retry` counts re-attempts after the first failure
  pub fn new(timeout: Duration, retry: usize) -> Self {
    Self {
      shutdown: CancellationToken::new(),
      closed: AtomicBool::new(false),
      timeout: (!timeout.is_zero()).then_some(timeout),
      retry,
    }
  }

  pub fn timeout(&self) -> Option<Duration> {
    self.timeout
  }

  pub fn retry(&self) -> usize {
    self.retry
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Fails every in-flight and future connect with [DialError::Closed]
  pub fn close(&self) -> Result<(), DialError> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Err(DialError::Closed);
    }
    self.shutdown.cancel();
    Ok(())
  }

  pub async fn connect<T, F, Fut>(&self, ctx: &Context, attempt: F) -> Result<T, DialError>
  where
    T: Close,
    F: Fn(Context) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, DialError>> + Send + 'static,
  {
    if self.is_closed() {
      return Err(DialError::Closed);
    }
    let ctx = match self.timeout {
      Some(timeout) => ctx.with_timeout(timeout),
      None => ctx.clone(),
    };

    let (deliver, mut result) = oneshot::channel::<Result<T, DialError>>();
    let shutdown = self.shutdown.clone();
    let retry = self.retry;
    let attempt_ctx = ctx.clone();
    tokio::spawn(
      async move {
        let outcome = tokio::select! {
          biased;
          _ = shutdown.cancelled() => Err(DialError::Closed),
          outcome = attempts(&attempt_ctx, &shutdown, retry, attempt) => outcome,
        };
        if let Err(Ok(orphan)) = deliver.send(outcome) {
          tracing::debug!("connection arrived after its caller gave up; closing");
          orphan.close().await;
        }
      }
      .in_current_span(),
    );

    let lost = tokio::select! {
      biased;
      _ = self.shutdown.cancelled() => DialError::Closed,
      e = ctx.done() => e.into(),
      delivered = &mut result => return delivered.unwrap_or(Err(DialError::Closed)),
    };
    // The attempt may have finished while we were deciding; it must not leak either way
    result.close();
    if let Ok(Ok(orphan)) = result.try_recv() {
      orphan.close().await;
    }
    Err(lost)
  }
}

async fn attempts<T, F, Fut>(
  ctx: &Context,
  shutdown: &CancellationToken,
  retry: usize,
  attempt: F,
) -> Result<T, DialError>
where
  F: Fn(Context) -> Fut,
  Fut: Future<Output = Result<T, DialError>>,
{
  let mut failures = 0;
  loop {
    match attempt(ctx.clone()).await {
      Ok(connected) => return Ok(connected),
      Err(error) => {
        if failures >= retry || shutdown.is_cancelled() || ctx.is_done() {
          return Err(error);
        }
        failures += 1;
        tracing::debug!(%error, retry = failures, "dial attempt failed");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::ConnectRace;
  use crate::common::Close;
  use crate::dialer::DialError;
  use crate::util::Context;
  use futures::future::{BoxFuture, FutureExt};
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Arc;
  use std::time::Duration;
  use tokio_util::sync::CancellationToken;

  /// An endpoint that counts how often it was closed
  struct Tracked(Arc<AtomicUsize>);

  impl Close for Tracked {
    fn close(self) -> BoxFuture<'static, ()> {
      self.0.fetch_add(1, Ordering::SeqCst);
      futures::future::ready(()).boxed()
    }
  }

  fn slow_success(
    closes: Arc<AtomicUsize>,
    delay: Duration,
  ) -> impl Fn(Context) -> BoxFuture<'static, Result<Tracked, DialError>> + Send + 'static {
    move |_ctx| {
      let closes = closes.clone();
      async move {
        tokio::time::sleep(delay).await;
        Ok(Tracked(closes))
      }
      .boxed()
    }
  }

  #[tokio::test(start_paused = true)]
  async fn cancellation_closes_late_connection() {
    let closes = Arc::new(AtomicUsize::new(0));
    let race = ConnectRace::new(Duration::ZERO, 0);
    let token = CancellationToken::new();
    let ctx = Context::from(token.clone());
    let canceller = tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      token.cancel();
    });

    let outcome = race
      .connect(&ctx, slow_success(closes.clone(), Duration::from_millis(100)))
      .await;
    assert!(matches!(outcome, Err(DialError::Canceled)));
    canceller.await.unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1, "late connection must be closed once");
  }

  #[tokio::test(start_paused = true)]
  async fn shutdown_abandons_pending_attempt() {
    let closes = Arc::new(AtomicUsize::new(0));
    let race = Arc::new(ConnectRace::new(Duration::from_secs(5), 0));
    let closer = race.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(10)).await;
      closer.close().unwrap();
    });

    let outcome = race
      .connect(
        &Context::background(),
        slow_success(closes.clone(), Duration::from_millis(100)),
      )
      .await;
    assert!(matches!(outcome, Err(DialError::Closed)));
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 0, "the attempt never got to produce a connection");
    assert!(matches!(race.close(), Err(DialError::Closed)));
    assert!(matches!(
      race
        .connect(&Context::background(), slow_success(closes.clone(), Duration::ZERO))
        .await,
      Err(DialError::Closed)
    ));
  }

  /// Counts its drops, standing in for whatever a stuck attempt holds
  struct Held(Arc<AtomicUsize>);

  impl Drop for Held {
    fn drop(&mut self) {
      self.0.fetch_add(1, Ordering::SeqCst);
    }
  }

  #[tokio::test(start_paused = true)]
  async fn close_ends_stalled_attempts() {
    let released = Arc::new(AtomicUsize::new(0));
    let race = Arc::new(ConnectRace::new(Duration::ZERO, 0));
    let held = released.clone();
    let connecting = {
      let race = race.clone();
      tokio::spawn(async move {
        race
          .connect(&Context::background(), move |_ctx| {
            let held = Held(held.clone());
            async move {
              let _held = held;
              futures::future::pending::<Result<Tracked, DialError>>().await
            }
          })
          .await
      })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(released.load(Ordering::SeqCst), 0);
    race.close().unwrap();
    assert!(matches!(connecting.await.unwrap(), Err(DialError::Closed)));
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(released.load(Ordering::SeqCst), 1, "the stalled attempt must be dropped");
  }

  #[tokio::test(start_paused = true)]
  async fn default_timeout_applies() {
    let closes = Arc::new(AtomicUsize::new(0));
    let race = ConnectRace::new(Duration::from_millis(50), 0);
    let outcome = race
      .connect(
        &Context::background(),
        slow_success(closes.clone(), Duration::from_millis(100)),
      )
      .await;
    assert!(matches!(outcome, Err(DialError::DeadlineExceeded)));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(closes.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn delivered_connection_is_not_closed() {
    let closes = Arc::new(AtomicUsize::new(0));
    let race = ConnectRace::new(Duration::from_secs(5), 0);
    let connected = race
      .connect(&Context::background(), slow_success(closes.clone(), Duration::ZERO))
      .await;
    assert!(connected.is_ok());
    assert_eq!(closes.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn retries_are_bounded() {
    for retry in [0usize, 3] {
      let calls = Arc::new(AtomicUsize::new(0));
      let counter = calls.clone();
      let race = ConnectRace::new(Duration::from_secs(5), retry);
      let outcome = race
        .connect(&Context::background(), move |_ctx| {
          counter.fetch_add(1, Ordering::SeqCst);
          async {
            Err::<Tracked, _>(DialError::Io(std::io::ErrorKind::ConnectionRefused.into()))
          }
        })
        .await;
      match outcome {
        Err(DialError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::ConnectionRefused),
        _ => panic!("dial error must surface after retries"),
      }
      assert_eq!(calls.load(Ordering::SeqCst), retry + 1);
    }
  }

  #[tokio::test]
  async fn retry_stops_on_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let closes = Arc::new(AtomicUsize::new(0));
    let race = ConnectRace::new(Duration::from_secs(5), 5);
    let outcome = race
      .connect(&Context::background(), move |_ctx| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        let closes = closes.clone();
        async move {
          if attempt < 2 {
            Err(DialError::Io(std::io::ErrorKind::ConnectionReset.into()))
          } else {
            Ok(Tracked(closes))
          }
        }
      })
      .await;
    assert!(outcome.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }
}
