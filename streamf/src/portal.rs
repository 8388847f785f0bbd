// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Reverse dialing through connections that remote agents open towards us
//!
//! Agents connect to a portal listener and leave the connection parked. A
//! local dial claims a parked connection by writing [SYN]; the agent answers
//! [ACK] and from then on the connection carries the dialed traffic. Parked
//! connections get a [PING] every heartbeat interval and must echo it within
//! the heartbeat timeout. An agent that hears nothing for [DEFAULT_PARK_IDLE]
//! gives the connection up.

use std::collections::VecDeque;
use std::io::{Error as IOError, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::WrappedStream;
use crate::dialer::DialError;
use crate::network::{DialSource, NetListener};
use crate::util::{Backoff, Context, ContextError};

pub const PING: u8 = 1;
pub const SYN: u8 = 2;
pub const ACK: u8 = 3;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(500);
pub const DEFAULT_HEART: Duration = Duration::from_secs(40);
pub const DEFAULT_HEART_TIMEOUT: Duration = Duration::from_secs(1);
/// How long a parked agent waits for any byte from the portal, three default heartbeats
pub const DEFAULT_PARK_IDLE: Duration = Duration::from_secs(3 * DEFAULT_HEART.as_secs());
const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortalOptions {
  /// How long a claimed connection has to acknowledge
  pub timeout: Duration,
  /// Interval between heartbeats on parked connections; zero disables them
  pub heart: Duration,
  pub heart_timeout: Duration,
}

impl Default for PortalOptions {
  fn default() -> Self {
    Self {
      timeout: DEFAULT_TIMEOUT,
      heart: DEFAULT_HEART,
      heart_timeout: DEFAULT_HEART_TIMEOUT,
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum PortalError {
  #[error("portal already closed")]
  Closed,
  #[error("portal is already being served")]
  AlreadyServing,
  #[error("no acknowledgement within {0:?}")]
  NoAck(Duration),
  #[error("portal silent for {0:?}")]
  Silent(Duration),
  #[error("unexpected portal byte {0:#04x}")]
  Protocol(u8),
  #[error(transparent)]
  Context(#[from] ContextError),
  #[error(transparent)]
  Io(#[from] IOError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalInfo {
  pub tag: String,
  pub idle: usize,
  pub closed: bool,
}

/// The local half of a portal: owns the agent-facing listener and hands out parked connections
pub struct PortalDialer {
  tag: String,
  options: PortalOptions,
  listener: Mutex<Option<NetListener>>,
  idle: Mutex<VecDeque<WrappedStream>>,
  parked: Notify,
  shutdown: CancellationToken,
  closed: AtomicBool,
}

impl PortalDialer {
  pub fn new(tag: &str, listener: NetListener, options: PortalOptions) -> Self {
    Self {
      tag: tag.to_string(),
      options,
      listener: Mutex::new(Some(listener)),
      idle: Mutex::new(VecDeque::new()),
      parked: Notify::new(),
      shutdown: CancellationToken::new(),
      closed: AtomicBool::new(false),
    }
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn options(&self) -> PortalOptions {
    self.options
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  pub fn idle_count(&self) -> usize {
    self.idle_queue().len()
  }

  pub fn info(&self) -> PortalInfo {
    PortalInfo {
      tag: self.tag.clone(),
      idle: self.idle_count(),
      closed: self.is_closed(),
    }
  }

  fn idle_queue(&self) -> std::sync::MutexGuard<'_, VecDeque<WrappedStream>> {
    self
      .idle
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  fn park(&self, streams: impl IntoIterator<Item = WrappedStream>) {
    if self.is_closed() {
      return;
    }
    self.idle_queue().extend(streams);
    self.parked.notify_waiters();
  }

  /// Accepts agent connections until the portal is closed
  pub async fn serve(self: Arc<Self>) -> Result<(), PortalError> {
    if self.is_closed() {
      return Err(PortalError::Closed);
    }
    let mut listener = self
      .listener
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
      .take()
      .ok_or(PortalError::AlreadyServing)?;
    if !self.options.heart.is_zero() {
      tokio::spawn(self.clone().heartbeat().in_current_span());
    }

    let mut backoff = Backoff::default();
    loop {
      let accepted = tokio::select! {
        biased;
        _ = self.shutdown.cancelled() => break,
        accepted = listener.accept() => accepted,
      };
      match accepted {
        Ok(incoming) => {
          backoff.reset();
          let peer = incoming.peer().to_string();
          let portal = self.clone();
          tokio::spawn(
            async move {
              let ctx = Context::from(portal.shutdown.child_token()).with_timeout(ESTABLISH_TIMEOUT);
              match incoming.establish(&ctx).await {
                Ok(stream) => {
                  tracing::debug!("agent connection parked");
                  portal.park([stream]);
                }
                Err(error) => tracing::debug!(%error, "agent handshake failed"),
              }
            }
            .instrument(tracing::debug_span!("portal_agent", %peer)),
          );
        }
        Err(error) => {
          let delay = backoff.next_delay();
          tracing::warn!(%error, ?delay, "portal accept failed");
          tokio::select! {
            _ = self.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
          }
        }
      }
    }
    tracing::debug!(portal = %self.tag, "portal stopped accepting");
    Ok(())
  }

  async fn heartbeat(self: Arc<Self>) {
    let mut ticker = tokio::time::interval(self.options.heart);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
      tokio::select! {
        biased;
        _ = self.shutdown.cancelled() => return,
        _ = ticker.tick() => {}
      }
      let parked: Vec<WrappedStream> = self.idle_queue().drain(..).collect();
      if parked.is_empty() {
        continue;
      }
      let checked = parked.len();
      let alive: Vec<WrappedStream> =
        futures::future::join_all(parked.into_iter().map(|s| ping(s, self.options.heart_timeout)))
          .await
          .into_iter()
          .flatten()
          .collect();
      tracing::trace!(checked, alive = alive.len(), "portal heartbeat");
      self.park(alive);
    }
  }

  /// Claims a parked connection, waiting for an agent to connect if none is parked
  pub async fn dial(&self, ctx: &Context) -> Result<WrappedStream, PortalError> {
    loop {
      if self.is_closed() {
        return Err(PortalError::Closed);
      }
      let parked = self.parked.notified();
      let candidate = self.idle_queue().pop_front();
      if let Some(mut stream) = candidate {
        match self.claim(&mut stream, ctx).await {
          Ok(()) => return Ok(stream),
          Err(PortalError::Context(e)) => return Err(e.into()),
          Err(error) => {
            tracing::debug!(portal = %self.tag, %error, "parked connection unusable");
            continue;
          }
        }
      }
      tokio::select! {
        biased;
        _ = self.shutdown.cancelled() => return Err(PortalError::Closed),
        e = ctx.done() => return Err(e.into()),
        _ = parked => {}
      }
    }
  }

  async fn claim(&self, stream: &mut WrappedStream, ctx: &Context) -> Result<(), PortalError> {
    let timeout = self.options.timeout;
    let handshake = async {
      stream.write_all(&[SYN]).await?;
      stream.flush().await?;
      match stream.read_u8().await? {
        ACK => Ok(()),
        other => Err(PortalError::Protocol(other)),
      }
    };
    tokio::select! {
      biased;
      e = ctx.done() => Err(e.into()),
      res = tokio::time::timeout(timeout, handshake) => res.unwrap_or(Err(PortalError::NoAck(timeout))),
    }
  }

  /// Stops accepting and drops every parked connection; a second close reports [PortalError::Closed]
  pub fn close(&self) -> Result<(), PortalError> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Err(PortalError::Closed);
    }
    self.shutdown.cancel();
    drop(
      self
        .listener
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take(),
    );
    let parked = std::mem::take(&mut *self.idle_queue());
    tracing::debug!(portal = %self.tag, dropped = parked.len(), "portal closed");
    Ok(())
  }
}

impl DialSource for PortalDialer {
  fn open(&self, ctx: Context) -> BoxFuture<'_, Result<WrappedStream, DialError>> {
    async move {
      self.dial(&ctx).await.map_err(|error| match error {
        PortalError::Context(e) => e.into(),
        other => DialError::Portal(other),
      })
    }
    .boxed()
  }
}

async fn exchange_ping(stream: &mut WrappedStream) -> Result<u8, IOError> {
  stream.write_all(&[PING]).await?;
  stream.flush().await?;
  stream.read_u8().await
}

async fn ping(mut stream: WrappedStream, timeout: Duration) -> Option<WrappedStream> {
  let answer = tokio::time::timeout(timeout, exchange_ping(&mut stream)).await;
  match answer {
    Ok(Ok(PING)) => Some(stream),
    _ => None,
  }
}

/// Agent side: answers heartbeats until the portal claims the connection, then acknowledges
pub async fn await_syn(stream: &mut WrappedStream, idle: Duration) -> Result<(), PortalError> {
  loop {
    let read = tokio::time::timeout(idle, stream.read_u8())
      .await
      .map_err(|_| PortalError::Silent(idle))?;
    let received = match read {
      Ok(byte) => byte,
      Err(error) if error.kind() == ErrorKind::UnexpectedEof => return Err(PortalError::Closed),
      Err(error) => return Err(error.into()),
    };
    match received {
      PING => {
        stream.write_all(&[PING]).await?;
        stream.flush().await?;
      }
      SYN => {
        stream.write_all(&[ACK]).await?;
        stream.flush().await?;
        return Ok(());
      }
      other => return Err(PortalError::Protocol(other)),
    }
  }
}
