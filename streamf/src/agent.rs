// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The remote side of a portal: keeps a connection parked with a remote portal
//! and forwards every claimed connection to a local dialer

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::{Endpoint, WrappedStream};
use crate::dialer::{format_timeout, parse_network, query_param, DialError};
use crate::listener::{Forwarder, ListenerError};
use crate::network::{Network, RawDialer, TlsClient};
use crate::portal;
use crate::util::{Backoff, Context};

/// Upper bound on reaching the remote portal, TLS included
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default)]
pub struct AgentOptions {
  pub tag: Option<String>,
  /// `basic://` or `basic+tls://` address of the remote portal listener
  pub url: String,
  pub network: Option<String>,
  pub addr: Option<String>,
  pub allow_insecure: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentInfo {
  pub tag: String,
  pub url: String,
  pub network: String,
  pub addr: String,
  pub secure: bool,
  pub dialer: String,
  pub close: String,
  /// Claimed connections currently being forwarded
  pub sessions: usize,
  pub closed: bool,
}

pub struct BridgeAgent {
  tag: String,
  url: String,
  raw: RawDialer,
  forwarder: Forwarder,
  shutdown: CancellationToken,
  closed: AtomicBool,
  serving: AtomicBool,
  sessions: Arc<AtomicUsize>,
}

impl BridgeAgent {
  pub fn new(network: &Network, options: &AgentOptions, forwarder: Forwarder) -> Result<Self, DialError> {
    let uri: Uri = options
      .url
      .parse()
      .map_err(|_| DialError::InvalidUrl(options.url.clone()))?;
    let secure = match uri.scheme_str() {
      Some("basic") => false,
      Some("basic+tls") => true,
      _ => return Err(DialError::UnsupportedScheme(options.url.clone())),
    };
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
    let network_name = options
      .network
      .clone()
      .or_else(|| query_param(&uri, "network"));
    let kind = parse_network(network_name.as_deref().unwrap_or("tcp"))?;
    let addr = options
      .addr
      .clone()
      .or_else(|| query_param(&uri, "addr"))
      .unwrap_or_else(|| authority.to_string());
    let tls = if secure {
      let server_name = uri.host().unwrap_or(&addr);
      Some(TlsClient::new(server_name, options.allow_insecure, &[])?)
    } else {
      None
    };
    let tag = options
      .tag
      .clone()
      .filter(|tag| !tag.is_empty())
      .unwrap_or_else(|| {
        let tls = if secure { "+tls" } else { "" };
        format!("basic {}{}://{}", kind, tls, addr)
      });
    let raw = network.dialer(kind, &addr, tls)?;
    tracing::info!(
      bridge = %tag,
      dialer = forwarder.dialer().tag(),
      network = %kind,
      %addr,
      url = %options.url,
      "new bridge"
    );
    Ok(Self {
      tag,
      url: options.url.clone(),
      raw,
      forwarder,
      shutdown: CancellationToken::new(),
      closed: AtomicBool::new(false),
      serving: AtomicBool::new(false),
      sessions: Arc::new(AtomicUsize::new(0)),
    })
  }

  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::Acquire)
  }

  /// Keeps one connection parked with the portal until closed
  pub async fn serve(self: Arc<Self>) -> Result<(), ListenerError> {
    if self.is_closed() {
      return Err(ListenerError::Closed);
    }
    if self.serving.swap(true, Ordering::AcqRel) {
      return Err(ListenerError::AlreadyServing);
    }
    let span = tracing::info_span!("bridge", tag = %self.tag);
    async move {
      tracing::info!("serving");
      let mut backoff = Backoff::default();
      loop {
        let parked = tokio::select! {
          biased;
          _ = self.shutdown.cancelled() => break,
          parked = self.park() => parked,
        };
        match parked {
          Ok(stream) => {
            backoff.reset();
            self.spawn_session(stream);
          }
          Err(error) => {
            let delay = backoff.next_delay();
            tracing::warn!(%error, ?delay, "portal connection failed");
            tokio::select! {
              _ = self.shutdown.cancelled() => break,
              _ = tokio::time::sleep(delay) => {}
            }
          }
        }
      }
      tracing::info!("stopped");
      Ok(())
    }
    .instrument(span)
    .await
  }

  /// Connects to the portal and waits, answering heartbeats, until the connection is claimed
  ///
  /// A portal silent for [portal::DEFAULT_PARK_IDLE] fails the park, and serving parks anew.
  async fn park(&self) -> Result<WrappedStream, ListenerError> {
    let ctx = Context::from(self.shutdown.child_token()).with_timeout(CONNECT_TIMEOUT);
    let mut stream = self.raw.dial(&ctx).await?;
    tracing::debug!("parked with portal");
    portal::await_syn(&mut stream, portal::DEFAULT_PARK_IDLE).await?;
    Ok(stream)
  }

  fn spawn_session(&self, stream: WrappedStream) {
    let forwarder = self.forwarder.clone();
    let ctx = Context::from(self.shutdown.child_token());
    let sessions = self.sessions.clone();
    sessions.fetch_add(1, Ordering::AcqRel);
    tokio::spawn(
      async move {
        forwarder.forward(Endpoint::Stream(stream), &ctx).await;
        sessions.fetch_sub(1, Ordering::AcqRel);
      }
      .in_current_span(),
    );
  }

  /// Stops parking and ends live sessions; a second close reports [ListenerError::Closed]
  pub fn close(&self) -> Result<(), ListenerError> {
    if self.closed.swap(true, Ordering::AcqRel) {
      return Err(ListenerError::Closed);
    }
    self.shutdown.cancel();
    self.raw.close();
    Ok(())
  }

  pub fn info(&self) -> AgentInfo {
    AgentInfo {
      tag: self.tag.clone(),
      url: self.url.clone(),
      network: self.raw.kind().to_string(),
      addr: self.raw.address().to_string(),
      secure: self.raw.is_secure(),
      dialer: self.forwarder.dialer().tag().to_string(),
      close: format_timeout(Some(self.forwarder.close_grace())),
      sessions: self.sessions.load(Ordering::Acquire),
      closed: self.is_closed(),
    }
  }
}
