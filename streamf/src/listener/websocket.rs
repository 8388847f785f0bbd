// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tracing_futures::Instrument;

use super::{default_tag, Acceptor, Forwarder, Listener, ListenerError, ListenerInfo, HANDSHAKE_TIMEOUT};
use crate::common::{Endpoint, MessageEndpoint};
use crate::network::{Incoming, NetListener};
use crate::util::Context;

/// Accepts WebSocket upgrades on any path and forwards the message-framed connection
pub struct WebSocketListener {
  tag: String,
  acceptor: Acceptor,
  forwarder: Forwarder,
}

impl WebSocketListener {
  pub const MODE: &'static str = "websocket";

  pub fn new(tag: Option<String>, listener: NetListener, forwarder: Forwarder) -> Self {
    let tag = tag
      .filter(|tag| !tag.is_empty())
      .unwrap_or_else(|| default_tag(Self::MODE, &listener));
    tracing::info!(listener = %tag, dialer = forwarder.dialer().tag(), "new listener");
    Self {
      tag,
      acceptor: Acceptor::new(listener),
      forwarder,
    }
  }

  async fn session(self: Arc<Self>, incoming: Incoming, ctx: Context) {
    let handshake = ctx.with_timeout(HANDSHAKE_TIMEOUT);
    let stream = match incoming.establish(&handshake).await {
      Ok(stream) => stream,
      Err(error) => {
        tracing::debug!(%error, "tls accept failed");
        return;
      }
    };
    let socket = tokio::select! {
      biased;
      e = handshake.done() => {
        tracing::debug!(reason = %e, "websocket upgrade abandoned");
        return;
      }
      upgraded = tokio_tungstenite::accept_async(stream) => match upgraded {
        Ok(socket) => socket,
        Err(error) => {
          tracing::debug!(%error, "websocket upgrade failed");
          return;
        }
      },
    };
    let inbound = Endpoint::Message(MessageEndpoint::from_websocket(socket));
    self.forwarder.forward(inbound, &ctx).await;
  }
}

impl Listener for WebSocketListener {
  fn tag(&self) -> &str {
    &self.tag
  }

  fn serve(self: Arc<Self>) -> BoxFuture<'static, Result<(), ListenerError>> {
    let span = tracing::info_span!("listener", tag = %self.tag);
    async move {
      let this = self.clone();
      self
        .acceptor
        .serve(|incoming, ctx| this.clone().session(incoming, ctx))
        .await
    }
    .instrument(span)
    .boxed()
  }

  fn close(&self) -> Result<(), ListenerError> {
    self.acceptor.close()
  }

  fn info(&self) -> ListenerInfo {
    self.acceptor.info(&self.tag, Self::MODE, &self.forwarder)
  }
}
