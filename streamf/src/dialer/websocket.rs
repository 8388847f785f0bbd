// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use futures::future::{BoxFuture, FutureExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::http::{HeaderMap, Uri};

use super::{
  format_timeout, parse_network, Conn, ConnectRace, DialError, Dialer, DialerInfo, DialerOptions,
};
use crate::common::{Endpoint, MessageEndpoint, RemoteAddr};
use crate::network::{Network, RawDialer, TlsClient};
use crate::util::Context;

/// Message-framed connections: a WebSocket client handshake over a raw transport
pub struct WebSocketDialer {
  remote: RemoteAddr,
  headers: HeaderMap,
  raw: Arc<RawDialer>,
  race: ConnectRace,
}

impl WebSocketDialer {
  pub fn new(
    network: &Network,
    options: &DialerOptions,
    uri: &Uri,
    secure: bool,
  ) -> Result<Self, DialError> {
    let host = uri
      .host()
      .filter(|host| !host.is_empty())
      .ok_or_else(|| DialError::InvalidUrl(options.url.clone()))?;
    let addr = match options.addr.as_deref() {
      Some(addr) => addr.to_string(),
      None => {
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        format!("{}:{}", host, port)
      }
    };
    let kind = parse_network(options.network.as_deref().unwrap_or("tcp"))?;
    let tls = if secure {
      Some(TlsClient::new(
        host,
        options.allow_insecure,
        &["http/1.1".to_string()],
      )?)
    } else {
      None
    };

    let mut headers = HeaderMap::new();
    for (name, value) in options.headers.iter() {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|_| DialError::InvalidHeader(name.clone()))?;
      let value =
        HeaderValue::from_str(value).map_err(|_| DialError::InvalidHeader(name.to_string()))?;
      headers.append(name, value);
    }
    if let Some(access) = options.access.as_deref().filter(|a| !a.is_empty()) {
      let token = format!("Bearer {}", URL_SAFE_NO_PAD.encode(access));
      let token = HeaderValue::from_str(&token)
        .map_err(|_| DialError::InvalidHeader(AUTHORIZATION.to_string()))?;
      headers.insert(AUTHORIZATION, token);
    }

    let raw = network.dialer(kind, &addr, tls)?;
    let race = ConnectRace::new(options.timeout, options.retry);
    tracing::info!(
      dialer = %options.tag,
      network = %kind,
      addr = %addr,
      url = %options.url,
      timeout = %format_timeout(race.timeout()),
      "new dialer"
    );
    Ok(Self {
      remote: RemoteAddr {
        dialer: options.tag.clone(),
        network: kind.to_string(),
        addr,
        secure,
        url: options.url.clone(),
      },
      headers,
      raw: Arc::new(raw),
      race,
    })
  }

  async fn handshake(
    raw: &RawDialer,
    remote: RemoteAddr,
    headers: HeaderMap,
    ctx: Context,
  ) -> Result<Conn, DialError> {
    let stream = raw.dial(&ctx).await?;
    let mut request = remote.url.as_str().into_client_request()?;
    request.headers_mut().extend(headers);
    let (socket, response) = tokio::select! {
      biased;
      e = ctx.done() => return Err(e.into()),
      res = tokio_tungstenite::client_async(request, stream) => res?,
    };
    tracing::trace!(status = %response.status(), url = %remote.url, "websocket established");
    Ok(Conn {
      remote,
      endpoint: Endpoint::Message(MessageEndpoint::from_websocket(socket)),
    })
  }
}

impl Dialer for WebSocketDialer {
  fn tag(&self) -> &str {
    &self.remote.dialer
  }

  fn connect<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Conn, DialError>> {
    let raw = self.raw.clone();
    let remote = self.remote.clone();
    let headers = self.headers.clone();
    async move {
      self
        .race
        .connect(ctx, move |ctx| {
          let raw = raw.clone();
          let remote = remote.clone();
          let headers = headers.clone();
          async move { Self::handshake(&raw, remote, headers, ctx).await }
        })
        .await
    }
    .boxed()
  }

  fn close(&self) -> Result<(), DialError> {
    self.race.close()?;
    self.raw.close();
    Ok(())
  }

  fn info(&self) -> DialerInfo {
    DialerInfo {
      tag: self.remote.dialer.clone(),
      url: self.remote.url.clone(),
      network: self.remote.network.clone(),
      addr: self.remote.addr.clone(),
      secure: self.remote.secure,
      message: true,
      timeout: format_timeout(self.race.timeout()),
      retry: self.race.retry(),
      closed: self.race.is_closed(),
      ready: self.raw.is_ready(),
    }
  }
}
