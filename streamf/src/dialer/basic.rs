// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use tokio_tungstenite::tungstenite::http::Uri;

use super::{
  format_timeout, parse_network, query_param, Conn, ConnectRace, DialError, Dialer, DialerInfo,
  DialerOptions,
};
use crate::common::{Endpoint, RemoteAddr};
use crate::network::{Network, RawDialer, TlsClient};
use crate::util::Context;

/// Raw stream connections over tcp, unix, pipe or portal networks, optionally over TLS
pub struct BasicDialer {
  remote: RemoteAddr,
  raw: Arc<RawDialer>,
  race: ConnectRace,
}

impl BasicDialer {
  pub fn new(
    network: &Network,
    options: &DialerOptions,
    uri: &Uri,
    secure: bool,
  ) -> Result<Self, DialError> {
    let authority = uri.authority().map(|a| a.as_str()).unwrap_or_default();
    let network_name = options
      .network
      .clone()
      .or_else(|| query_param(uri, "network"));
    let addr = options
      .addr
      .clone()
      .or_else(|| query_param(uri, "addr"))
      .unwrap_or_else(|| authority.to_string());
    let kind = parse_network(network_name.as_deref().unwrap_or("tcp"))?;
    let tls = if secure {
      let server_name = uri.host().unwrap_or(&addr);
      Some(TlsClient::new(server_name, options.allow_insecure, &[])?)
    } else {
      None
    };
    let raw = network.dialer(kind, &addr, tls)?;
    let race = ConnectRace::new(options.timeout, options.retry);
    tracing::info!(
      dialer = %options.tag,
      network = %kind,
      %addr,
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
      raw: Arc::new(raw),
      race,
    })
  }
}

impl Dialer for BasicDialer {
  fn tag(&self) -> &str {
    &self.remote.dialer
  }

  fn connect<'a>(&'a self, ctx: &'a Context) -> BoxFuture<'a, Result<Conn, DialError>> {
    let raw = self.raw.clone();
    let remote = self.remote.clone();
    async move {
      self
        .race
        .connect(ctx, move |ctx| {
          let raw = raw.clone();
          let remote = remote.clone();
          async move {
            let stream = raw.dial(&ctx).await?;
            Ok(Conn {
              remote,
              endpoint: Endpoint::Stream(stream),
            })
          }
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
      message: false,
      timeout: format_timeout(self.race.timeout()),
      retry: self.race.retry(),
      closed: self.race.is_closed(),
      ready: self.raw.is_ready(),
    }
  }
}
