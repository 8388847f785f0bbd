// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt};
use tracing_futures::Instrument;

use super::{default_tag, Listener, ListenerError, ListenerInfo};
use crate::network::{NetListener, Network, Registration};
use crate::portal::{PortalDialer, PortalOptions};

/// Accepts agent connections and publishes them as the `portal:<tag>` address
///
/// Nothing is forwarded here; dialers on the portal network consume the
/// connections agents park with this listener.
pub struct PortalListener {
  tag: String,
  network: String,
  addr: String,
  secure: bool,
  portal: Arc<PortalDialer>,
  registration: Mutex<Option<Registration>>,
}

impl PortalListener {
  pub const MODE: &'static str = "portal";

  /// Registers the portal; `portal_tag` defaults to the listener tag
  pub async fn new(
    network: &Network,
    tag: Option<String>,
    portal_tag: Option<String>,
    listener: NetListener,
    options: PortalOptions,
  ) -> Result<Self, ListenerError> {
    let tag = tag
      .filter(|tag| !tag.is_empty())
      .unwrap_or_else(|| default_tag(Self::MODE, &listener));
    let portal_tag = portal_tag
      .filter(|tag| !tag.is_empty())
      .unwrap_or_else(|| tag.clone());
    let kind = listener.kind().to_string();
    let addr = listener.local_addr();
    let secure = listener.is_secure();
    let (portal, registration) = network.new_portal(&portal_tag, listener, options).await?;
    tracing::info!(listener = %tag, portal = %portal_tag, "new listener");
    Ok(Self {
      tag,
      network: kind,
      addr,
      secure,
      portal,
      registration: Mutex::new(Some(registration)),
    })
  }

  pub fn portal(&self) -> &Arc<PortalDialer> {
    &self.portal
  }
}

impl Listener for PortalListener {
  fn tag(&self) -> &str {
    &self.tag
  }

  fn serve(self: Arc<Self>) -> BoxFuture<'static, Result<(), ListenerError>> {
    let span = tracing::info_span!("listener", tag = %self.tag);
    async move {
      tracing::info!("serving");
      self.portal.clone().serve().await?;
      tracing::info!("stopped");
      Ok(())
    }
    .instrument(span)
    .boxed()
  }

  fn close(&self) -> Result<(), ListenerError> {
    self.portal.close().map_err(|_| ListenerError::Closed)?;
    drop(
      self
        .registration
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take(),
    );
    Ok(())
  }

  fn info(&self) -> ListenerInfo {
    ListenerInfo {
      tag: self.tag.clone(),
      mode: Self::MODE.to_string(),
      network: self.network.clone(),
      addr: self.addr.clone(),
      secure: self.secure,
      dialer: None,
      close: None,
      portal: Some(self.portal.info()),
      closed: self.portal.is_closed(),
    }
  }
}
