// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wires a [Config] into running dialers, listeners and bridge agents

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;

use crate::agent::{AgentInfo, BridgeAgent};
use crate::config::{BridgeConfig, Config, ConnectDialer, ListenerConfig};
use crate::dialer::{new_dialer, DialError, Dialer, DialerInfo};
use crate::listener::{
  BasicListener, Forwarder, Listener, ListenerError, ListenerInfo, PortalListener, WebSocketListener,
};
use crate::network::{Network, NetworkError, NetworkKind, RegistrySnapshot};
use crate::pool::BufferPool;

#[derive(thiserror::Error, Debug)]
pub enum AppError {
  #[error("dialer tag repeated: {0:?}")]
  DuplicateDialer(String),
  #[error("dialer not found: {0:?}")]
  UnknownDialer(String),
  #[error("listener mode not supported: {0:?}")]
  UnsupportedMode(String),
  #[error("dialer {tag:?}: {source}")]
  Dialer {
    tag: String,
    #[source]
    source: DialError,
  },
  #[error("listener {addr:?}: {source}")]
  Bind {
    addr: String,
    #[source]
    source: NetworkError,
  },
  #[error(transparent)]
  Listener(#[from] ListenerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolInfo {
  pub size: usize,
  pub cached: usize,
}

/// A point-in-time view of everything the application runs
#[derive(Debug, Clone, Serialize)]
pub struct AppInfo {
  pub pool: PoolInfo,
  pub dialers: Vec<DialerInfo>,
  pub listeners: Vec<ListenerInfo>,
  pub bridges: Vec<AgentInfo>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub network: Option<RegistrySnapshot>,
}

pub struct Application {
  network: Network,
  pool: Arc<BufferPool>,
  dialers: Vec<Arc<dyn Dialer>>,
  by_tag: HashMap<String, Arc<dyn Dialer>>,
  listeners: Vec<Arc<dyn Listener>>,
  agents: Vec<Arc<BridgeAgent>>,
  closed: AtomicBool,
}

impl Application {
  /// Builds everything `config` describes; on failure, whatever was already built is closed
  pub async fn new(config: &Config) -> Result<Self, AppError> {
    let mut app = Self {
      network: Network::new(),
      pool: Arc::new(BufferPool::new(config.pool.size, config.pool.cache)),
      dialers: Vec::with_capacity(config.dialer.len()),
      by_tag: HashMap::with_capacity(config.dialer.len()),
      listeners: Vec::with_capacity(config.listener.len()),
      agents: Vec::with_capacity(config.bridge.len()),
      closed: AtomicBool::new(false),
    };
    match app.build(config).await {
      Ok(()) => Ok(app),
      Err(error) => {
        tracing::error!(%error, "application setup failed");
        app.close();
        Err(error)
      }
    }
  }

  async fn build(&mut self, config: &Config) -> Result<(), AppError> {
    for options in config.dialer.iter().map(|dialer| dialer.options()) {
      if self.by_tag.contains_key(&options.tag) {
        return Err(AppError::DuplicateDialer(options.tag));
      }
      let dialer = new_dialer(&self.network, &options).map_err(|source| AppError::Dialer {
        tag: options.tag.clone(),
        source,
      })?;
      self.by_tag.insert(options.tag.clone(), dialer.clone());
      self.dialers.push(dialer);
    }
    for listener in config.listener.iter() {
      let listener = self.build_listener(listener).await?;
      self.listeners.push(listener);
    }
    for bridge in config.bridge.iter() {
      let agent = self.build_agent(bridge)?;
      self.agents.push(Arc::new(agent));
    }
    Ok(())
  }

  fn forwarder(&self, target: &ConnectDialer) -> Result<Forwarder, AppError> {
    let dialer = self
      .by_tag
      .get(&target.tag)
      .ok_or_else(|| AppError::UnknownDialer(target.tag.clone()))?;
    Ok(Forwarder::new(
      dialer.clone(),
      self.pool.clone(),
      target.close_grace(),
    ))
  }

  async fn build_listener(&self, config: &ListenerConfig) -> Result<Arc<dyn Listener>, AppError> {
    let mode = if config.mode.is_empty() {
      BasicListener::MODE
    } else {
      config.mode.as_str()
    };
    let forwarder = match mode {
      BasicListener::MODE | WebSocketListener::MODE => Some(self.forwarder(&config.dialer)?),
      PortalListener::MODE => None,
      other => return Err(AppError::UnsupportedMode(other.to_string())),
    };

    let bind_error = |source| AppError::Bind {
      addr: config.addr.clone(),
      source,
    };
    let kind = if config.network.is_empty() {
      NetworkKind::Tcp
    } else {
      config.network.parse::<NetworkKind>().map_err(bind_error)?
    };
    let addr = bind_address(kind, &config.addr);
    let bound = match config.tls.server_config().map_err(bind_error)? {
      Some(tls) => self.network.listen_tls(kind, &addr, Some(tls)).await,
      None => self.network.listen(kind, &addr).await,
    }
    .map_err(bind_error)?;

    let tag = (!config.tag.is_empty()).then(|| config.tag.clone());
    let listener: Arc<dyn Listener> = match forwarder {
      Some(forwarder) if mode == WebSocketListener::MODE => {
        Arc::new(WebSocketListener::new(tag, bound, forwarder))
      }
      Some(forwarder) => Arc::new(BasicListener::new(tag, bound, forwarder)),
      None => {
        let portal_tag = (!config.portal.tag.is_empty()).then(|| config.portal.tag.clone());
        Arc::new(
          PortalListener::new(&self.network, tag, portal_tag, bound, config.portal.options()).await?,
        )
      }
    };
    Ok(listener)
  }

  fn build_agent(&self, config: &BridgeConfig) -> Result<BridgeAgent, AppError> {
    let forwarder = self.forwarder(&config.dialer)?;
    BridgeAgent::new(&self.network, &config.options(), forwarder).map_err(|source| {
      AppError::Dialer {
        tag: config.dialer.tag.clone(),
        source,
      }
    })
  }

  pub fn network(&self) -> &Network {
    &self.network
  }

  pub fn dialer(&self, tag: &str) -> Option<&Arc<dyn Dialer>> {
    self.by_tag.get(tag)
  }

  pub fn listeners(&self) -> &[Arc<dyn Listener>] {
    &self.listeners
  }

  /// Runs every listener and bridge agent until they stop, normally through [Application::close]
  #[tracing::instrument(skip_all, fields(listeners = self.listeners.len(), bridges = self.agents.len()))]
  pub async fn serve(&self) {
    let listeners = self.listeners.iter().map(|listener| {
      let tag = listener.tag().to_string();
      listener
        .clone()
        .serve()
        .map(move |result| (tag, result))
        .boxed()
    });
    let agents = self.agents.iter().map(|agent| {
      let tag = agent.tag().to_string();
      let agent = agent.clone();
      async move { (tag, agent.serve().await) }.boxed()
    });
    let served: Vec<BoxFuture<'static, (String, Result<(), ListenerError>)>> =
      listeners.chain(agents).collect();
    for (tag, result) in join_all(served).await {
      if let Err(error) = result {
        tracing::error!(%tag, %error, "stopped with error");
      }
    }
  }

  /// Closes listeners, agents, dialers and then the network; later calls do nothing
  pub fn close(&self) {
    if self.closed.swap(true, Ordering::AcqRel) {
      return;
    }
    for listener in self.listeners.iter() {
      if let Err(error) = listener.close() {
        tracing::debug!(listener = listener.tag(), %error, "close failed");
      }
    }
    for agent in self.agents.iter() {
      if let Err(error) = agent.close() {
        tracing::debug!(bridge = agent.tag(), %error, "close failed");
      }
    }
    for dialer in self.dialers.iter() {
      if let Err(error) = dialer.close() {
        tracing::debug!(dialer = dialer.tag(), %error, "close failed");
      }
    }
    self.network.close();
    tracing::info!("application closed");
  }

  pub async fn info(&self) -> AppInfo {
    AppInfo {
      pool: PoolInfo {
        size: self.pool.size(),
        cached: self.pool.cached(),
      },
      dialers: self.dialers.iter().map(|dialer| dialer.info()).collect(),
      listeners: self.listeners.iter().map(|listener| listener.info()).collect(),
      bridges: self.agents.iter().map(|agent| agent.info()).collect(),
      network: self.network.snapshot().await.ok(),
    }
  }
}

/// `:port` binds every interface, as it does for most network tools
fn bind_address(kind: NetworkKind, addr: &str) -> String {
  match kind {
    NetworkKind::Tcp if addr.starts_with(':') => format!("0.0.0.0{}", addr),
    _ => addr.to_string(),
  }
}
