// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Registration state for deferred addresses, owned by a single coordinating task

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{NetworkError, NetworkKind};
use crate::common::WrappedStream;
use crate::dialer::DialError;
use crate::util::Context;

/// Produces a fresh transport to a registered endpoint each time it is opened
pub trait DialSource: Send + Sync + 'static {
  fn open(&self, ctx: Context) -> BoxFuture<'_, Result<WrappedStream, DialError>>;
}

pub type Source = Arc<dyn DialSource>;

pub(crate) type Key = (NetworkKind, String);

pub(crate) enum Command {
  Register {
    key: Key,
    source: Source,
    reply: oneshot::Sender<Result<Vec<u64>, NetworkError>>,
  },
  Unregister {
    key: Key,
  },
  Pend {
    id: u64,
    key: Key,
    slot: oneshot::Sender<Source>,
  },
  Forget {
    id: u64,
  },
  Snapshot {
    reply: oneshot::Sender<RegistrySnapshot>,
  },
}

struct Pending {
  id: u64,
  key: Key,
  slot: oneshot::Sender<Source>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
  /// Registered addresses, as `kind:key`, sorted
  pub registered: Vec<String>,
  /// Ids of dials still waiting for a registration, oldest first
  pub pending: Vec<u64>,
}

#[derive(Default)]
pub(crate) struct Registry {
  endpoints: HashMap<Key, Source>,
  pending: VecDeque<Pending>,
}

impl Registry {
  pub(crate) fn handle(&mut self, command: Command) {
    match command {
      Command::Register { key, source, reply } => {
        let _ = reply.send(self.register(key, source));
      }
      Command::Unregister { key } => {
        if self.endpoints.remove(&key).is_some() {
          tracing::debug!(network = %key.0, address = %key.1, "unregistered");
        }
      }
      Command::Pend { id, key, slot } => self.pend(id, key, slot),
      Command::Forget { id } => self.pending.retain(|pending| pending.id != id),
      Command::Snapshot { reply } => {
        let _ = reply.send(self.snapshot());
      }
    }
  }

  /// Binds `key` and fulfils every request waiting on it, oldest first
  ///
  /// Returns the ids of the fulfilled requests in the order they were fulfilled.
  fn register(&mut self, key: Key, source: Source) -> Result<Vec<u64>, NetworkError> {
    if self.endpoints.contains_key(&key) {
      return Err(NetworkError::AddressInUse(key.0, key.1));
    }
    self.endpoints.insert(key.clone(), source.clone());

    let mut fulfilled = Vec::new();
    for pending in std::mem::take(&mut self.pending) {
      if pending.key != key {
        self.pending.push_back(pending);
      } else if pending.slot.send(source.clone()).is_ok() {
        fulfilled.push(pending.id);
      }
    }
    tracing::debug!(
      network = %key.0,
      address = %key.1,
      fulfilled = fulfilled.len(),
      "registered"
    );
    Ok(fulfilled)
  }

  fn pend(&mut self, id: u64, key: Key, slot: oneshot::Sender<Source>) {
    match self.endpoints.get(&key) {
      Some(source) => {
        let _ = slot.send(source.clone());
      }
      None => {
        // Requests whose dialer already went away are pruned as new ones arrive
        self.pending.retain(|pending| !pending.slot.is_closed());
        self.pending.push_back(Pending { id, key, slot });
      }
    }
  }

  fn snapshot(&self) -> RegistrySnapshot {
    let mut registered: Vec<String> = self
      .endpoints
      .keys()
      .map(|(kind, key)| format!("{}:{}", kind, key))
      .collect();
    registered.sort();
    RegistrySnapshot {
      registered,
      pending: self.pending.iter().map(|pending| pending.id).collect(),
    }
  }

  /// Serves commands until shutdown or until every sender is gone
  ///
  /// Pending slots are dropped on exit, which wakes their dialers with a closed error.
  pub(crate) async fn run(
    mut self,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shutdown: CancellationToken,
  ) {
    loop {
      let command = tokio::select! {
        biased;
        _ = shutdown.cancelled() => break,
        command = commands.recv() => command,
      };
      match command {
        Some(command) => self.handle(command),
        None => break,
      }
    }
    tracing::debug!(pending = self.pending.len(), "network registry stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::{Command, DialSource, Registry, Source};
  use crate::common::WrappedStream;
  use crate::dialer::DialError;
  use crate::network::{NetworkError, NetworkKind};
  use crate::util::Context;
  use futures::future::{BoxFuture, FutureExt};
  use std::sync::Arc;
  use tokio::sync::oneshot;

  struct Nowhere;

  impl DialSource for Nowhere {
    fn open(&self, _ctx: Context) -> BoxFuture<'_, Result<WrappedStream, DialError>> {
      async { Err(DialError::Closed) }.boxed()
    }
  }

  fn key(name: &str) -> (NetworkKind, String) {
    (NetworkKind::Pipe, name.to_string())
  }

  fn pend(registry: &mut Registry, id: u64, name: &str) -> oneshot::Receiver<Source> {
    let (slot, ready) = oneshot::channel();
    registry.handle(Command::Pend {
      id,
      key: key(name),
      slot,
    });
    ready
  }

  fn register(registry: &mut Registry, name: &str, source: Source) -> Result<Vec<u64>, NetworkError> {
    let (reply, mut result) = oneshot::channel();
    registry.handle(Command::Register {
      key: key(name),
      source,
      reply,
    });
    result.try_recv().expect("registry replies synchronously")
  }

  #[test]
  fn registration_fulfils_waiters_in_order() {
    let mut registry = Registry::default();
    let mut waiters: Vec<_> = [3, 1, 2]
      .into_iter()
      .map(|id| pend(&mut registry, id, "svc"))
      .collect();
    let mut other = pend(&mut registry, 9, "elsewhere");

    let fulfilled = register(&mut registry, "svc", Arc::new(Nowhere)).unwrap();
    assert_eq!(fulfilled, vec![3, 1, 2]);
    for waiter in waiters.iter_mut() {
      assert!(waiter.try_recv().is_ok());
    }
    assert!(other.try_recv().is_err());
    assert_eq!(registry.snapshot().pending, vec![9]);
  }

  #[test]
  fn duplicate_registration_is_rejected() {
    let mut registry = Registry::default();
    let _waiter = pend(&mut registry, 1, "svc");
    assert_eq!(register(&mut registry, "svc", Arc::new(Nowhere)).unwrap(), vec![1]);

    let mut late = pend(&mut registry, 2, "svc");
    assert!(late.try_recv().is_ok(), "registered keys fulfil immediately");

    match register(&mut registry, "svc", Arc::new(Nowhere)) {
      Err(NetworkError::AddressInUse(NetworkKind::Pipe, address)) => assert_eq!(address, "svc"),
      other => panic!("expected AddressInUse, got {:?}", other),
    }
    assert_eq!(registry.snapshot().registered, vec!["pipe:svc".to_string()]);
  }

  #[test]
  fn forgotten_requests_are_never_fulfilled() {
    let mut registry = Registry::default();
    let mut forgotten = pend(&mut registry, 1, "svc");
    let mut kept = pend(&mut registry, 2, "svc");
    registry.handle(Command::Forget { id: 1 });

    assert_eq!(register(&mut registry, "svc", Arc::new(Nowhere)).unwrap(), vec![2]);
    assert!(forgotten.try_recv().is_err());
    assert!(kept.try_recv().is_ok());
  }

  #[test]
  fn unregistering_frees_the_address() {
    let mut registry = Registry::default();
    register(&mut registry, "svc", Arc::new(Nowhere)).unwrap();
    registry.handle(Command::Unregister { key: key("svc") });
    assert!(registry.snapshot().registered.is_empty());
    register(&mut registry, "svc", Arc::new(Nowhere)).unwrap();
  }
}
