// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextError {
  #[error("context canceled")]
  Canceled,
  #[error("context deadline exceeded")]
  DeadlineExceeded,
}

/// A cancellation scope with an optional deadline
///
/// Holders can wait on it and derive narrower scopes from it, but cannot
/// cancel it; only the owner of the underlying [CancellationToken] can.
#[derive(Debug, Clone, Default)]
pub struct Context {
  token: CancellationToken,
  deadline: Option<Instant>,
}

impl Context {
  /// A scope that is never cancelled and never expires
  pub fn background() -> Self {
    Self::default()
  }

  pub fn deadline(&self) -> Option<Instant> {
    self.deadline
  }

  /// Derives a scope cancelled along with this one, expiring after `timeout` at the latest
  ///
  /// An existing earlier deadline is kept.
  pub fn with_timeout(&self, timeout: Duration) -> Self {
    self.with_deadline(Instant::now() + timeout)
  }

  pub fn with_deadline(&self, deadline: Instant) -> Self {
    let deadline = match self.deadline {
      Some(current) if current <= deadline => current,
      _ => deadline,
    };
    Self {
      token: self.token.child_token(),
      deadline: Some(deadline),
    }
  }

  /// A token that is cancelled when this scope is, for handing to owned subtasks
  pub fn child_token(&self) -> CancellationToken {
    self.token.child_token()
  }

  pub fn err(&self) -> Option<ContextError> {
    if self.token.is_cancelled() {
      Some(ContextError::Canceled)
    } else if matches!(self.deadline, Some(deadline) if deadline <= Instant::now()) {
      Some(ContextError::DeadlineExceeded)
    } else {
      None
    }
  }

  pub fn is_done(&self) -> bool {
    self.err().is_some()
  }

  /// Resolves once the scope is cancelled or its deadline passes
  pub async fn done(&self) -> ContextError {
    match self.deadline {
      Some(deadline) => tokio::select! {
        biased;
        _ = self.token.cancelled() => ContextError::Canceled,
        _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
      },
      None => {
        self.token.cancelled().await;
        ContextError::Canceled
      }
    }
  }
}

impl From<CancellationToken> for Context {
  fn from(token: CancellationToken) -> Self {
    Self {
      token,
      deadline: None,
    }
  }
}
