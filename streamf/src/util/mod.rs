// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

pub mod cancellation;
pub mod dropkick;

pub use cancellation::{Context, ContextError};

const BACKOFF_START: Duration = Duration::from_millis(5);
const BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Doubling delay used between failed accepts or reconnects, capped at one second
#[derive(Debug, Clone, Default)]
pub struct Backoff {
  current: Option<Duration>,
}

impl Backoff {
  pub fn next_delay(&mut self) -> Duration {
    let delay = match self.current {
      None => BACKOFF_START,
      Some(previous) => (previous * 2).min(BACKOFF_MAX),
    };
    self.current = Some(delay);
    delay
  }

  pub fn reset(&mut self) {
    self.current = None;
  }
}
