// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Guards that fire a notification when their owner goes away

/// Something that can be fired exactly once, consuming itself
pub trait DropkickSync {
  fn dropkick(self);
}

/// Fires its content when dropped
#[derive(Debug, Default)]
#[repr(transparent)]
pub struct Dropkick<T: DropkickSync> {
  inner: Option<T>,
}

impl<T: DropkickSync> Dropkick<T> {
  pub fn new(target: T) -> Self {
    Self {
      inner: Some(target),
    }
  }
}

impl<T: DropkickSync> Drop for Dropkick<T> {
  fn drop(&mut self) {
    if let Some(inner) = self.inner.take() {
      inner.dropkick();
    }
  }
}

/// Sends a prepared message to an actor's command queue
impl<T> DropkickSync for (T, tokio::sync::mpsc::UnboundedSender<T>) {
  fn dropkick(self) {
    let (message, sender) = self;
    // The receiver being gone means nobody is left to notify
    let _ = sender.send(message);
  }
}
