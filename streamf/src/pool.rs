// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Fixed-size reusable byte buffers for copy loops

use std::ops::{Deref, DerefMut};
use std::sync::Mutex;

/// Buffers smaller than this are not worth pooling; requests below it get [DEFAULT_BUFFER_SIZE]
pub const MIN_BUFFER_SIZE: usize = 4 * 1024;
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;
pub const DEFAULT_CACHE: usize = 128;

/// A bounded free-list of equally sized buffers over the global allocator
///
/// `get` pops a cached buffer or allocates a fresh one; `put` returns a buffer
/// to the free-list unless it is undersized or the list is already full.
#[derive(Debug)]
pub struct BufferPool {
  size: usize,
  cache: usize,
  free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
  pub fn new(size: usize, cache: usize) -> Self {
    let size = if size < MIN_BUFFER_SIZE {
      DEFAULT_BUFFER_SIZE
    } else {
      size
    };
    Self {
      size,
      cache,
      free: Mutex::new(Vec::with_capacity(cache.min(DEFAULT_CACHE))),
    }
  }

  /// Length of every buffer handed out by this pool
  pub fn size(&self) -> usize {
    self.size
  }

  /// Number of buffers currently parked in the free-list
  pub fn cached(&self) -> usize {
    self.lock().len()
  }

  pub fn get(&self) -> Vec<u8> {
    if let Some(buffer) = self.lock().pop() {
      return buffer;
    }
    vec![0u8; self.size]
  }

  pub fn put(&self, mut buffer: Vec<u8>) {
    if buffer.capacity() < self.size {
      return;
    }
    buffer.truncate(self.size);
    buffer.resize(self.size, 0);
    let mut free = self.lock();
    if free.len() < self.cache {
      free.push(buffer);
    }
  }

  /// Leases a buffer that returns itself to the pool when dropped
  pub fn lease(&self) -> PoolBuffer<'_> {
    PoolBuffer {
      pool: self,
      buffer: Some(self.get()),
    }
  }

  fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
    // A panic while holding the lock cannot leave the list inconsistent
    self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

impl Default for BufferPool {
  fn default() -> Self {
    Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_CACHE)
  }
}

/// A buffer on loan from a [BufferPool]
pub struct PoolBuffer<'a> {
  pool: &'a BufferPool,
  buffer: Option<Vec<u8>>,
}

impl Deref for PoolBuffer<'_> {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    self.buffer.as_deref().unwrap_or_default()
  }
}

impl DerefMut for PoolBuffer<'_> {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.buffer.as_deref_mut().unwrap_or_default()
  }
}

impl Drop for PoolBuffer<'_> {
  fn drop(&mut self) {
    if let Some(buffer) = self.buffer.take() {
      self.pool.put(buffer);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::{BufferPool, DEFAULT_BUFFER_SIZE};

  #[test]
  fn undersized_pools_fall_back_to_default() {
    assert_eq!(BufferPool::new(0, 4).size(), DEFAULT_BUFFER_SIZE);
    assert_eq!(BufferPool::new(4095, 4).size(), DEFAULT_BUFFER_SIZE);
    assert_eq!(BufferPool::new(4096, 4).size(), 4096);
    assert_eq!(BufferPool::new(65536, 4).get().len(), 65536);
  }

  #[test]
  fn undersized_buffers_are_discarded() {
    let pool = BufferPool::new(8192, 4);
    pool.put(vec![0u8; 100]);
    assert_eq!(pool.cached(), 0);
    pool.put(vec![0u8; 8192]);
    assert_eq!(pool.cached(), 1);
  }

  #[test]
  fn free_list_is_bounded() {
    let pool = BufferPool::new(4096, 2);
    let buffers: Vec<_> = (0..4).map(|_| pool.get()).collect();
    buffers.into_iter().for_each(|b| pool.put(b));
    assert_eq!(pool.cached(), 2);

    let uncached = BufferPool::new(4096, 0);
    uncached.put(uncached.get());
    assert_eq!(uncached.cached(), 0);
  }

  #[test]
  fn returned_buffers_are_restored_to_full_length() {
    let pool = BufferPool::new(4096, 1);
    let mut buffer = pool.get();
    buffer.truncate(10);
    pool.put(buffer);
    assert_eq!(pool.get().len(), 4096);
  }

  #[test]
  fn leases_return_on_drop() {
    let pool = BufferPool::new(4096, 4);
    {
      let mut lease = pool.lease();
      lease[0] = 7;
      assert_eq!(lease.len(), 4096);
      assert_eq!(pool.cached(), 0);
    }
    assert_eq!(pool.cached(), 1);
  }
}
