//! Bounded work queues and the cooperative stop token.
//!
//! Every stage boundary in the pipeline is a [`WorkQueue`]: producers block
//! when the queue holds more than its byte budget, consumers block when it is
//! empty. All blocking operations observe a shared [`StopToken`]; a stopped
//! producer fails fast while a stopped consumer drains what is already queued
//! and then sees end-of-stream, so downstream stages shut down in forward
//! order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};

/// Cooperative cancellation flag shared by all pipeline workers.
#[derive(Clone, Default)]
pub struct StopToken {
  flag: Arc<AtomicBool>,
}

impl StopToken {
  pub fn new() -> Self {
    StopToken::default()
  }

  pub fn stop(&self) {
    self.flag.store(true, Ordering::SeqCst);
  }

  pub fn is_stopped(&self) -> bool {
    self.flag.load(Ordering::SeqCst)
  }

  /// Return `Err(Cancelled)` if the token has been tripped.
  pub fn check(&self) -> Result<()> {
    if self.is_stopped() {
      Err(Error::Cancelled)
    } else {
      Ok(())
    }
  }
}

struct QueueInner<T> {
  items: VecDeque<(T, usize)>,
  used_bytes: usize,
  closed: bool,
}

/// Bounded multi-producer queue with a byte budget.
pub struct WorkQueue<T> {
  inner: Mutex<QueueInner<T>>,
  not_empty: Condvar,
  not_full: Condvar,
  budget_bytes: usize,
  stop: StopToken,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

impl<T> WorkQueue<T> {
  /// Create a queue that blocks producers once `budget_bytes` are queued.
  /// At least one item is always admitted, so oversized items make progress.
  pub fn new(budget_bytes: usize, stop: StopToken) -> Self {
    WorkQueue {
      inner: Mutex::new(QueueInner {
        items: VecDeque::new(),
        used_bytes: 0,
        closed: false,
      }),
      not_empty: Condvar::new(),
      not_full: Condvar::new(),
      budget_bytes,
      stop,
    }
  }

  /// Push an item accounting for `bytes` of memory. Blocks while the queue
  /// is over budget; fails with `Cancelled` when the stop token trips.
  pub fn push(&self, item: T, bytes: usize) -> Result<()> {
    let mut inner = self.inner.lock().unwrap();
    loop {
      self.stop.check()?;
      assert!(!inner.closed, "push into a closed work queue");
      if inner.items.is_empty() || inner.used_bytes + bytes <= self.budget_bytes {
        inner.items.push_back((item, bytes));
        inner.used_bytes += bytes;
        self.not_empty.notify_one();
        return Ok(());
      }
      let (guard, _) = self.not_full.wait_timeout(inner, POLL_INTERVAL).unwrap();
      inner = guard;
    }
  }

  /// Pop the next item. Blocks while the queue is empty and open; returns
  /// `None` at end-of-stream. A stopped consumer still drains queued items
  /// so that producers blocked upstream are released.
  pub fn pop(&self) -> Option<T> {
    let mut inner = self.inner.lock().unwrap();
    loop {
      if let Some((item, bytes)) = inner.items.pop_front() {
        inner.used_bytes -= bytes;
        self.not_full.notify_all();
        return Some(item);
      }
      if inner.closed || self.stop.is_stopped() {
        return None;
      }
      let (guard, _) = self.not_empty.wait_timeout(inner, POLL_INTERVAL).unwrap();
      inner = guard;
    }
  }

  /// Mark end-of-stream. Consumers drain the remaining items and then see
  /// `None`.
  pub fn close(&self) {
    let mut inner = self.inner.lock().unwrap();
    inner.closed = true;
    self.not_empty.notify_all();
  }

  /// Remove and drop everything currently queued (used when unwinding a
  /// failed stage so blocked producers are released).
  pub fn drain(&self) {
    let mut inner = self.inner.lock().unwrap();
    inner.items.clear();
    inner.used_bytes = 0;
    self.not_full.notify_all();
  }

  pub fn len(&self) -> usize {
    self.inner.lock().unwrap().items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
