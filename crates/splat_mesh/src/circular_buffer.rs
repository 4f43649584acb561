//! Single-producer single-consumer circular byte buffer.
//!
//! Hands out contiguous regions of up to half the capacity so that the
//! producer can fill one region while the consumer drains another. Regions
//! must be released in allocation order; the buffer is safe for exactly one
//! allocating thread racing one freeing thread.
//!
//! When the tail is too close to the end of storage to fit a single element,
//! the remainder is recorded as a skip entry and the allocation wraps to the
//! start. Skips are reclaimed when they reach the front of the release queue.
//!
//! `CircularBuffer` is a cheap handle over shared storage, so it can be
//! cloned into the producing thread while allocations travel to the
//! consumer.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, PartialEq, Eq)]
enum Entry {
  Data { offset: usize, bytes: usize },
  Skip { bytes: usize },
}

struct Inner {
  head: usize,
  tail: usize,
  /// Occupied bytes, including skipped tail fragments.
  used: usize,
  order: VecDeque<Entry>,
}

struct Shared {
  storage: UnsafeCell<Box<[u8]>>,
  inner: Mutex<Inner>,
  space: Condvar,
}

// One producer and one consumer may race allocate() against free(); the
// regions they touch are disjoint by the allocation-order invariant.
unsafe impl Sync for Shared {}

/// Bounded SPSC byte ring for pipelining variable-sized batches.
#[derive(Clone)]
pub struct CircularBuffer {
  shared: Arc<Shared>,
}

/// A contiguous region handed out by [`CircularBuffer::allocate`].
///
/// Holds the buffer alive, so it can cross thread boundaries freely.
/// Dropping the allocation returns the region to the buffer; allocations
/// must be dropped in the order they were obtained.
pub struct Allocation {
  shared: Arc<Shared>,
  offset: usize,
  bytes: usize,
  elements: usize,
}

impl Allocation {
  /// Number of elements granted (at least one, at most the requested max).
  pub fn elements(&self) -> usize {
    self.elements
  }

  pub fn bytes(&self) -> usize {
    self.bytes
  }

  /// Mutable view of the granted bytes.
  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    // Safety: the region [offset, offset + bytes) is reserved for this
    // allocation until it is freed, and no other live allocation overlaps it.
    unsafe {
      let base = (*self.shared.storage.get()).as_mut_ptr();
      std::slice::from_raw_parts_mut(base.add(self.offset), self.bytes)
    }
  }

  /// Read-only view of the granted bytes.
  pub fn as_slice(&self) -> &[u8] {
    // Safety: as above.
    unsafe {
      let base = (*self.shared.storage.get()).as_ptr();
      std::slice::from_raw_parts(base.add(self.offset), self.bytes)
    }
  }
}

impl Drop for Allocation {
  fn drop(&mut self) {
    self.shared.release(self.offset, self.bytes);
  }
}

impl CircularBuffer {
  /// Create a buffer with `size` bytes of storage.
  pub fn new(size: usize) -> Self {
    assert!(size >= 2, "circular buffer needs at least 2 bytes");
    CircularBuffer {
      shared: Arc::new(Shared {
        storage: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
        inner: Mutex::new(Inner {
          head: 0,
          tail: 0,
          used: 0,
          order: VecDeque::new(),
        }),
        space: Condvar::new(),
      }),
    }
  }

  /// Total storage in bytes.
  pub fn size(&self) -> usize {
    self.shared.size()
  }

  /// Allocate up to `max_elements` elements of `element_size` bytes each.
  ///
  /// Blocks until at least one element fits. Grants at most half the buffer
  /// per call. Panics if a single element can never fit.
  pub fn allocate(&self, element_size: usize, max_elements: usize) -> Allocation {
    let cap = self.size();
    assert!(element_size > 0 && max_elements > 0, "empty allocation");
    assert!(
      element_size <= cap / 2,
      "element of {element_size} bytes cannot fit in half of a {cap} byte buffer"
    );
    let cap_elements = (cap / 2) / element_size;

    let mut inner = self.shared.inner.lock().unwrap();
    loop {
      let free = cap - inner.used;
      let end_room = cap - inner.tail;

      if end_room >= element_size {
        let contiguous = end_room.min(free);
        if contiguous >= element_size {
          let n = (contiguous / element_size).min(max_elements).min(cap_elements);
          return self.grant(&mut inner, element_size, n);
        }
      } else if free >= end_room + element_size {
        // Not even one element fits before the end; skip the fragment.
        let contiguous = inner.head.min(free - end_room);
        if contiguous >= element_size {
          inner.order.push_back(Entry::Skip { bytes: end_room });
          inner.used += end_room;
          inner.tail = 0;
          let n = (contiguous / element_size).min(max_elements).min(cap_elements);
          return self.grant(&mut inner, element_size, n);
        }
      }

      inner = self.shared.space.wait(inner).unwrap();
    }
  }

  fn grant(&self, inner: &mut Inner, element_size: usize, n: usize) -> Allocation {
    let offset = inner.tail;
    let bytes = n * element_size;
    inner.tail = (inner.tail + bytes) % self.size();
    inner.used += bytes;
    inner.order.push_back(Entry::Data { offset, bytes });
    Allocation {
      shared: Arc::clone(&self.shared),
      offset,
      bytes,
      elements: n,
    }
  }
}

impl Shared {
  fn size(&self) -> usize {
    // Safety: the length of the storage never changes.
    unsafe { (&*self.storage.get()).len() }
  }

  fn release(&self, offset: usize, bytes: usize) {
    let cap = self.size();
    let mut inner = self.inner.lock().unwrap();

    self.pop_skips(&mut inner, cap);
    match inner.order.pop_front() {
      Some(Entry::Data {
        offset: o,
        bytes: b,
      }) if o == offset && b == bytes => {
        inner.head = (inner.head + bytes) % cap;
        inner.used -= bytes;
      }
      other => panic!("allocations must be freed in allocation order (found {other:?})"),
    }
    self.pop_skips(&mut inner, cap);

    self.space.notify_all();
  }

  fn pop_skips(&self, inner: &mut Inner, cap: usize) {
    while let Some(Entry::Skip { bytes }) = inner.order.front() {
      let skipped = *bytes;
      inner.head = (inner.head + skipped) % cap;
      inner.used -= skipped;
      inner.order.pop_front();
    }
  }
}

#[cfg(test)]
#[path = "circular_buffer_test.rs"]
mod circular_buffer_test;
