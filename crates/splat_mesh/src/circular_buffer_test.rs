use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use super::*;

#[test]
fn test_grant_limits() {
  let buffer = CircularBuffer::new(64);
  // At most half the buffer may be granted at once.
  let alloc = buffer.allocate(4, 1000);
  assert!(alloc.bytes() <= 32);
  assert_eq!(alloc.bytes(), alloc.elements() * 4);
  assert!(alloc.elements() >= 1);
}

#[test]
fn test_fill_roundtrip() {
  let buffer = CircularBuffer::new(32);
  let mut alloc = buffer.allocate(8, 2);
  assert_eq!(alloc.elements(), 2);
  alloc.as_mut_slice().copy_from_slice(&[7u8; 16]);
  assert_eq!(alloc.as_slice(), &[7u8; 16]);
}

#[test]
fn test_wrap_around() {
  let buffer = CircularBuffer::new(32);
  // Repeated allocate/free cycles must wrap cleanly past the end.
  for round in 0..20 {
    let mut alloc = buffer.allocate(6, 2);
    assert!(alloc.elements() >= 1);
    let fill = round as u8;
    let n = alloc.bytes();
    alloc.as_mut_slice().copy_from_slice(&vec![fill; n]);
    assert!(alloc.as_slice().iter().all(|&b| b == fill));
  }
}

#[test]
fn test_blocks_until_free() {
  let buffer = CircularBuffer::new(16);
  let first = buffer.allocate(8, 1);

  // A second 8-byte allocation cannot fit (half-capacity rule) until the
  // first is freed.
  let (tx, rx) = mpsc::channel();
  let worker = {
    let buffer = buffer.clone();
    thread::spawn(move || {
      let second = buffer.allocate(8, 1);
      tx.send(second.elements()).unwrap();
    })
  };

  assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
  drop(first);
  assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
  worker.join().unwrap();
}

#[test]
fn test_pipelined_producer_consumer() {
  let buffer = CircularBuffer::new(256);
  let (tx, rx) = mpsc::channel();

  let producer = {
    let buffer = buffer.clone();
    thread::spawn(move || {
      let mut next = 0u32;
      while next < 1000 {
        let want = 16.min(1000 - next as usize);
        let mut alloc = buffer.allocate(4, want);
        for chunk in alloc.as_mut_slice().chunks_exact_mut(4) {
          chunk.copy_from_slice(&next.to_le_bytes());
          next += 1;
        }
        tx.send(alloc).unwrap();
      }
    })
  };

  let mut expected = 0u32;
  for alloc in rx.iter() {
    for chunk in alloc.as_slice().chunks_exact(4) {
      assert_eq!(u32::from_le_bytes(chunk.try_into().unwrap()), expected);
      expected += 1;
    }
  }
  assert_eq!(expected, 1000);
  producer.join().unwrap();
}

#[test]
#[should_panic(expected = "allocation order")]
fn test_out_of_order_free_panics() {
  let buffer = CircularBuffer::new(64);
  let first = buffer.allocate(4, 2);
  let second = buffer.allocate(4, 2);
  // Leak the first allocation so its drop cannot fire during unwinding.
  std::mem::forget(first);
  drop(second);
}

#[test]
#[should_panic(expected = "cannot fit")]
fn test_oversized_element_panics() {
  let buffer = CircularBuffer::new(16);
  let _ = buffer.allocate(9, 1);
}
