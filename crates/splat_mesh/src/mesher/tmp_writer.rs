//! Spill-to-disk worker for the emitting pass.
//!
//! The mesher thread fills pooled [`TmpWriterItem`]s with vertices and
//! triangles plus the element ranges to persist, and hands them to a single
//! writer thread over a bounded channel. The writer appends the selected
//! ranges to two flat temporary files (12 bytes per vertex, 12 per triangle)
//! and recycles the item through the pool, so at most `pool_size` items of
//! mesh data exist at any time.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::error::Result;

/// Bytes per spilled vertex and triangle record.
pub const VERTEX_RECORD: usize = 12;
pub const TRIANGLE_RECORD: usize = 12;

/// One pooled unit of spill data.
#[derive(Debug, Default)]
pub struct TmpWriterItem {
  pub vertices: Vec<[f32; 3]>,
  pub triangles: Vec<[u32; 3]>,
  /// Half-open element ranges of `vertices` to persist, in order.
  pub vertex_ranges: Vec<(usize, usize)>,
  /// Half-open element ranges of `triangles` to persist, in order.
  pub triangle_ranges: Vec<(usize, usize)>,
}

impl TmpWriterItem {
  fn clear(&mut self) {
    self.vertices.clear();
    self.triangles.clear();
    self.vertex_ranges.clear();
    self.triangle_ranges.clear();
  }
}

fn temp_path(kind: &str) -> PathBuf {
  static COUNTER: AtomicU64 = AtomicU64::new(0);
  let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
  std::env::temp_dir().join(format!(
    "splatmesh-{}-{}-{}.tmp",
    std::process::id(),
    unique,
    kind
  ))
}

/// Single-producer single-consumer temp-file writer.
pub struct TmpWriterWorkerGroup {
  pool_rx: Receiver<Box<TmpWriterItem>>,
  pool_tx: Sender<Box<TmpWriterItem>>,
  work_tx: Option<Sender<Box<TmpWriterItem>>>,
  worker: Option<JoinHandle<Result<()>>>,
  vertices_path: Option<PathBuf>,
  triangles_path: Option<PathBuf>,
}

impl TmpWriterWorkerGroup {
  pub fn new(pool_size: usize) -> Self {
    assert!(pool_size > 0, "invalid argument: pool must hold at least one item");
    let (pool_tx, pool_rx) = bounded(pool_size);
    for _ in 0..pool_size {
      pool_tx.send(Box::default()).expect("pool channel sized for the pool");
    }
    TmpWriterWorkerGroup {
      pool_rx,
      pool_tx,
      work_tx: None,
      worker: None,
      vertices_path: None,
      triangles_path: None,
    }
  }

  pub fn running(&self) -> bool {
    self.worker.is_some()
  }

  /// Path of the vertex spill file; empty until `start`.
  pub fn vertices_path(&self) -> Option<&Path> {
    self.vertices_path.as_deref()
  }

  pub fn triangles_path(&self) -> Option<&Path> {
    self.triangles_path.as_deref()
  }

  /// Create the temp files and start the writer thread.
  pub fn start(&mut self) -> Result<()> {
    assert!(!self.running(), "writer group is already running");
    let vertices_path = temp_path("vertices");
    let triangles_path = temp_path("triangles");
    let mut vertices = BufWriter::new(File::create(&vertices_path)?);
    let mut triangles = BufWriter::new(File::create(&triangles_path)?);
    self.vertices_path = Some(vertices_path);
    self.triangles_path = Some(triangles_path);

    let (work_tx, work_rx) = bounded::<Box<TmpWriterItem>>(1);
    self.work_tx = Some(work_tx);
    let pool_tx = self.pool_tx.clone();

    let worker = std::thread::Builder::new()
      .name("tmp-writer".to_string())
      .spawn(move || -> Result<()> {
        for mut item in work_rx.iter() {
          for &(first, last) in &item.vertex_ranges {
            let mut block = Vec::with_capacity((last - first) * VERTEX_RECORD);
            for vertex in &item.vertices[first..last] {
              for v in vertex {
                block.extend_from_slice(&v.to_le_bytes());
              }
            }
            vertices.write_all(&block)?;
          }
          for &(first, last) in &item.triangle_ranges {
            let mut block = Vec::with_capacity((last - first) * TRIANGLE_RECORD);
            for triangle in &item.triangles[first..last] {
              for v in triangle {
                block.extend_from_slice(&v.to_le_bytes());
              }
            }
            triangles.write_all(&block)?;
          }
          item.clear();
          // The producer may have stopped caring; a full pool is fine.
          let _ = pool_tx.try_send(item);
        }
        vertices.flush()?;
        triangles.flush()?;
        Ok(())
      })
      .expect("failed to spawn tmp writer thread");
    self.worker = Some(worker);
    Ok(())
  }

  /// Take a cleared item from the pool; blocks while the writer is behind.
  pub fn get(&self) -> Box<TmpWriterItem> {
    self.pool_rx.recv().expect("tmp writer pool is never closed")
  }

  /// Queue an item for writing.
  pub fn push(&self, item: Box<TmpWriterItem>) {
    self
      .work_tx
      .as_ref()
      .expect("writer group is not running")
      .send(item)
      .expect("tmp writer thread is gone");
  }

  /// Flush everything and join the writer. Files stay on disk.
  pub fn stop(&mut self) -> Result<()> {
    assert!(self.running(), "writer group is not running");
    drop(self.work_tx.take());
    match self.worker.take().unwrap().join() {
      Ok(result) => result,
      Err(panic) => std::panic::resume_unwind(panic),
    }
  }

  /// Delete the temp files, if they exist.
  pub fn remove_files(&mut self) {
    if let Some(path) = self.vertices_path.take() {
      let _ = std::fs::remove_file(path);
    }
    if let Some(path) = self.triangles_path.take() {
      let _ = std::fs::remove_file(path);
    }
  }
}

impl Drop for TmpWriterWorkerGroup {
  fn drop(&mut self) {
    if self.running() {
      let _ = self.stop();
    }
    self.remove_files();
  }
}

/// Reads element ranges back out of a spill file.
pub struct TmpFileReader {
  file: File,
  scratch: Vec<u8>,
}

impl TmpFileReader {
  pub fn open(path: &Path) -> Result<Self> {
    Ok(TmpFileReader {
      file: File::open(path)?,
      scratch: Vec::new(),
    })
  }

  fn read_raw(&mut self, first: u64, count: usize, record: usize) -> Result<()> {
    self.scratch.resize(count * record, 0);
    self.file.seek(SeekFrom::Start(first * record as u64))?;
    self.file.read_exact(&mut self.scratch)?;
    Ok(())
  }

  /// Read `count` vertices starting at element `first`.
  pub fn read_vertices(&mut self, first: u64, count: usize, out: &mut Vec<[f32; 3]>) -> Result<()> {
    self.read_raw(first, count, VERTEX_RECORD)?;
    out.clear();
    for record in self.scratch.chunks_exact(VERTEX_RECORD) {
      let v = |i: usize| f32::from_le_bytes(record[i * 4..i * 4 + 4].try_into().unwrap());
      out.push([v(0), v(1), v(2)]);
    }
    Ok(())
  }

  /// Read `count` triangles starting at element `first`.
  pub fn read_triangles(&mut self, first: u64, count: usize, out: &mut Vec<[u32; 3]>) -> Result<()> {
    self.read_raw(first, count, TRIANGLE_RECORD)?;
    out.clear();
    for record in self.scratch.chunks_exact(TRIANGLE_RECORD) {
      let v = |i: usize| u32::from_le_bytes(record[i * 4..i * 4 + 4].try_into().unwrap());
      out.push([v(0), v(1), v(2)]);
    }
    Ok(())
  }
}

#[cfg(test)]
#[path = "tmp_writer_test.rs"]
mod tmp_writer_test;
