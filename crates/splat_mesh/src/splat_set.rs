//! Containers for splats supporting lazy, chunked iteration.
//!
//! Splat sets come in two flavours: [`VectorSet`] holds splats in memory,
//! [`FileSet`] serves them from PLY files through a background reader thread
//! and a circular buffer. Both yield only *finite* splats; non-finite records
//! are skipped transparently and reported through statistics.
//!
//! [`FastBlobSet`] wraps either and precomputes *blobs*: maximal runs of
//! consecutive splats whose bounding boxes land in the same bucket interval.
//! Bucketing over blobs instead of raw splats amortises the footprint math
//! across millions of splats. The fast path applies when the query grid is
//! origin-referenced with extents aligned to the internal bucket size and a
//! spacing-compatible bucket multiple; anything else falls back to streaming
//! the splats and recomputing footprints.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Receiver};
use rayon::prelude::*;

use crate::circular_buffer::{Allocation, CircularBuffer};
use crate::error::{Error, Result};
use crate::grid::{div_down, splat_to_buckets, Grid};
use crate::metrics;
use crate::range::Range;
use crate::types::{make_splat_id, Splat, SplatId, SPLAT_ID_MASK};

/// One splat together with its stable ID.
#[derive(Clone, Copy, Debug)]
pub struct StreamSplat {
  pub id: SplatId,
  pub splat: Splat,
}

/// A run of consecutive splat IDs sharing one bucket footprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Blob {
  /// First splat ID in the blob.
  pub first_splat: SplatId,
  /// One past the last splat ID.
  pub last_splat: SplatId,
  /// Inclusive lower bucket bound per axis.
  pub lower: [i64; 3],
  /// Inclusive upper bucket bound per axis.
  pub upper: [i64; 3],
}

/// Pull-based stream of finite splats in ID order.
pub trait SplatStream {
  fn next(&mut self) -> Result<Option<StreamSplat>>;
}

/// Pull-based stream of blobs for one grid / bucket size combination.
pub trait BlobStream {
  fn next(&mut self) -> Result<Option<Blob>>;
}

/// An ordered collection of splats with stable IDs.
pub trait SplatSet {
  /// Upper bound on the number of splats any stream will yield. Tight
  /// enough for memory allocation; includes non-finite records.
  fn max_splats(&self) -> u64;

  /// Stream every finite splat.
  fn splat_stream(&self) -> Box<dyn SplatStream + '_>;

  /// Stream the finite splats of a sorted range list.
  fn splat_stream_ranges(&self, ranges: &[Range]) -> Box<dyn SplatStream + '_>;

  /// Stream blobs for the given grid and bucket size.
  fn blob_stream(&self, grid: &Grid, bucket_size: u64) -> Box<dyn BlobStream + '_>;
}

// =============================================================================
// VectorSet
// =============================================================================

/// Splats stored in a plain vector; IDs are the indices.
#[derive(Clone, Debug, Default)]
pub struct VectorSet {
  splats: Vec<Splat>,
}

impl VectorSet {
  pub fn new(splats: Vec<Splat>) -> Self {
    VectorSet { splats }
  }

  pub fn push(&mut self, splat: Splat) {
    self.splats.push(splat);
  }

  fn full_ranges(&self) -> Vec<Range> {
    full_scan_ranges(0, self.splats.len() as u64)
  }
}

/// Cover `[0, len)` of one scan with as few ranges as the u32 size allows.
fn full_scan_ranges(scan: u32, len: u64) -> Vec<Range> {
  let mut ranges = Vec::new();
  let mut start = 0;
  while start < len {
    let size = (len - start).min(u32::MAX as u64) as u32;
    ranges.push(Range::new(scan, start, size));
    start += size as u64;
  }
  ranges
}

struct VectorSplatStream<'a> {
  splats: &'a [Splat],
  ranges: Vec<Range>,
  range_index: usize,
  cursor: u64,
}

impl<'a> SplatStream for VectorSplatStream<'a> {
  fn next(&mut self) -> Result<Option<StreamSplat>> {
    while self.range_index < self.ranges.len() {
      let range = self.ranges[self.range_index];
      assert_eq!(range.scan, 0, "vector sets have a single scan");
      let end = (range.start + range.size as u64).min(self.splats.len() as u64);
      while self.cursor < end {
        let id = self.cursor;
        self.cursor += 1;
        let splat = self.splats[id as usize];
        if splat.is_finite() {
          return Ok(Some(StreamSplat { id, splat }));
        }
      }
      self.range_index += 1;
      if self.range_index < self.ranges.len() {
        self.cursor = self.ranges[self.range_index].start;
      }
    }
    Ok(None)
  }
}

impl SplatSet for VectorSet {
  fn max_splats(&self) -> u64 {
    self.splats.len() as u64
  }

  fn splat_stream(&self) -> Box<dyn SplatStream + '_> {
    self.splat_stream_ranges(&self.full_ranges())
  }

  fn splat_stream_ranges(&self, ranges: &[Range]) -> Box<dyn SplatStream + '_> {
    let cursor = ranges.first().map_or(0, |r| r.start);
    Box::new(VectorSplatStream {
      splats: &self.splats,
      ranges: ranges.to_vec(),
      range_index: 0,
      cursor,
    })
  }

  fn blob_stream(&self, grid: &Grid, bucket_size: u64) -> Box<dyn BlobStream + '_> {
    Box::new(SimpleBlobStream::new(self.splat_stream(), grid, bucket_size))
  }
}

// =============================================================================
// FileSet
// =============================================================================

/// Bytes of one fixed-size splat record inside the circular buffer.
const SPLAT_RECORD: usize = 8 * 4;
/// Largest batch the reader thread will post at once.
const MAX_BATCH: usize = 64 * 1024;
/// In-flight batches between the reader thread and the stream.
const BATCH_QUEUE: usize = 4;

fn encode_splat(splat: &Splat, out: &mut [u8]) {
  let values = [
    splat.position[0],
    splat.position[1],
    splat.position[2],
    splat.radius,
    splat.normal[0],
    splat.normal[1],
    splat.normal[2],
    splat.quality,
  ];
  for (chunk, v) in out.chunks_exact_mut(4).zip(values) {
    chunk.copy_from_slice(&v.to_le_bytes());
  }
}

fn decode_splat(record: &[u8]) -> Splat {
  let f = |i: usize| f32::from_le_bytes(record[i * 4..i * 4 + 4].try_into().unwrap());
  Splat {
    position: [f(0), f(1), f(2)],
    radius: f(3),
    normal: [f(4), f(5), f(6)],
    quality: f(7),
  }
}

/// Splats stored across one or more PLY files.
///
/// IDs are `(file << SPLAT_ID_BITS) | record`. Streams are fed by a
/// dedicated reader thread which batches file reads through a circular
/// buffer, so consumers overlap parsing with I/O.
pub struct FileSet {
  files: Arc<Vec<crate::ply::PlyReader>>,
  n_splats: u64,
  buffer_bytes: usize,
}

impl FileSet {
  pub fn new() -> Self {
    FileSet::with_buffer_size(128 * 1024 * 1024)
  }

  /// Create a set whose streams use `buffer_bytes` of staging memory each.
  pub fn with_buffer_size(buffer_bytes: usize) -> Self {
    FileSet {
      files: Arc::new(Vec::new()),
      n_splats: 0,
      buffer_bytes: buffer_bytes.max(2 * SPLAT_RECORD),
    }
  }

  /// Append a file. Must not be called while a stream is in progress.
  pub fn add_file(&mut self, reader: crate::ply::PlyReader) {
    assert!(
      reader.len() <= SPLAT_ID_MASK,
      "file exceeds the 40-bit record index space"
    );
    self.n_splats += reader.len();
    Arc::get_mut(&mut self.files)
      .expect("add_file while a stream is in progress")
      .push(reader);
  }

  pub fn num_files(&self) -> usize {
    self.files.len()
  }

  fn full_ranges(&self) -> Vec<Range> {
    let mut ranges = Vec::new();
    for (scan, file) in self.files.iter().enumerate() {
      ranges.extend(full_scan_ranges(scan as u32, file.len()));
    }
    ranges
  }
}

impl Default for FileSet {
  fn default() -> Self {
    FileSet::new()
  }
}

struct Batch {
  first_id: SplatId,
  count: usize,
  alloc: Allocation,
}

struct FileSplatStream {
  rx: Receiver<Result<Batch>>,
  cancel: Arc<AtomicBool>,
  reader: Option<JoinHandle<()>>,
  batch: Option<Batch>,
  index: usize,
}

impl FileSplatStream {
  fn start(files: Arc<Vec<crate::ply::PlyReader>>, ranges: Vec<Range>, buffer_bytes: usize) -> Self {
    let ring = CircularBuffer::new(buffer_bytes);
    let (tx, rx) = bounded(BATCH_QUEUE);
    let cancel = Arc::new(AtomicBool::new(false));

    let thread_cancel = Arc::clone(&cancel);
    let reader = std::thread::Builder::new()
      .name("splat-reader".to_string())
      .spawn(move || {
        let mut handle: Option<(u32, crate::ply::PlyReadHandle)> = None;
        let mut scratch = vec![Splat::from_file_record([0.0; 3], [0.0; 3], 1.0); MAX_BATCH];
        for range in ranges {
          let scan = range.scan;
          if scan as usize >= files.len() {
            continue;
          }
          let file_len = files[scan as usize].len();
          let mut start = range.start.min(file_len);
          let end = (range.start + range.size as u64).min(file_len);
          while start < end {
            if thread_cancel.load(Ordering::Relaxed) {
              return;
            }
            if handle.as_ref().map(|(id, _)| *id) != Some(scan) {
              match files[scan as usize].create_handle() {
                Ok(h) => handle = Some((scan, h)),
                Err(err) => {
                  let _ = tx.send(Err(err));
                  return;
                }
              }
            }
            let want = ((end - start) as usize).min(MAX_BATCH);
            let mut alloc = ring.allocate(SPLAT_RECORD, want);
            let n = alloc.elements();
            if let Err(err) = handle.as_mut().unwrap().1.read(start, &mut scratch[..n]) {
              let _ = tx.send(Err(err));
              return;
            }
            for (splat, record) in scratch[..n]
              .iter()
              .zip(alloc.as_mut_slice().chunks_exact_mut(SPLAT_RECORD))
            {
              encode_splat(splat, record);
            }
            let batch = Batch {
              first_id: make_splat_id(scan, start),
              count: n,
              alloc,
            };
            if tx.send(Ok(batch)).is_err() {
              return;
            }
            start += n as u64;
          }
        }
      })
      .expect("failed to spawn splat reader thread");

    FileSplatStream {
      rx,
      cancel,
      reader: Some(reader),
      batch: None,
      index: 0,
    }
  }
}

impl SplatStream for FileSplatStream {
  fn next(&mut self) -> Result<Option<StreamSplat>> {
    loop {
      if let Some(batch) = &self.batch {
        while self.index < batch.count {
          let record = &batch.alloc.as_slice()[self.index * SPLAT_RECORD..][..SPLAT_RECORD];
          let id = batch.first_id + self.index as u64;
          self.index += 1;
          let splat = decode_splat(record);
          if splat.is_finite() {
            return Ok(Some(StreamSplat { id, splat }));
          }
        }
        // Batches are freed strictly in arrival order.
        self.batch = None;
      }
      match self.rx.recv() {
        Ok(Ok(batch)) => {
          self.batch = Some(batch);
          self.index = 0;
        }
        Ok(Err(err)) => return Err(err),
        Err(_) => return Ok(None),
      }
    }
  }
}

impl Drop for FileSplatStream {
  fn drop(&mut self) {
    self.cancel.store(true, Ordering::Relaxed);
    self.batch = None;
    // Drain in arrival order so ring regions are released in
    // allocation order, then join the reader.
    while self.rx.recv().is_ok() {}
    if let Some(reader) = self.reader.take() {
      let _ = reader.join();
    }
  }
}

impl SplatSet for FileSet {
  fn max_splats(&self) -> u64 {
    self.n_splats
  }

  fn splat_stream(&self) -> Box<dyn SplatStream + '_> {
    self.splat_stream_ranges(&self.full_ranges())
  }

  fn splat_stream_ranges(&self, ranges: &[Range]) -> Box<dyn SplatStream + '_> {
    Box::new(FileSplatStream::start(
      Arc::clone(&self.files),
      ranges.to_vec(),
      self.buffer_bytes,
    ))
  }

  fn blob_stream(&self, grid: &Grid, bucket_size: u64) -> Box<dyn BlobStream + '_> {
    Box::new(SimpleBlobStream::new(self.splat_stream(), grid, bucket_size))
  }
}

// =============================================================================
// Blob streams
// =============================================================================

/// Fallback blob stream: one blob per splat, footprints recomputed.
pub struct SimpleBlobStream<'a> {
  stream: Box<dyn SplatStream + 'a>,
  grid: Grid,
  bucket_size: u64,
}

impl<'a> SimpleBlobStream<'a> {
  pub fn new(stream: Box<dyn SplatStream + 'a>, grid: &Grid, bucket_size: u64) -> Self {
    assert!(bucket_size > 0, "bucket size must be positive");
    SimpleBlobStream {
      stream,
      grid: grid.clone(),
      bucket_size,
    }
  }
}

impl<'a> BlobStream for SimpleBlobStream<'a> {
  fn next(&mut self) -> Result<Option<Blob>> {
    match self.stream.next()? {
      Some(StreamSplat { id, splat }) => {
        let (lower, upper) = splat_to_buckets(&splat, &self.grid, self.bucket_size);
        Ok(Some(Blob {
          first_splat: id,
          last_splat: id + 1,
          lower,
          upper,
        }))
      }
      None => Ok(None),
    }
  }
}

struct FastBlobStream<'a> {
  blobs: std::slice::Iter<'a, Blob>,
  /// Offset of the query grid from the blob grid, in internal buckets.
  offset: [i64; 3],
  /// Query bucket size over the internal bucket size.
  ratio: i64,
}

impl<'a> BlobStream for FastBlobStream<'a> {
  fn next(&mut self) -> Result<Option<Blob>> {
    Ok(self.blobs.next().map(|blob| {
      let rebase = |v: [i64; 3], offset: &[i64; 3], ratio: i64| {
        [
          div_down(v[0] - offset[0], ratio),
          div_down(v[1] - offset[1], ratio),
          div_down(v[2] - offset[2], ratio),
        ]
      };
      Blob {
        first_splat: blob.first_splat,
        last_splat: blob.last_splat,
        lower: rebase(blob.lower, &self.offset, self.ratio),
        upper: rebase(blob.upper, &self.offset, self.ratio),
      }
    }))
  }
}

// =============================================================================
// FastBlobSet
// =============================================================================

/// Partial world-space bounding box, merged across rayon workers.
#[derive(Clone, Copy)]
struct Bbox {
  min: [f32; 3],
  max: [f32; 3],
}

impl Bbox {
  fn empty() -> Self {
    Bbox {
      min: [f32::INFINITY; 3],
      max: [f32::NEG_INFINITY; 3],
    }
  }

  fn add_splat(mut self, splat: &Splat) -> Self {
    for axis in 0..3 {
      self.min[axis] = self.min[axis].min(splat.position[axis] - splat.radius);
      self.max[axis] = self.max[axis].max(splat.position[axis] + splat.radius);
    }
    self
  }

  fn merge(mut self, other: Bbox) -> Self {
    for axis in 0..3 {
      self.min[axis] = self.min[axis].min(other.min[axis]);
      self.max[axis] = self.max[axis].max(other.max[axis]);
    }
    self
  }

  fn is_empty(&self) -> bool {
    self.min[0] > self.max[0]
  }
}

/// Number of splats processed per blob-computation batch.
const BLOB_BATCH: usize = 1 << 20;

/// Splat set with a precomputed blob index and bounding grid.
pub struct FastBlobSet<B: SplatSet> {
  base: B,
  internal_bucket_size: u64,
  bounding_grid: Grid,
  blobs: Vec<Blob>,
  n_splats: u64,
}

impl<B: SplatSet> FastBlobSet<B> {
  pub fn new(base: B) -> Self {
    FastBlobSet {
      base,
      internal_bucket_size: 0,
      bounding_grid: Grid::new([0.0; 3], 1.0),
      blobs: Vec::new(),
      n_splats: 0,
    }
  }

  pub fn base(&self) -> &B {
    &self.base
  }

  /// Build the blob index and bounding grid in a single streaming pass.
  ///
  /// The grid is referenced at the world origin with the given spacing; its
  /// lower extents are snapped down to a multiple of `bucket_size` so blob
  /// data stays aligned for every compatible query grid.
  pub fn compute_blobs(
    &mut self,
    spacing: f32,
    bucket_size: u64,
    progress: Option<&indicatif::ProgressBar>,
  ) -> Result<()> {
    assert!(bucket_size > 0, "bucket size must be positive");

    self.blobs.clear();
    self.internal_bucket_size = bucket_size;
    self.bounding_grid = Grid::new([0.0; 3], spacing);
    self.n_splats = 0;

    let mut bbox = Bbox::empty();
    let mut buffer: Vec<StreamSplat> = Vec::with_capacity(BLOB_BATCH);
    let mut stream = self.base.splat_stream();

    loop {
      buffer.clear();
      while buffer.len() < BLOB_BATCH {
        match stream.next()? {
          Some(splat) => buffer.push(splat),
          None => break,
        }
      }
      if buffer.is_empty() {
        break;
      }

      let grid = &self.bounding_grid;
      let footprints: Vec<([i64; 3], [i64; 3])> = buffer
        .par_iter()
        .map(|s| splat_to_buckets(&s.splat, grid, bucket_size))
        .collect();
      bbox = bbox.merge(
        buffer
          .par_iter()
          .fold(Bbox::empty, |acc, s| acc.add_splat(&s.splat))
          .reduce(Bbox::empty, Bbox::merge),
      );

      for (s, (lower, upper)) in buffer.iter().zip(footprints) {
        match self.blobs.last_mut() {
          Some(last)
            if last.lower == lower && last.upper == upper && last.last_splat == s.id =>
          {
            last.last_splat += 1;
          }
          _ => self.blobs.push(Blob {
            first_splat: s.id,
            last_splat: s.id + 1,
            lower,
            upper,
          }),
        }
      }

      self.n_splats += buffer.len() as u64;
      if let Some(progress) = progress {
        progress.inc(buffer.len() as u64);
      }
    }
    drop(stream);

    let non_finite = self.base.max_splats() - self.n_splats;
    if non_finite > 0 {
      log::warn!("Input contains {non_finite} splat(s) with non-finite values");
      if let Some(progress) = progress {
        progress.inc(non_finite);
      }
    }
    metrics::global().add_counter("blobset.nonfinite", non_finite);
    metrics::global().add_sample("blobset.blobs", self.blobs.len() as f64);

    if bbox.is_empty() {
      return Err(Error::InvalidInput("must be at least one splat".to_string()));
    }

    for axis in 0..3 {
      let lo = (bbox.min[axis] / spacing).floor() as i64;
      let hi = (bbox.max[axis] / spacing).ceil() as i64;
      // Snap the lower extent down so blob data aligns to bucket boundaries.
      let lo = div_down(lo, bucket_size as i64) * bucket_size as i64;
      self.bounding_grid.set_extent(axis, lo, hi.max(lo + 1));
    }
    Ok(())
  }

  /// Bounding grid computed by [`Self::compute_blobs`].
  pub fn bounding_grid(&self) -> &Grid {
    assert!(self.internal_bucket_size > 0, "compute_blobs has not been called");
    &self.bounding_grid
  }

  /// Exact number of finite splats.
  pub fn num_splats(&self) -> u64 {
    assert!(self.internal_bucket_size > 0, "compute_blobs has not been called");
    self.n_splats
  }

  fn fast_path(&self, grid: &Grid, bucket_size: u64) -> bool {
    assert!(self.internal_bucket_size > 0, "compute_blobs has not been called");
    assert!(bucket_size > 0, "bucket size must be positive");
    if bucket_size % self.internal_bucket_size != 0 {
      return false;
    }
    if grid.spacing() != self.bounding_grid.spacing() {
      return false;
    }
    for axis in 0..3 {
      if grid.reference()[axis] != 0.0
        || grid.extent(axis).0 % self.internal_bucket_size as i64 != 0
      {
        return false;
      }
    }
    true
  }
}

impl<B: SplatSet> SplatSet for FastBlobSet<B> {
  fn max_splats(&self) -> u64 {
    self.num_splats()
  }

  fn splat_stream(&self) -> Box<dyn SplatStream + '_> {
    self.base.splat_stream()
  }

  fn splat_stream_ranges(&self, ranges: &[Range]) -> Box<dyn SplatStream + '_> {
    self.base.splat_stream_ranges(ranges)
  }

  fn blob_stream(&self, grid: &Grid, bucket_size: u64) -> Box<dyn BlobStream + '_> {
    if self.fast_path(grid, bucket_size) {
      let internal = self.internal_bucket_size as i64;
      Box::new(FastBlobStream {
        blobs: self.blobs.iter(),
        offset: [
          grid.extent(0).0 / internal,
          grid.extent(1).0 / internal,
          grid.extent(2).0 / internal,
        ],
        ratio: (bucket_size / self.internal_bucket_size) as i64,
      })
    } else {
      self.base.blob_stream(grid, bucket_size)
    }
  }
}

// =============================================================================
// Subset
// =============================================================================

/// A subset of another set, stored as sorted splat ID ranges.
#[derive(Clone, Debug, Default)]
pub struct Subset {
  ranges: Vec<Range>,
  n_splats: u64,
}

impl Subset {
  pub fn empty() -> Self {
    Subset::default()
  }

  /// Add a blob. Blobs must arrive in increasing splat ID order.
  pub fn add_blob(&mut self, blob: &Blob) {
    let (scan, mut start) = crate::types::split_splat_id(blob.first_splat);
    let (end_scan, end) = crate::types::split_splat_id(blob.last_splat - 1);
    assert_eq!(scan, end_scan, "blob spans two scans");
    let end = end + 1;
    self.n_splats += end - start;
    while start < end {
      let size = (end - start).min(u32::MAX as u64) as u32;
      match self.ranges.last_mut() {
        Some(last)
          if last.scan == scan
            && last.start + last.size as u64 == start
            && last.size as u64 + size as u64 <= u32::MAX as u64 =>
        {
          last.size += size;
        }
        _ => self.ranges.push(Range::new(scan, start, size)),
      }
      start += size as u64;
    }
  }

  pub fn num_splats(&self) -> u64 {
    self.n_splats
  }

  pub fn num_ranges(&self) -> usize {
    self.ranges.len()
  }

  pub fn ranges(&self) -> &[Range] {
    &self.ranges
  }

  /// Stream this subset's splats out of its superset.
  pub fn splat_stream<'a>(&'a self, set: &'a dyn SplatSet) -> Box<dyn SplatStream + 'a> {
    set.splat_stream_ranges(&self.ranges)
  }

  /// Stream this subset's blobs out of its superset.
  pub fn blob_stream<'a>(
    &'a self,
    set: &'a dyn SplatSet,
    grid: &Grid,
    bucket_size: u64,
  ) -> Box<dyn BlobStream + 'a> {
    Box::new(SimpleBlobStream::new(
      self.splat_stream(set),
      grid,
      bucket_size,
    ))
  }
}

#[cfg(test)]
#[path = "splat_set_test.rs"]
mod splat_set_test;
