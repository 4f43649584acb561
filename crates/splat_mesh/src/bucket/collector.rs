//! Batches bins for the loader stage.
//!
//! Bins are grouped so that one batch never exceeds the load budget, keeping
//! host staging memory bounded. An oversized single bin still ships alone: it
//! cannot be split once the bucketer has emitted it.

use crate::bucket::Bin;
use crate::error::Result;

/// Groups bins into batches of at most `max_load_splats` splats.
pub struct BucketCollector<F: FnMut(Vec<Bin>) -> Result<()>> {
  bins: Vec<Bin>,
  splats: u64,
  max_load_splats: u64,
  sink: F,
}

impl<F: FnMut(Vec<Bin>) -> Result<()>> BucketCollector<F> {
  pub fn new(max_load_splats: u64, sink: F) -> Self {
    assert!(max_load_splats > 0, "invalid argument: load budget must be positive");
    BucketCollector {
      bins: Vec::new(),
      splats: 0,
      max_load_splats,
      sink,
    }
  }

  /// Add one bin, flushing the current batch first if it would overflow.
  pub fn add(&mut self, bin: Bin) -> Result<()> {
    let n = bin.subset.num_splats();
    if !self.bins.is_empty() && self.splats + n > self.max_load_splats {
      self.flush()?;
    }
    self.splats += n;
    self.bins.push(bin);
    Ok(())
  }

  /// Send the pending batch, if any.
  pub fn flush(&mut self) -> Result<()> {
    if !self.bins.is_empty() {
      self.splats = 0;
      let batch = std::mem::take(&mut self.bins);
      (self.sink)(batch)?;
    }
    Ok(())
  }
}
