//! Recursive tile decomposition.
//!
//! The bucketer walks the implicit octree over the grid region, carrying for
//! each cell the subset of splats whose bucket footprint touches it. A cell
//! becomes a leaf *bin* once its splat count fits the device budget and its
//! side fits both the tile cap and the chunk size; otherwise it is split into
//! its eight children (visited in the fixed Morton order of
//! [`cell::for_each_cell`]) and the subset is distributed over them in one
//! pass. A splat whose support straddles a split line lands in every child it
//! touches, so tiles can mesh their boundaries independently.

pub mod cell;
pub mod collector;

pub use cell::{for_each_cell, Cell};
pub use collector::BucketCollector;

use smallvec::SmallVec;

use crate::error::Result;
use crate::grid::Grid;
use crate::splat_set::{SplatSet, Subset};
use crate::types::{ChunkId, Splat};

/// One leaf tile plus the ranges covering its splats.
#[derive(Clone, Debug)]
pub struct Bin {
  /// Lower corner of the tile in region cells.
  pub lower: [u64; 3],
  /// Tile size in cells, clipped to the region.
  pub dims: [u64; 3],
  /// Output file this tile contributes to.
  pub chunk_id: ChunkId,
  /// Splats whose footprint touches the tile.
  pub subset: Subset,
}

/// Decomposition parameters.
#[derive(Clone, Debug)]
pub struct BucketParams {
  /// Splat budget per tile.
  pub max_splats: u64,
  /// Maximum tile side in cells. Power of two.
  pub max_cell_side: u64,
  /// Chunk size in cells (power of two), or 0 for a single output file.
  pub chunk_cells: u64,
  /// Bucket granularity for footprint queries. Use the blob set's internal
  /// bucket size to stay on its fast path.
  pub bucket_size: u64,
}

/// Whether a splat's bounding box overlaps a cell of the grid region.
pub fn splat_cell_intersect(splat: &Splat, cell: &Cell, grid: &Grid) -> bool {
  let (lower, upper) = cell.corners();
  let cell_min = grid.vertex_world([lower[0] as i64, lower[1] as i64, lower[2] as i64]);
  let cell_max = grid.vertex_world([upper[0] as i64, upper[1] as i64, upper[2] as i64]);
  for axis in 0..3 {
    if splat.position[axis] + splat.radius < cell_min[axis]
      || splat.position[axis] - splat.radius > cell_max[axis]
    {
      return false;
    }
  }
  true
}

/// Recursively decompose the grid region into bins and feed them to `sink`
/// in traversal order.
pub fn bucket(
  set: &dyn SplatSet,
  grid: &Grid,
  params: &BucketParams,
  sink: &mut dyn FnMut(Bin) -> Result<()>,
) -> Result<()> {
  assert!(
    params.max_cell_side > 0 && params.max_cell_side.is_power_of_two(),
    "invalid argument: max cell side must be a positive power of two"
  );
  assert!(
    params.chunk_cells == 0 || params.chunk_cells.is_power_of_two(),
    "invalid argument: chunk size must be a power of two"
  );
  assert!(params.bucket_size > 0, "invalid argument: bucket size must be positive");
  assert!(params.max_splats > 0, "invalid argument: splat budget must be positive");

  let dims = grid.dims();
  if dims.iter().any(|&d| d == 0) {
    return Ok(());
  }

  let leaf_side = match params.chunk_cells {
    0 => params.max_cell_side,
    chunk_cells => params.max_cell_side.min(chunk_cells),
  };

  let max_dim = dims.iter().copied().max().unwrap();
  let root_level = max_dim.next_power_of_two().trailing_zeros();
  let root = Cell::new(0, 0, 0, root_level);

  let mut state = BucketState {
    set,
    grid,
    params,
    dims,
    leaf_side,
    chunk_gens: std::collections::HashMap::new(),
    next_gen: 0,
  };
  state.recurse(&root, None, set.max_splats(), sink)
}

struct BucketState<'a> {
  set: &'a dyn SplatSet,
  grid: &'a Grid,
  params: &'a BucketParams,
  dims: [u64; 3],
  leaf_side: u64,
  /// Chunk coordinates already seen, with their assigned generation.
  chunk_gens: std::collections::HashMap<[u32; 3], u32>,
  next_gen: u32,
}

impl<'a> BucketState<'a> {
  fn recurse(
    &mut self,
    cell: &Cell,
    subset: Option<&Subset>,
    num_splats: u64,
    sink: &mut dyn FnMut(Bin) -> Result<()>,
  ) -> Result<()> {
    if num_splats == 0 {
      return Ok(());
    }
    if cell.level() == 0
      || (num_splats <= self.params.max_splats && cell.side() <= self.leaf_side)
    {
      return self.emit(cell, subset, sink);
    }

    // Distribute the subset over the children in a single blob pass.
    let mut children: SmallVec<[(Cell, Subset); 8]> = SmallVec::new();
    for octant in 0..8u8 {
      let child = cell.child(octant);
      let base = child.base();
      if base[0] >= self.dims[0] || base[1] >= self.dims[1] || base[2] >= self.dims[2] {
        continue;
      }
      children.push((child, Subset::empty()));
    }

    let bucket_size = self.params.bucket_size;
    {
      let mut blobs = match subset {
        Some(subset) => subset.blob_stream(self.set, self.grid, bucket_size),
        None => self.set.blob_stream(self.grid, bucket_size),
      };
      while let Some(blob) = blobs.next()? {
        for (child, child_subset) in children.iter_mut() {
          if blob_intersects_cell(&blob.lower, &blob.upper, child, bucket_size) {
            child_subset.add_blob(&blob);
          }
        }
      }
    }

    for (child, child_subset) in children {
      let count = child_subset.num_splats();
      self.recurse(&child, Some(&child_subset), count, sink)?;
    }
    Ok(())
  }

  fn emit(
    &mut self,
    cell: &Cell,
    subset: Option<&Subset>,
    sink: &mut dyn FnMut(Bin) -> Result<()>,
  ) -> Result<()> {
    let subset = match subset {
      Some(subset) => subset.clone(),
      // A region small enough to be a single tile: materialise the full set.
      None => {
        let mut all = Subset::empty();
        let mut blobs = self.set.blob_stream(self.grid, self.params.bucket_size);
        while let Some(blob) = blobs.next()? {
          all.add_blob(&blob);
        }
        all
      }
    };
    if subset.num_splats() == 0 {
      return Ok(());
    }

    let (lower, upper) = cell.corners();
    let dims = [
      upper[0].min(self.dims[0]) - lower[0],
      upper[1].min(self.dims[1]) - lower[1],
      upper[2].min(self.dims[2]) - lower[2],
    ];
    let coords = match self.params.chunk_cells {
      0 => [0, 0, 0],
      chunk_cells => [
        (lower[0] / chunk_cells) as u32,
        (lower[1] / chunk_cells) as u32,
        (lower[2] / chunk_cells) as u32,
      ],
    };
    let gen = match self.chunk_gens.get(&coords) {
      Some(&gen) => gen,
      None => {
        let gen = self.next_gen;
        self.next_gen += 1;
        self.chunk_gens.insert(coords, gen);
        gen
      }
    };

    sink(Bin {
      lower,
      dims,
      chunk_id: ChunkId::new(gen, coords),
      subset,
    })
  }
}

/// Overlap test between a blob's inclusive bucket range and a cell, both in
/// region coordinates.
fn blob_intersects_cell(lower: &[i64; 3], upper: &[i64; 3], cell: &Cell, bucket_size: u64) -> bool {
  let (cell_lo, cell_hi) = cell.corners();
  for axis in 0..3 {
    let lo_bucket = (cell_lo[axis] / bucket_size) as i64;
    let hi_bucket = ((cell_hi[axis] - 1) / bucket_size) as i64;
    if upper[axis] < lo_bucket || lower[axis] > hi_bucket {
      return false;
    }
  }
  true
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
