//! World-aligned integer voxel grid.
//!
//! A grid is defined by a world-space `reference` point, a positive cell
//! `spacing`, and half-open per-axis extents `[lo, hi)` measured in cells
//! relative to the reference. Cell `(0,0,0)` of a *region* sits at the lower
//! extent corner; bucket footprints are computed relative to that corner.
//!
//! The grid is computed once from the input bounding box and is immutable
//! afterwards. Once a bucket size has been chosen the lower extents are
//! snapped down so that `lo % bucket_size == 0` on every axis.

use glam::Vec3;

use crate::types::Splat;

/// Integer division rounding towards negative infinity.
#[inline]
pub fn div_down(a: i64, b: i64) -> i64 {
  debug_assert!(b > 0);
  a.div_euclid(b)
}

/// World-aligned voxel lattice.
#[derive(Clone, Debug, PartialEq)]
pub struct Grid {
  reference: [f32; 3],
  spacing: f32,
  extents: [(i64, i64); 3],
}

impl Grid {
  /// Create a grid with empty extents.
  pub fn new(reference: [f32; 3], spacing: f32) -> Self {
    assert!(
      spacing.is_finite() && spacing > 0.0,
      "grid spacing must be positive and finite"
    );
    Grid {
      reference,
      spacing,
      extents: [(0, 0); 3],
    }
  }

  /// Create a grid with explicit extents. Mostly used by tests.
  pub fn with_extents(reference: [f32; 3], spacing: f32, extents: [(i64, i64); 3]) -> Self {
    let mut grid = Grid::new(reference, spacing);
    for (axis, &(lo, hi)) in extents.iter().enumerate() {
      grid.set_extent(axis, lo, hi);
    }
    grid
  }

  pub fn reference(&self) -> [f32; 3] {
    self.reference
  }

  pub fn spacing(&self) -> f32 {
    self.spacing
  }

  /// Set the extent of one axis. `lo` is inclusive, `hi` exclusive.
  pub fn set_extent(&mut self, axis: usize, lo: i64, hi: i64) {
    assert!(lo <= hi, "grid extent must not be inverted");
    self.extents[axis] = (lo, hi);
  }

  pub fn extent(&self, axis: usize) -> (i64, i64) {
    self.extents[axis]
  }

  /// Number of cells along one axis.
  pub fn num_cells(&self, axis: usize) -> u64 {
    let (lo, hi) = self.extents[axis];
    (hi - lo) as u64
  }

  /// Cell counts for all three axes.
  pub fn dims(&self) -> [u64; 3] {
    [self.num_cells(0), self.num_cells(1), self.num_cells(2)]
  }

  /// Number of grid vertices along one axis (cells + 1).
  pub fn num_vertices(&self, axis: usize) -> u64 {
    self.num_cells(axis) + 1
  }

  /// World position of the grid vertex at `coords`, where coords are given
  /// relative to the lower extent corner.
  pub fn vertex_world(&self, coords: [i64; 3]) -> Vec3 {
    Vec3::new(
      self.axis_world(0, coords[0]),
      self.axis_world(1, coords[1]),
      self.axis_world(2, coords[2]),
    )
  }

  /// World coordinate of an extent-relative grid line on one axis.
  #[inline]
  pub fn axis_world(&self, axis: usize, coord: i64) -> f32 {
    self.reference[axis] + self.spacing * (self.extents[axis].0 + coord) as f32
  }

  /// Cell coordinate (relative to the *reference*, not the extents)
  /// containing the world coordinate `w` on one axis.
  #[inline]
  pub fn world_to_cell(&self, axis: usize, w: f32) -> i64 {
    ((w - self.reference[axis]) / self.spacing).floor() as i64
  }
}

/// Compute the inclusive bucket range covered by a splat's bounding box.
///
/// Bucket `x` covers grid cells `[x * bucket_size, (x + 1) * bucket_size)`
/// counted from the grid's lower extent, so bucket `(0,0,0)` overlaps cell
/// `(0,0,0)` of the region.
pub fn splat_to_buckets(splat: &Splat, grid: &Grid, bucket_size: u64) -> ([i64; 3], [i64; 3]) {
  debug_assert!(splat.is_finite());
  assert!(bucket_size > 0, "bucket size must be positive");

  let bs = bucket_size as i64;
  let mut lower = [0i64; 3];
  let mut upper = [0i64; 3];
  for axis in 0..3 {
    let lo_cell = grid.world_to_cell(axis, splat.position[axis] - splat.radius);
    let hi_cell = grid.world_to_cell(axis, splat.position[axis] + splat.radius);
    let base = grid.extent(axis).0;
    lower[axis] = div_down(lo_cell - base, bs);
    upper[axis] = div_down(hi_cell - base, bs);
  }
  (lower, upper)
}
