//! Per-tile octree over splats.
//!
//! Each splat is entered exactly once, at the shallowest level where its cell
//! footprint spans at most two cells per axis, keyed by the Morton code of
//! the lower cell. A corner query therefore only has to look at the eight
//! cells `(q - d)` for `d` in `{0,1}³` on every level to reach every splat
//! whose bounding box can contain the corner.
//!
//! Levels are indexed by shift: level `s` cells have side `2^s` region
//! cells. The per-level tables store, per occupied Morton code, the run of
//! splat indices assigned to it (the sparse form of the per-code start
//! offset array).

use glam::Vec3;

use crate::grid::Grid;
use crate::types::Splat;

/// Maximum number of levels (tile sides up to 2^(MAX_LEVELS-1) cells).
pub const MAX_LEVELS: u32 = 9;

/// Interleave the 9 low bits of each coordinate, x lowest.
#[inline]
pub fn make_code(x: u32, y: u32, z: u32) -> u32 {
  debug_assert!(x < 512 && y < 512 && z < 512, "coordinates exceed 9 bits");
  let mut code = 0u32;
  for bit in 0..9 {
    code |= ((x >> bit) & 1) << (3 * bit);
    code |= ((y >> bit) & 1) << (3 * bit + 1);
    code |= ((z >> bit) & 1) << (3 * bit + 2);
  }
  code
}

/// Smallest shift at which the inclusive cell range `[lo, hi]` spans at most
/// two cells per axis. Empty ranges (`hi < lo`) report 0.
pub fn level_shift(lo: [i64; 3], hi: [i64; 3]) -> u32 {
  let mut shift = 0;
  while shift < 63 {
    let fits = (0..3).all(|axis| (hi[axis] >> shift) - (lo[axis] >> shift) <= 1);
    if fits {
      break;
    }
    shift += 1;
  }
  shift
}

/// Squared distance from a point to an axis-aligned box; zero inside.
#[inline]
pub fn point_box_dist2(p: Vec3, lo: Vec3, hi: Vec3) -> f32 {
  let d = (lo - p).max(p - hi).max(Vec3::ZERO);
  d.length_squared()
}

struct LevelTable {
  /// Occupied Morton codes, sorted.
  codes: Vec<u32>,
  /// Run boundaries into `order`; run `i` is `starts[i] .. starts[i + 1]`.
  starts: Vec<u32>,
}

impl LevelTable {
  fn run(&self, code: u32) -> Option<(usize, usize)> {
    let i = self.codes.binary_search(&code).ok()?;
    Some((self.starts[i] as usize, self.starts[i + 1] as usize))
  }
}

/// Octree over one tile's splats.
pub struct SplatTree {
  num_levels: u32,
  levels: Vec<LevelTable>,
  /// Splat indices grouped by (level, code).
  order: Vec<u32>,
  /// Highest valid cell coordinate per axis.
  limits: [i64; 3],
}

impl SplatTree {
  /// Build a tree over `splats` for the tile at `lower` with `dims` cells.
  ///
  /// Cell coordinates are tile-local; splat footprints are clamped to the
  /// tile so splats whose support reaches in from neighbouring tiles are
  /// still indexed on the boundary cells they touch.
  pub fn build(splats: &[Splat], grid: &Grid, lower: [u64; 3], dims: [u64; 3]) -> Self {
    let max_dim = dims.iter().copied().max().unwrap_or(1);
    let num_levels = (max_dim.next_power_of_two().trailing_zeros() + 1).min(MAX_LEVELS);
    assert!(
      max_dim <= 1 << (MAX_LEVELS - 1),
      "tile of {max_dim} cells exceeds the {MAX_LEVELS}-level tree"
    );

    let mut keyed: Vec<(u32, u32, u32)> = Vec::with_capacity(splats.len());
    for (index, splat) in splats.iter().enumerate() {
      debug_assert!(splat.is_finite());
      let mut lo = [0i64; 3];
      let mut hi = [0i64; 3];
      for axis in 0..3 {
        let base = grid.extent(axis).0 + lower[axis] as i64;
        let limit = dims[axis] as i64 - 1;
        let lo_cell = grid.world_to_cell(axis, splat.position[axis] - splat.radius) - base;
        let hi_cell = grid.world_to_cell(axis, splat.position[axis] + splat.radius) - base;
        lo[axis] = lo_cell.clamp(0, limit);
        hi[axis] = hi_cell.clamp(0, limit);
      }
      let shift = level_shift(lo, hi).min(num_levels - 1);
      let code = make_code(
        (lo[0] >> shift) as u32,
        (lo[1] >> shift) as u32,
        (lo[2] >> shift) as u32,
      );
      keyed.push((shift, code, index as u32));
    }
    keyed.sort_unstable();

    let mut levels = Vec::with_capacity(num_levels as usize);
    let mut order = Vec::with_capacity(keyed.len());
    let mut cursor = 0;
    for level in 0..num_levels {
      let mut table = LevelTable {
        codes: Vec::new(),
        starts: vec![0],
      };
      while cursor < keyed.len() && keyed[cursor].0 == level {
        let code = keyed[cursor].1;
        table.codes.push(code);
        while cursor < keyed.len() && keyed[cursor].0 == level && keyed[cursor].1 == code {
          order.push(keyed[cursor].2);
          cursor += 1;
        }
        table.starts.push(order.len() as u32);
      }
      levels.push(table);
    }

    SplatTree {
      num_levels,
      levels,
      order,
      limits: [
        dims[0] as i64 - 1,
        dims[1] as i64 - 1,
        dims[2] as i64 - 1,
      ],
    }
  }

  pub fn num_levels(&self) -> u32 {
    self.num_levels
  }

  pub fn num_splats(&self) -> usize {
    self.order.len()
  }

  /// Visit every splat whose bounding box can contain the grid corner at
  /// tile-local coordinates `corner`.
  ///
  /// Walks from the finest level upward; at each level the corner's cell and
  /// its lower neighbours are probed, which covers both cells a stored splat
  /// may span.
  pub fn for_each_near<F>(&self, corner: [i64; 3], mut visit: F)
  where
    F: FnMut(usize),
  {
    // Boundary corners belong to the tile's outermost cells; clamping keeps
    // the probe aligned with the clamped footprints stored at build time.
    let cell = [
      corner[0].clamp(0, self.limits[0]),
      corner[1].clamp(0, self.limits[1]),
      corner[2].clamp(0, self.limits[2]),
    ];
    for shift in 0..self.num_levels {
      let table = &self.levels[shift as usize];
      if table.codes.is_empty() {
        continue;
      }
      let q = [cell[0] >> shift, cell[1] >> shift, cell[2] >> shift];
      for offset in 0..8u8 {
        let c = [
          q[0] - (offset & 1) as i64,
          q[1] - ((offset >> 1) & 1) as i64,
          q[2] - ((offset >> 2) & 1) as i64,
        ];
        if c.iter().any(|&v| v < 0) {
          continue;
        }
        let code = make_code(c[0] as u32, c[1] as u32, c[2] as u32);
        if let Some((start, end)) = table.run(code) {
          for &index in &self.order[start..end] {
            visit(index as usize);
          }
        }
      }
    }
  }
}

#[cfg(test)]
#[path = "splat_tree_test.rs"]
mod splat_tree_test;
