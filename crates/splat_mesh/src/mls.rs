//! Corner density evaluation.
//!
//! [`FieldEvaluator`] is the seam between the isosurface extractor and
//! whatever produces corner densities; the extractor only ever asks for one
//! z-slice of values at a time. [`MlsField`] is the built-in evaluator: a
//! quality-weighted moving-least-squares distance along the splat normals,
//! served by the per-tile [`SplatTree`]. Corners with no splat support
//! evaluate to NaN, which the extractor treats as empty space.

use glam::Vec3;
use rayon::prelude::*;

use crate::grid::Grid;
use crate::splat_tree::{point_box_dist2, SplatTree};
use crate::types::Splat;

/// Produces the scalar field on tile vertex slices. Positive values lie in
/// front of the surface (along the splat normals), negative behind it.
pub trait FieldEvaluator: Sync {
  /// Vertex counts of the tile, x and y.
  fn slice_size(&self) -> (usize, usize);

  /// Number of vertex slices (z).
  fn num_slices(&self) -> usize;

  /// Fill `out` (row-major, x fastest) with the field on vertex slice `z`.
  fn evaluate_slice(&self, z: usize, out: &mut [f32]);
}

/// Weighted MLS field over one tile's splats.
pub struct MlsField<'a> {
  tree: &'a SplatTree,
  splats: &'a [Splat],
  grid: &'a Grid,
  lower: [u64; 3],
  dims: [u64; 3],
}

impl<'a> MlsField<'a> {
  pub fn new(
    tree: &'a SplatTree,
    splats: &'a [Splat],
    grid: &'a Grid,
    lower: [u64; 3],
    dims: [u64; 3],
  ) -> Self {
    MlsField {
      tree,
      splats,
      grid,
      lower,
      dims,
    }
  }

  /// Field value at one tile-local vertex.
  fn corner(&self, x: i64, y: i64, z: i64) -> f32 {
    let p = self.grid.vertex_world([
      self.lower[0] as i64 + x,
      self.lower[1] as i64 + y,
      self.lower[2] as i64 + z,
    ]);

    let mut weight_sum = 0.0f32;
    let mut value_sum = 0.0f32;
    self.tree.for_each_near([x, y, z], |index| {
      let splat = &self.splats[index];
      let center = Vec3::from_array(splat.position);
      let r2 = splat.radius * splat.radius;
      // Cheap reject against the bounding box before the exact support test.
      if point_box_dist2(p, center - splat.radius, center + splat.radius) >= r2 {
        return;
      }
      let d2 = p.distance_squared(center);
      if d2 < r2 {
        // Compactly supported quartic falloff, scaled by sample confidence.
        let u = 1.0 - d2 / r2;
        let weight = splat.quality * u * u;
        weight_sum += weight;
        value_sum += weight * (p - center).dot(Vec3::from_array(splat.normal));
      }
    });

    if weight_sum > 0.0 {
      value_sum / weight_sum
    } else {
      f32::NAN
    }
  }
}

impl<'a> FieldEvaluator for MlsField<'a> {
  fn slice_size(&self) -> (usize, usize) {
    (self.dims[0] as usize + 1, self.dims[1] as usize + 1)
  }

  fn num_slices(&self) -> usize {
    self.dims[2] as usize + 1
  }

  fn evaluate_slice(&self, z: usize, out: &mut [f32]) {
    let (width, height) = self.slice_size();
    assert_eq!(out.len(), width * height);
    out
      .par_chunks_mut(width)
      .enumerate()
      .for_each(|(y, row)| {
        assert!(y < height);
        for (x, value) in row.iter_mut().enumerate() {
          *value = self.corner(x as i64, y as i64, z as i64);
        }
      });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// A flat patch of upward-facing splats: the field must be positive
  /// above, negative below, and NaN far away.
  #[test]
  fn test_plane_field_signs() {
    let grid = Grid::with_extents([0.0, 0.0, 0.0], 1.0, [(0, 8), (0, 8), (0, 8)]);
    let mut splats = Vec::new();
    for x in 0..8 {
      for y in 0..8 {
        splats.push(Splat::from_file_record(
          [x as f32 + 0.5, y as f32 + 0.5, 4.0],
          [0.0, 0.0, 1.0],
          1.5,
        ));
      }
    }
    let tree = SplatTree::build(&splats, &grid, [0, 0, 0], [8, 8, 8]);
    let field = MlsField::new(&tree, &splats, &grid, [0, 0, 0], [8, 8, 8]);

    let (width, height) = field.slice_size();
    let mut above = vec![0.0; width * height];
    let mut below = vec![0.0; width * height];
    let mut far = vec![0.0; width * height];
    field.evaluate_slice(5, &mut above);
    field.evaluate_slice(3, &mut below);
    field.evaluate_slice(8, &mut far);

    let center = 4 * width + 4;
    assert!(above[center] > 0.0);
    assert!(below[center] < 0.0);
    assert!(far[center].is_nan());
  }
}
