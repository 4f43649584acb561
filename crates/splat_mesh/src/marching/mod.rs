//! Marching-tetrahedra isosurface extraction over one tile.
//!
//! The extractor walks the tile one z-slice pair at a time:
//!
//! 1. evaluate the field on the next vertex slice (previous slice kept);
//! 2. classify the cell layer between the two slices and keep the occupied
//!    cells (mixed corner signs, all corners finite);
//! 3. look up per-cell vertex and index counts in the case tables;
//! 4. assign output positions from running offsets carried across slices,
//!    so vertex and index numbering is monotone over the whole tile;
//! 5. emit interpolated edge vertices with stable 64-bit edge keys, then
//!    triangle indices into the tile-wide numbering.
//!
//! A final weld pass collapses vertices generated by neighbouring cells for
//! the same grid edge (equal keys) into one vertex each. Keys encode the
//! edge's anchor cell in *region* coordinates, so the same physical edge gets
//! the same key in every tile that generates it; vertices on the tile
//! boundary are flagged external and welded across tiles by the mesher.

pub mod tables;

pub use tables::{Tables, EDGE_INDICES, NUM_EDGES, NUM_TETRAHEDRA};

use std::collections::HashMap;

use crate::grid::Grid;
use crate::mls::FieldEvaluator;

/// Raw per-tile mesh produced by extraction, before the internal/external
/// partition.
#[derive(Clone, Debug, Default)]
pub struct MeshData {
  pub vertices: Vec<[f32; 3]>,
  /// Stable edge key per vertex.
  pub keys: Vec<u64>,
  /// Whether the vertex lies on the tile boundary.
  pub external: Vec<bool>,
  pub triangles: Vec<[u32; 3]>,
}

impl MeshData {
  pub fn is_empty(&self) -> bool {
    self.triangles.is_empty()
  }
}

/// Bits per axis in an edge key; region dimensions must fit.
const KEY_COORD_BITS: u32 = 19;

/// Key of the grid edge from `a` to `b`, both in region vertex coordinates.
fn edge_key(a: [i64; 3], b: [i64; 3]) -> u64 {
  let anchor = [a[0].min(b[0]), a[1].min(b[1]), a[2].min(b[2])];
  let bits = |p: [i64; 3]| {
    ((p[0] - anchor[0]) + 2 * (p[1] - anchor[1]) + 4 * (p[2] - anchor[2])) as u8
  };
  let code = tables::find_edge(bits(a), bits(b)) as u64;
  let mut key = code;
  for (axis, &coord) in anchor.iter().enumerate() {
    assert!(
      0 <= coord && coord < 1 << KEY_COORD_BITS,
      "region coordinate {coord} exceeds the edge key space"
    );
    key |= (coord as u64) << (5 + KEY_COORD_BITS * axis as u32);
  }
  key
}

/// Marching-tetrahedra extractor. One instance per device worker; the case
/// tables are built once and reused for every tile.
pub struct Marching {
  tables: Tables,
}

impl Marching {
  pub fn new() -> Self {
    Marching {
      tables: Tables::new(),
    }
  }

  /// Extract the isosurface of `field` over the tile at `lower`.
  pub fn extract(&self, field: &dyn FieldEvaluator, grid: &Grid, lower: [u64; 3]) -> MeshData {
    let (width, height) = field.slice_size();
    let depth = field.num_slices();
    assert!(
      width >= 2 && height >= 2 && depth >= 2,
      "invalid argument: a tile needs at least 2 vertices per axis"
    );
    let cells = [width as i64 - 1, height as i64 - 1, depth as i64 - 1];

    let mut below = vec![0.0f32; width * height];
    let mut above = vec![0.0f32; width * height];
    field.evaluate_slice(0, &mut above);

    // Running offsets; carried across slices so output numbering is
    // monotone over the tile.
    let mut vertex_offset = 0u64;
    let mut index_offset = 0u64;
    let mut raw_positions: Vec<[f32; 3]> = Vec::new();
    let mut raw_keys: Vec<u64> = Vec::new();
    let mut raw_external: Vec<bool> = Vec::new();
    let mut raw_indices: Vec<u64> = Vec::new();

    for z in 1..depth {
      std::mem::swap(&mut below, &mut above);
      field.evaluate_slice(z, &mut above);
      let cell_z = z as i64 - 1;

      for cell_y in 0..height - 1 {
        for cell_x in 0..width - 1 {
          let mut values = [0.0f32; 8];
          let mut finite = true;
          let mut mask = 0u8;
          for corner in 0..8 {
            let dx = corner & 1;
            let dy = (corner >> 1) & 1;
            let dz = (corner >> 2) & 1;
            let slice = if dz == 0 { &below } else { &above };
            let value = slice[(cell_y + dy) * width + cell_x + dx];
            finite &= value.is_finite();
            values[corner] = value;
            if value > 0.0 {
              mask |= 1 << corner;
            }
          }
          if !finite || mask == 0 || mask == 255 {
            continue;
          }

          let (num_vertices, num_indices) = self.tables.counts(mask);
          let cell_base = vertex_offset;
          vertex_offset += num_vertices as u64;
          index_offset += num_indices as u64;

          let local = [cell_x as i64, cell_y as i64, cell_z];
          for &edge in self.tables.vertex_edges(mask) {
            let [va, vb] = EDGE_INDICES[edge as usize];
            let pa = corner_coords(local, va);
            let pb = corner_coords(local, vb);
            let da = values[va as usize];
            let db = values[vb as usize];
            let t = da / (da - db);

            let wa = grid.vertex_world(region_coords(lower, pa));
            let wb = grid.vertex_world(region_coords(lower, pb));
            let position = wa + (wb - wa) * t;

            raw_positions.push(position.to_array());
            raw_keys.push(edge_key(region_coords(lower, pa), region_coords(lower, pb)));
            raw_external.push(on_boundary(pa, pb, cells));
          }
          for &index in self.tables.triangle_indices(mask) {
            raw_indices.push(cell_base + index as u64);
          }
        }
      }
    }

    // The generated totals must equal the carried prefix sums.
    assert_eq!(raw_positions.len() as u64, vertex_offset);
    assert_eq!(raw_indices.len() as u64, index_offset);

    weld(raw_positions, raw_keys, raw_external, raw_indices)
  }
}

impl Default for Marching {
  fn default() -> Self {
    Marching::new()
  }
}

#[inline]
fn corner_coords(cell: [i64; 3], corner: u8) -> [i64; 3] {
  [
    cell[0] + (corner & 1) as i64,
    cell[1] + (corner >> 1 & 1) as i64,
    cell[2] + (corner >> 2 & 1) as i64,
  ]
}

#[inline]
fn region_coords(lower: [u64; 3], local: [i64; 3]) -> [i64; 3] {
  [
    lower[0] as i64 + local[0],
    lower[1] as i64 + local[1],
    lower[2] as i64 + local[2],
  ]
}

/// An edge is shared with a neighbouring tile iff it lies inside one of the
/// tile's boundary planes.
fn on_boundary(a: [i64; 3], b: [i64; 3], cells: [i64; 3]) -> bool {
  for axis in 0..3 {
    if a[axis] == b[axis] && (a[axis] == 0 || a[axis] == cells[axis]) {
      return true;
    }
  }
  false
}

/// Collapse equal-key vertices (first occurrence wins) and rebuild the
/// triangle list over the collapsed numbering.
fn weld(
  positions: Vec<[f32; 3]>,
  keys: Vec<u64>,
  external: Vec<bool>,
  indices: Vec<u64>,
) -> MeshData {
  let mut first_by_key: HashMap<u64, u32> = HashMap::with_capacity(keys.len());
  let mut remap: Vec<u32> = Vec::with_capacity(keys.len());
  let mut data = MeshData::default();

  for ((position, key), external) in positions.into_iter().zip(keys).zip(external) {
    match first_by_key.get(&key) {
      Some(&index) => remap.push(index),
      None => {
        let index = data.vertices.len() as u32;
        first_by_key.insert(key, index);
        data.vertices.push(position);
        data.keys.push(key);
        data.external.push(external);
        remap.push(index);
      }
    }
  }

  for triangle in indices.chunks_exact(3) {
    data.triangles.push([
      remap[triangle[0] as usize],
      remap[triangle[1] as usize],
      remap[triangle[2] as usize],
    ]);
  }
  data
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
