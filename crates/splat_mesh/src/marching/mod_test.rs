use std::collections::HashMap;

use glam::Vec3;

use super::*;
use crate::grid::Grid;
use crate::mls::FieldEvaluator;

/// Analytic field over one tile, for driving the extractor directly.
struct AnalyticField {
  grid: Grid,
  lower: [u64; 3],
  dims: [u64; 3],
  f: fn(Vec3) -> f32,
}

impl FieldEvaluator for AnalyticField {
  fn slice_size(&self) -> (usize, usize) {
    (self.dims[0] as usize + 1, self.dims[1] as usize + 1)
  }

  fn num_slices(&self) -> usize {
    self.dims[2] as usize + 1
  }

  fn evaluate_slice(&self, z: usize, out: &mut [f32]) {
    let (width, height) = self.slice_size();
    for y in 0..height {
      for x in 0..width {
        let p = self.grid.vertex_world([
          self.lower[0] as i64 + x as i64,
          self.lower[1] as i64 + y as i64,
          self.lower[2] as i64 + z as i64,
        ]);
        out[y * width + x] = (self.f)(p);
      }
    }
  }
}

fn region_grid() -> Grid {
  Grid::with_extents([0.0, 0.0, 0.0], 1.0, [(0, 8), (0, 8), (0, 8)])
}

fn sphere(p: Vec3) -> f32 {
  p.distance(Vec3::new(4.1, 3.9, 4.05)) - 2.5
}

#[test]
fn test_sphere_is_closed_and_outward() {
  let field = AnalyticField {
    grid: region_grid(),
    lower: [0, 0, 0],
    dims: [8, 8, 8],
    f: sphere,
  };
  let marching = Marching::new();
  let mesh = marching.extract(&field, &region_grid(), [0, 0, 0]);
  assert!(!mesh.is_empty());
  assert!(mesh.external.iter().all(|&e| !e), "sphere must not touch the boundary");

  // Vertices sit near the isosurface.
  let center = Vec3::new(4.1, 3.9, 4.05);
  for v in &mesh.vertices {
    let d = Vec3::from_array(*v).distance(center);
    assert!((d - 2.5).abs() < 0.2, "vertex at distance {d}");
  }

  // Closed, consistently wound surface: every directed edge appears exactly
  // once and its reverse exists.
  let mut directed: HashMap<(u32, u32), u32> = HashMap::new();
  for t in &mesh.triangles {
    for k in 0..3 {
      let a = t[k];
      let b = t[(k + 1) % 3];
      assert_ne!(a, b, "degenerate triangle {t:?}");
      *directed.entry((a, b)).or_insert(0) += 1;
    }
  }
  for (&(a, b), &count) in &directed {
    assert_eq!(count, 1, "edge ({a},{b}) used {count} times");
    assert_eq!(directed.get(&(b, a)), Some(&1), "edge ({a},{b}) has no partner");
  }

  // Euler characteristic of a sphere.
  let vertices = mesh.vertices.len() as i64;
  let edges = directed.len() as i64 / 2;
  let faces = mesh.triangles.len() as i64;
  assert_eq!(vertices - edges + faces, 2);

  // Signed volume is positive (outward winding) and close to the ball's.
  let mut volume = 0.0f64;
  for t in &mesh.triangles {
    let a = Vec3::from_array(mesh.vertices[t[0] as usize]) - center;
    let b = Vec3::from_array(mesh.vertices[t[1] as usize]) - center;
    let c = Vec3::from_array(mesh.vertices[t[2] as usize]) - center;
    volume += a.dot(b.cross(c)) as f64 / 6.0;
  }
  let ball = 4.0 / 3.0 * std::f64::consts::PI * 2.5f64.powi(3);
  assert!(volume > 0.0, "inverted winding: volume {volume}");
  assert!((volume - ball).abs() < 0.15 * ball, "volume {volume} vs {ball}");
}

#[test]
fn test_empty_field_produces_empty_mesh() {
  let grid = region_grid();
  let all_outside = AnalyticField {
    grid: grid.clone(),
    lower: [0, 0, 0],
    dims: [8, 8, 8],
    f: |_| 1.0,
  };
  let marching = Marching::new();
  assert!(marching.extract(&all_outside, &grid, [0, 0, 0]).is_empty());

  let undefined = AnalyticField {
    grid: grid.clone(),
    lower: [0, 0, 0],
    dims: [8, 8, 8],
    f: |_| f32::NAN,
  };
  assert!(marching.extract(&undefined, &grid, [0, 0, 0]).is_empty());
}

/// Two adjacent tiles of one plane: vertices on the shared face carry equal
/// keys and bit-identical positions, so the mesher can weld them.
#[test]
fn test_shared_face_keys_match_across_tiles() {
  let grid = region_grid();
  let plane = |p: Vec3| p.z - 3.7;
  let marching = Marching::new();

  let left = AnalyticField {
    grid: grid.clone(),
    lower: [0, 0, 0],
    dims: [4, 8, 8],
    f: plane,
  };
  let right = AnalyticField {
    grid: grid.clone(),
    lower: [4, 0, 0],
    dims: [4, 8, 8],
    f: plane,
  };
  let mesh_left = marching.extract(&left, &grid, [0, 0, 0]);
  let mesh_right = marching.extract(&right, &grid, [4, 0, 0]);
  assert!(!mesh_left.is_empty() && !mesh_right.is_empty());

  let shared = |mesh: &MeshData, x: f32| {
    let mut by_key: HashMap<u64, [f32; 3]> = HashMap::new();
    for i in 0..mesh.vertices.len() {
      if mesh.external[i] && (mesh.vertices[i][0] - x).abs() < 1e-6 {
        by_key.insert(mesh.keys[i], mesh.vertices[i]);
      }
    }
    by_key
  };
  let left_shared = shared(&mesh_left, 4.0);
  let right_shared = shared(&mesh_right, 4.0);
  assert!(!left_shared.is_empty());
  assert_eq!(left_shared, right_shared);
}
