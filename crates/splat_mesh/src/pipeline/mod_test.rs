use std::collections::HashSet;

use glam::Vec3;

use super::*;
use crate::mesher::PASS_COUNT;
use crate::ply::writer::{MemoryOutput, MemoryPlyWriter};
use crate::splat_set::{FastBlobSet, VectorSet};

const SPHERE_CENTER: Vec3 = Vec3::new(4.9, 5.1, 5.0);
const SPHERE_RADIUS: f32 = 3.0;

/// Splats sampled on a sphere (Fibonacci spiral), normals outward.
fn sphere_splats(samples: usize) -> Vec<Splat> {
  let golden = std::f32::consts::PI * (3.0 - 5.0f32.sqrt());
  let mut splats = Vec::with_capacity(samples);
  for i in 0..samples {
    let y = 1.0 - 2.0 * (i as f32 + 0.5) / samples as f32;
    let ring = (1.0 - y * y).sqrt();
    let theta = golden * i as f32;
    let normal = Vec3::new(theta.cos() * ring, y, theta.sin() * ring);
    let position = SPHERE_CENTER + normal * SPHERE_RADIUS;
    splats.push(Splat::from_file_record(position.to_array(), normal.to_array(), 0.9));
  }
  splats
}

fn blob_set(splats: Vec<Splat>) -> FastBlobSet<VectorSet> {
  let mut set = FastBlobSet::new(VectorSet::new(splats));
  set.compute_blobs(0.5, 4, None).unwrap();
  set
}

fn small_params() -> PipelineParams {
  PipelineParams {
    spacing: 0.5,
    bucket_size: 4,
    // Small budgets force a real multi-tile decomposition.
    max_device_splats: 120,
    max_cell_side: 8,
    chunk_cells: 0,
    max_load_splats: 400,
    mem_mesh: 1 << 20,
    mem_gather: 1 << 20,
    devices: 3,
    loaders: 2,
    prune: 0.0,
    quiet: true,
    checkpoint: None,
  }
}

fn run_once(params: &PipelineParams) -> (MemoryOutput, PipelineStats) {
  let set = blob_set(sphere_splats(500));
  let grid = set.bounding_grid().clone();
  let mut mesher = OocMesher::new();
  let mut writer = MemoryPlyWriter::new();
  let namer = Namer::Trivial("sphere.ply".to_string());
  let stats =
    reconstruct(&set, &grid, params, &mut mesher, &mut writer, &namer, PASS_COUNT).unwrap();
  let output = writer.output("sphere.ply").expect("an output file").clone();
  (output, stats)
}

#[test]
fn test_sphere_reconstruction_end_to_end() {
  let params = small_params();
  let (output, stats) = run_once(&params);

  assert_eq!(stats.files_written, 1);
  assert!(stats.tiles > 1, "budget must force a multi-tile run");
  assert!(!output.triangles.is_empty());

  // All geometry sits near the sampled sphere.
  for vertex in &output.vertices {
    let d = Vec3::from_array(*vertex).distance(SPHERE_CENTER);
    assert!((1.8..4.2).contains(&d), "vertex at distance {d}");
  }

  // Weld invariant: shared boundary vertices collapsed to one each.
  let mut seen = HashSet::new();
  for vertex in &output.vertices {
    assert!(
      seen.insert(vertex.map(f32::to_bits)),
      "duplicate vertex {vertex:?} survived welding"
    );
  }

  // Every vertex is referenced and indices are in range.
  let mut referenced = vec![false; output.vertices.len()];
  for triangle in &output.triangles {
    for &index in triangle {
      referenced[index as usize] = true;
    }
  }
  assert!(referenced.iter().all(|&r| r));
}

/// Two runs with different worker layouts (hence different arrival orders)
/// produce the same mesh up to vertex reordering. Positions are compared
/// with a small tolerance: a welded boundary vertex may keep either tile's
/// accumulation of the same splat sums.
#[test]
fn test_repeated_runs_agree() {
  let params = small_params();
  let (first, _) = run_once(&params);

  let mut reordered = params.clone();
  reordered.devices = 1;
  reordered.loaders = 1;
  let (second, _) = run_once(&reordered);

  assert_eq!(first.vertices.len(), second.vertices.len());
  assert_eq!(first.triangles.len(), second.triangles.len());

  // Compare as multisets of quantised positions.
  let quantised = |output: &MemoryOutput| {
    let mut keys: Vec<[i64; 3]> = output
      .vertices
      .iter()
      .map(|v| v.map(|c| (c * 1000.0).round() as i64))
      .collect();
    keys.sort_unstable();
    keys
  };
  assert_eq!(quantised(&first), quantised(&second));
}

#[test]
fn test_pruning_drops_stray_fragment() {
  // A sphere plus a tiny far-away patch; pruning keeps only the sphere.
  let mut splats = sphere_splats(500);
  for i in 0..3 {
    splats.push(Splat::from_file_record(
      [0.6 + 0.1 * i as f32, 0.5, 0.5],
      [0.0, 0.0, 1.0],
      0.4,
    ));
  }
  let set = blob_set(splats);
  let grid = set.bounding_grid().clone();

  let mut params = small_params();
  params.prune = 0.05;
  let mut mesher = OocMesher::new();
  let mut writer = MemoryPlyWriter::new();
  let namer = Namer::Trivial("pruned.ply".to_string());
  reconstruct(&set, &grid, &params, &mut mesher, &mut writer, &namer, PASS_COUNT).unwrap();

  let output = writer.output("pruned.ply").expect("sphere survives pruning");
  for vertex in &output.vertices {
    let d = Vec3::from_array(*vertex).distance(SPHERE_CENTER);
    assert!(d < 4.5, "stray fragment at distance {d} survived pruning");
  }
}

#[test]
fn test_split_output_produces_chunk_files() {
  let set = blob_set(sphere_splats(500));
  let grid = set.bounding_grid().clone();

  let mut params = small_params();
  params.chunk_cells = 8;
  let mut mesher = OocMesher::new();
  let mut writer = MemoryPlyWriter::new();
  let namer = Namer::Chunked("part".to_string());
  let stats =
    reconstruct(&set, &grid, &params, &mut mesher, &mut writer, &namer, PASS_COUNT).unwrap();

  assert!(stats.files_written > 1, "expected several chunk files");
  assert_eq!(stats.files_written as usize, writer.num_outputs());
}
