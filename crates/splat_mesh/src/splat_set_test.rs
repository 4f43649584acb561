use std::io::Write;
use std::path::PathBuf;

use super::*;
use crate::ply::PlyReader;
use crate::range::Range;
use crate::types::make_splat_id;

fn splat(position: [f32; 3], radius: f32) -> Splat {
  Splat::from_file_record(position, [0.0, 0.0, 1.0], radius)
}

fn nan_splat() -> Splat {
  splat([f32::NAN, 0.0, 0.0], 1.0)
}

fn collect(stream: &mut dyn SplatStream) -> Vec<SplatId> {
  let mut ids = Vec::new();
  while let Some(s) = stream.next().unwrap() {
    ids.push(s.id);
  }
  ids
}

#[test]
fn test_vector_stream_skips_nonfinite() {
  let set = VectorSet::new(vec![
    splat([0.0; 3], 1.0),
    nan_splat(),
    splat([1.0; 3], 1.0),
    splat([2.0; 3], 0.0),
    splat([3.0; 3], 1.0),
  ]);
  assert_eq!(set.max_splats(), 5);
  assert_eq!(collect(set.splat_stream().as_mut()), vec![0, 2, 4]);
}

#[test]
fn test_vector_stream_ranges() {
  let splats: Vec<Splat> = (0..10).map(|i| splat([i as f32, 0.0, 0.0], 1.0)).collect();
  let set = VectorSet::new(splats);
  let ranges = [Range::new(0, 1, 2), Range::new(0, 6, 3)];
  assert_eq!(
    collect(set.splat_stream_ranges(&ranges).as_mut()),
    vec![1, 2, 6, 7, 8]
  );
}

#[test]
fn test_compute_blobs_runs_and_grid() {
  let mut set = FastBlobSet::new(VectorSet::new(vec![
    splat([0.5, 0.5, 0.5], 0.25),
    nan_splat(),
    splat([0.5, 0.5, 0.5], 0.25),
    splat([2.5, 0.5, 0.5], 0.25),
  ]));
  set.compute_blobs(1.0, 2, None).unwrap();
  assert_eq!(set.num_splats(), 3);

  let grid = set.bounding_grid().clone();
  assert_eq!(grid.reference(), [0.0, 0.0, 0.0]);
  // Lower extents are snapped to bucket multiples.
  for axis in 0..3 {
    assert_eq!(grid.extent(axis).0 % 2, 0);
  }
  assert_eq!(grid.extent(0), (0, 3));
  assert_eq!(grid.extent(1), (0, 1));

  // The non-finite splat splits the identical-footprint run.
  let mut blobs = Vec::new();
  let mut stream = set.blob_stream(&grid, 2);
  while let Some(blob) = stream.next().unwrap() {
    blobs.push(blob);
  }
  assert_eq!(blobs.len(), 3);
  assert_eq!((blobs[0].first_splat, blobs[0].last_splat), (0, 1));
  assert_eq!((blobs[1].first_splat, blobs[1].last_splat), (2, 3));
  assert_eq!(blobs[0].lower, [0, 0, 0]);
  assert_eq!(blobs[2].lower, [1, 0, 0]);
}

#[test]
fn test_fast_and_generic_paths_agree() {
  let splats: Vec<Splat> = (0..50)
    .map(|i| splat([(i % 7) as f32, (i % 5) as f32, (i % 3) as f32], 0.5))
    .collect();
  let mut set = FastBlobSet::new(VectorSet::new(splats));
  set.compute_blobs(1.0, 2, None).unwrap();
  let grid = set.bounding_grid().clone();

  // Fast path: grid and bucket size match the precomputed data.
  let mut fast = Vec::new();
  let mut stream = set.blob_stream(&grid, 4);
  while let Some(blob) = stream.next().unwrap() {
    fast.push(blob);
  }
  drop(stream);

  // Generic path: one blob per splat straight off the base set.
  let mut generic = Vec::new();
  let mut stream = set.base().blob_stream(&grid, 4);
  while let Some(blob) = stream.next().unwrap() {
    generic.push(blob);
  }
  drop(stream);

  // Same coverage: every splat ID maps to the same footprint.
  let expand = |blobs: &[Blob]| {
    let mut per_splat = std::collections::BTreeMap::new();
    for blob in blobs {
      for id in blob.first_splat..blob.last_splat {
        per_splat.insert(id, (blob.lower, blob.upper));
      }
    }
    per_splat
  };
  assert_eq!(expand(&fast), expand(&generic));
}

#[test]
fn test_compute_blobs_empty_input_fails() {
  let mut set = FastBlobSet::new(VectorSet::new(vec![nan_splat()]));
  let err = set.compute_blobs(1.0, 2, None).unwrap_err();
  assert!(err.to_string().contains("at least one splat"));
}

#[test]
#[should_panic(expected = "compute_blobs")]
fn test_num_splats_before_compute_panics() {
  let set = FastBlobSet::new(VectorSet::new(Vec::new()));
  let _ = set.num_splats();
}

#[test]
fn test_subset_merges_adjacent_blobs() {
  let mut subset = Subset::empty();
  let blob = |first: u64, last: u64| Blob {
    first_splat: first,
    last_splat: last,
    lower: [0; 3],
    upper: [0; 3],
  };
  subset.add_blob(&blob(3, 5));
  subset.add_blob(&blob(5, 9));
  subset.add_blob(&blob(12, 13));
  assert_eq!(subset.num_ranges(), 2);
  assert_eq!(subset.num_splats(), 7);
  assert_eq!(subset.ranges()[0], Range::new(0, 3, 6));
  assert_eq!(subset.ranges()[1], Range::new(0, 12, 1));
}

// =============================================================================
// FileSet
// =============================================================================

fn write_ply(name: &str, records: &[([f32; 3], f32)]) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("splat_mesh_set_{}", std::process::id()));
  std::fs::create_dir_all(&dir).unwrap();
  let path = dir.join(name);
  let mut file = std::fs::File::create(&path).unwrap();
  write!(
    file,
    "ply\nformat binary_little_endian 1.0\nelement vertex {}\n\
     property float32 x\nproperty float32 y\nproperty float32 z\n\
     property float32 nx\nproperty float32 ny\nproperty float32 nz\n\
     property float32 radius\nend_header\n",
    records.len()
  )
  .unwrap();
  for (position, radius) in records {
    for v in position {
      file.write_all(&v.to_le_bytes()).unwrap();
    }
    for v in [0.0f32, 0.0, 1.0] {
      file.write_all(&v.to_le_bytes()).unwrap();
    }
    file.write_all(&radius.to_le_bytes()).unwrap();
  }
  path
}

#[test]
fn test_file_set_stream_order_and_ids() {
  let path_a = write_ply(
    "a.ply",
    &[([0.0; 3], 1.0), ([1.0; 3], f32::NAN), ([2.0; 3], 1.0)],
  );
  let path_b = write_ply("b.ply", &[([3.0; 3], 1.0)]);

  let mut set = FileSet::with_buffer_size(4096);
  set.add_file(PlyReader::open(&path_a).unwrap());
  set.add_file(PlyReader::open(&path_b).unwrap());
  assert_eq!(set.max_splats(), 4);

  let ids = collect(set.splat_stream().as_mut());
  assert_eq!(
    ids,
    vec![
      make_splat_id(0, 0),
      make_splat_id(0, 2),
      make_splat_id(1, 0)
    ]
  );

  // Ranged access hits only what was asked for.
  let ranges = [Range::new(0, 2, 1), Range::new(1, 0, 1)];
  let ids = collect(set.splat_stream_ranges(&ranges).as_mut());
  assert_eq!(ids, vec![make_splat_id(0, 2), make_splat_id(1, 0)]);

  std::fs::remove_file(path_a).unwrap();
  std::fs::remove_file(path_b).unwrap();
}

#[test]
fn test_file_set_early_drop_is_clean() {
  let records: Vec<([f32; 3], f32)> = (0..10_000)
    .map(|i| ([i as f32, 0.0, 0.0], 1.0))
    .collect();
  let path = write_ply("large.ply", &records);

  let mut set = FileSet::with_buffer_size(4096);
  set.add_file(PlyReader::open(&path).unwrap());

  // Pull a handful of splats then drop the stream while the reader thread
  // is still mid-file; drop must drain and join without deadlocking.
  let mut stream = set.splat_stream();
  for _ in 0..5 {
    assert!(stream.next().unwrap().is_some());
  }
  drop(stream);

  std::fs::remove_file(path).unwrap();
}
