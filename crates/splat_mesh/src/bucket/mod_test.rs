use std::collections::HashMap;

use super::*;
use crate::grid::splat_to_buckets;
use crate::splat_set::{FastBlobSet, SplatSet, VectorSet};
use crate::types::Splat;

#[test]
fn test_splat_cell_intersect() {
  let splat = Splat::from_file_record([10.0, 20.0, 30.0], [0.0, 0.0, 1.0], 3.0);

  // Lower corner of the grid is at (-8, -2, 2) world with spacing 2.
  let grid = Grid::with_extents([-10.0, -10.0, -10.0], 2.0, [(1, 100), (4, 100), (6, 100)]);

  // Covers (0,10,20)-(8,18,28) in world space.
  assert!(splat_cell_intersect(&splat, &Cell::new(4, 6, 9, 2), &grid));
  // Covers (0,10,20)-(4,14,24): misses the splat's bounding box.
  assert!(!splat_cell_intersect(&splat, &Cell::new(4, 6, 9, 1), &grid));
  // Covers (10,20,30)-(12,22,32): entirely inside the bounding box.
  assert!(splat_cell_intersect(&splat, &Cell::new(9, 11, 14, 0), &grid));
}

fn scattered_set() -> FastBlobSet<VectorSet> {
  // A deterministic scatter over [0, 8)^3 with small supports.
  let mut splats = Vec::new();
  for i in 0..64u32 {
    let x = (i % 4) as f32 * 2.0 + 0.5;
    let y = ((i / 4) % 4) as f32 * 2.0 + 0.7;
    let z = (i / 16) as f32 * 2.0 + 0.3;
    splats.push(Splat::from_file_record([x, y, z], [0.0, 0.0, 1.0], 0.3));
  }
  let mut set = FastBlobSet::new(VectorSet::new(splats));
  set.compute_blobs(1.0, 1, None).unwrap();
  set
}

#[test]
fn test_bucket_coverage_and_budget() {
  let set = scattered_set();
  let grid = set.bounding_grid().clone();
  assert_eq!(grid.dims(), [8, 8, 8]);

  let params = BucketParams {
    max_splats: 8,
    max_cell_side: 4,
    chunk_cells: 0,
    bucket_size: 1,
  };
  let mut bins = Vec::new();
  bucket(&set, &grid, &params, &mut |bin| {
    bins.push(bin);
    Ok(())
  })
  .unwrap();
  assert!(!bins.is_empty());

  // Tiles stay within bounds, within budget, and never overlap.
  let mut owner: HashMap<[u64; 3], usize> = HashMap::new();
  for (index, bin) in bins.iter().enumerate() {
    assert!(bin.dims.iter().all(|&d| d > 0 && d <= params.max_cell_side));
    assert!(
      bin.subset.num_splats() <= params.max_splats || bin.dims.iter().all(|&d| d == 1),
      "oversized tile of {} splats",
      bin.subset.num_splats()
    );
    for x in 0..bin.dims[0] {
      for y in 0..bin.dims[1] {
        for z in 0..bin.dims[2] {
          let cell = [bin.lower[0] + x, bin.lower[1] + y, bin.lower[2] + z];
          assert!(cell[0] < 8 && cell[1] < 8 && cell[2] < 8);
          assert!(owner.insert(cell, index).is_none(), "cell {cell:?} in two tiles");
        }
      }
    }
  }

  // Every splat is present in the tile holding its centre cell.
  let mut stream = set.splat_stream();
  while let Some(s) = stream.next().unwrap() {
    let (lower, _) = splat_to_buckets(&s.splat, &grid, 1);
    let cell = [lower[0] as u64, lower[1] as u64, lower[2] as u64];
    let index = owner[&cell];
    let in_subset = bins[index]
      .subset
      .ranges()
      .iter()
      .any(|r| r.scan == 0 && r.start <= s.id && s.id < r.start + r.size as u64);
    assert!(in_subset, "splat {} missing from tile {}", s.id, index);
  }
}

#[test]
fn test_bucket_chunk_assignment() {
  let set = scattered_set();
  let grid = set.bounding_grid().clone();

  let params = BucketParams {
    max_splats: 8,
    max_cell_side: 8,
    chunk_cells: 4,
    bucket_size: 1,
  };
  let mut bins = Vec::new();
  bucket(&set, &grid, &params, &mut |bin| {
    bins.push(bin);
    Ok(())
  })
  .unwrap();

  let mut gens: HashMap<[u32; 3], u32> = HashMap::new();
  for bin in &bins {
    // A tile never straddles a chunk boundary.
    for axis in 0..3 {
      assert_eq!(
        bin.lower[axis] / params.chunk_cells,
        (bin.lower[axis] + bin.dims[axis] - 1) / params.chunk_cells
      );
      assert_eq!(bin.chunk_id.coords[axis] as u64, bin.lower[axis] / params.chunk_cells);
    }
    // Tiles of one chunk share a generation; distinct chunks do not.
    match gens.get(&bin.chunk_id.coords) {
      Some(&gen) => assert_eq!(gen, bin.chunk_id.gen),
      None => {
        assert!(gens.values().all(|&g| g != bin.chunk_id.gen));
        gens.insert(bin.chunk_id.coords, bin.chunk_id.gen);
      }
    }
  }
  assert!(gens.len() > 1);
}

#[test]
#[should_panic(expected = "invalid argument")]
fn test_bucket_rejects_non_power_of_two_side() {
  let set = scattered_set();
  let grid = set.bounding_grid().clone();
  let params = BucketParams {
    max_splats: 8,
    max_cell_side: 3,
    chunk_cells: 0,
    bucket_size: 1,
  };
  let _ = bucket(&set, &grid, &params, &mut |_| Ok(()));
}
