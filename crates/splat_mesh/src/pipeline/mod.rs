//! The staged reconstruction pipeline.
//!
//! ```text
//! bucket ──► collector ──► [loader × L] ──► [device × D] ──► mesher ──► write
//!   (main thread)            I/O bound        tree + MT       single
//! ```
//!
//! Stages are connected by byte-budgeted [`WorkQueue`]s, so host memory stays
//! bounded no matter how fast the producers run. The whole chain executes
//! twice, once per mesher pass, with a full barrier in between; the second
//! pass regenerates every tile mesh rather than caching it, which is what
//! keeps the pipeline out-of-core.
//!
//! Every blocking operation observes one [`StopToken`]. A failing worker
//! trips the token and returns; the driver then closes and drains the queues
//! and joins all workers in forward order before reporting the first real
//! error.

use crate::bucket::{bucket, Bin, BucketCollector, BucketParams};
use crate::error::{Error, Result};
use crate::grid::Grid;
use crate::marching::Marching;
use crate::mesh::{HostKeyMesh, MesherWork};
use crate::mesher::{OocMesher, PASS_COUNT};
use crate::metrics;
use crate::mls::MlsField;
use crate::ply::{Namer, PlyWriter};
use crate::progress;
use crate::splat_set::SplatSet;
use crate::splat_tree::SplatTree;
use crate::timeplot;
use crate::types::Splat;
use crate::work_queue::{StopToken, WorkQueue};

/// Tuning knobs of one reconstruction run.
#[derive(Clone, Debug)]
pub struct PipelineParams {
  /// Grid spacing in world units.
  pub spacing: f32,
  /// Internal bucket size in cells.
  pub bucket_size: u64,
  /// Splat budget per tile.
  pub max_device_splats: u64,
  /// Maximum tile side in cells (power of two).
  pub max_cell_side: u64,
  /// Chunk size in cells for split output, 0 for a single file.
  pub chunk_cells: u64,
  /// Splat budget per loader batch.
  pub max_load_splats: u64,
  /// Byte budget of the mesher input queue.
  pub mem_mesh: usize,
  /// Byte budget of the loader → device queue.
  pub mem_gather: usize,
  /// Device worker count.
  pub devices: usize,
  /// Loader thread count.
  pub loaders: usize,
  /// Component prune threshold in [0, 1).
  pub prune: f64,
  /// Suppress progress output.
  pub quiet: bool,
  /// Where to persist the counting-pass state for `--resume`.
  pub checkpoint: Option<std::path::PathBuf>,
}

impl Default for PipelineParams {
  fn default() -> Self {
    PipelineParams {
      spacing: 1.0,
      bucket_size: 16,
      max_device_splats: 2_000_000,
      max_cell_side: 64,
      chunk_cells: 0,
      max_load_splats: 8_000_000,
      mem_mesh: 512 << 20,
      mem_gather: 256 << 20,
      devices: std::thread::available_parallelism().map_or(1, |n| n.get()),
      loaders: 1,
      prune: 0.0,
      quiet: true,
      checkpoint: None,
    }
  }
}

impl PipelineParams {
  /// Fail fast on caller misuse before any worker thread starts.
  fn validate(&self) {
    assert!(
      self.max_cell_side > 0 && self.max_cell_side.is_power_of_two(),
      "invalid argument: max cell side must be a positive power of two"
    );
    assert!(
      self.max_cell_side <= 1 << (crate::splat_tree::MAX_LEVELS - 1),
      "invalid argument: max cell side exceeds the splat tree depth"
    );
    assert!(
      self.chunk_cells == 0 || self.chunk_cells.is_power_of_two(),
      "invalid argument: chunk size must be a power of two"
    );
    assert!(self.bucket_size > 0, "invalid argument: bucket size must be positive");
    assert!(
      self.max_device_splats > 0 && self.max_load_splats > 0,
      "invalid argument: splat budgets must be positive"
    );
    assert!(
      (0.0..1.0).contains(&self.prune),
      "invalid argument: prune threshold must lie in [0, 1)"
    );
  }
}

/// Aggregate counters of one run.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineStats {
  pub files_written: u64,
  pub tiles: u64,
  pub splats_loaded: u64,
}

/// One loaded tile on its way to a device worker.
struct TileWork {
  bin: Bin,
  splats: Vec<Splat>,
}

/// Prefer the first error that is not a cancellation echo.
fn combine_errors(results: Vec<Result<()>>) -> Result<()> {
  let mut cancelled = false;
  let mut first = None;
  for result in results {
    match result {
      Ok(()) => {}
      Err(Error::Cancelled) => cancelled = true,
      Err(err) => {
        if first.is_none() {
          first = Some(err);
        }
      }
    }
  }
  match (first, cancelled) {
    (Some(err), _) => Err(err),
    (None, true) => Err(Error::Cancelled),
    (None, false) => Ok(()),
  }
}

/// Run the full reconstruction: both mesher passes over the decomposed grid,
/// then output finalisation.
///
/// `start_pass` is normally [`PASS_COUNT`]; a mesher restored from a
/// checkpoint starts at [`PASS_EMIT`](crate::mesher::PASS_EMIT) instead.
pub fn reconstruct<S: SplatSet + Sync>(
  set: &S,
  grid: &Grid,
  params: &PipelineParams,
  mesher: &mut OocMesher,
  writer: &mut dyn PlyWriter,
  namer: &Namer,
  start_pass: u32,
) -> Result<PipelineStats> {
  params.validate();
  mesher.set_prune_threshold(params.prune);

  let mut stats = PipelineStats::default();
  for pass in start_pass..mesher.num_passes() {
    let pass_stats = run_pass(set, grid, params, mesher, pass)?;
    if pass == PASS_COUNT {
      metrics::global().add_counter("pipeline.total_vertices", mesher.total_vertices());
      if let Some(path) = &params.checkpoint {
        mesher.save_checkpoint(path)?;
      }
    }
    stats.tiles = pass_stats.tiles;
    stats.splats_loaded += pass_stats.splats_loaded;
  }

  let tworker = timeplot::Worker::new("main");
  let _action = tworker.action("write");
  stats.files_written = mesher.write(writer, namer)?;
  if stats.files_written == 0 {
    log::warn!("no output files were written (all components empty or pruned)");
  }
  Ok(stats)
}

fn run_pass<S: SplatSet + Sync>(
  set: &S,
  grid: &Grid,
  params: &PipelineParams,
  mesher: &mut OocMesher,
  pass: u32,
) -> Result<PipelineStats> {
  mesher.begin_pass(pass)?;

  let stop = StopToken::new();
  let batch_queue = WorkQueue::<Vec<Bin>>::new(4, stop.clone());
  let tile_queue = WorkQueue::<TileWork>::new(params.mem_gather, stop.clone());
  let mesh_queue = WorkQueue::<MesherWork>::new(params.mem_mesh, stop.clone());

  let bucket_params = BucketParams {
    max_splats: params.max_device_splats,
    max_cell_side: params.max_cell_side,
    chunk_cells: params.chunk_cells,
    bucket_size: params.bucket_size,
  };

  let bar = progress::bar(&format!("pass {}", pass + 1), set.max_splats(), params.quiet);
  let mut stats = PipelineStats::default();

  let result = std::thread::scope(|scope| -> Result<()> {
    // Loaders: read each bin's splat ranges into host memory.
    let mut loader_handles = Vec::new();
    for index in 0..params.loaders.max(1) {
      let batch_queue = &batch_queue;
      let tile_queue = &tile_queue;
      let stop = stop.clone();
      loader_handles.push(scope.spawn(move || -> Result<()> {
        let tworker = timeplot::Worker::new(format!("loader-{index}"));
        let run = || -> Result<()> {
          while let Some(batch) = batch_queue.pop() {
            for bin in batch {
              let _action = tworker.action("load");
              let mut splats = Vec::with_capacity(bin.subset.num_splats() as usize);
              let mut stream = set.splat_stream_ranges(bin.subset.ranges());
              while let Some(s) = stream.next()? {
                splats.push(s.splat);
              }
              drop(stream);
              let bytes = splats.len() * std::mem::size_of::<Splat>();
              tile_queue.push(TileWork { bin, splats }, bytes)?;
            }
          }
          Ok(())
        };
        let result = run();
        if result.is_err() {
          stop.stop();
        }
        result
      }));
    }

    // Device workers: per-tile octree, field evaluation, extraction.
    let mut device_handles = Vec::new();
    for index in 0..params.devices.max(1) {
      let tile_queue = &tile_queue;
      let mesh_queue = &mesh_queue;
      let stop = stop.clone();
      let bar = &bar;
      device_handles.push(scope.spawn(move || -> Result<()> {
        let tworker = timeplot::Worker::new(format!("device-{index}"));
        let marching = Marching::new();
        let run = || -> Result<()> {
          while let Some(tile) = tile_queue.pop() {
            let mesh_data = {
              let _action = tworker.action("extract");
              let tree = SplatTree::build(&tile.splats, grid, tile.bin.lower, tile.bin.dims);
              let field = MlsField::new(&tree, &tile.splats, grid, tile.bin.lower, tile.bin.dims);
              marching.extract(&field, grid, tile.bin.lower)
            };
            bar.inc(tile.splats.len() as u64);
            metrics::global().add_sample("device.tile_splats", tile.splats.len() as f64);
            if mesh_data.is_empty() {
              continue;
            }
            let mesh = HostKeyMesh::from_mesh_data(mesh_data);
            mesh.validate();
            let bytes = mesh.sizes().host_bytes();
            mesh_queue.push(
              MesherWork {
                chunk_id: tile.bin.chunk_id,
                mesh,
              },
              bytes,
            )?;
          }
          Ok(())
        };
        let result = run();
        if result.is_err() {
          stop.stop();
        }
        result
      }));
    }

    // Gather: the single mesher thread.
    let mesher_handle = {
      let mesh_queue = &mesh_queue;
      let stop = stop.clone();
      let mesher = &mut *mesher;
      scope.spawn(move || -> Result<()> {
        let tworker = timeplot::Worker::new("mesher");
        let mut run = || -> Result<()> {
          while let Some(work) = mesh_queue.pop() {
            let _action = tworker.action("weld");
            mesher.add(&work)?;
          }
          Ok(())
        };
        let result = run();
        if result.is_err() {
          stop.stop();
        }
        result
      })
    };

    // Main thread: decompose and batch. Tile counting happens here so both
    // passes see identical decomposition.
    let bucket_result = {
      let mut collector = BucketCollector::new(params.max_load_splats, |batch: Vec<Bin>| {
        batch_queue.push(batch, 1)
      });
      let result = bucket(set, grid, &bucket_params, &mut |bin| {
        stats.tiles += 1;
        stats.splats_loaded += bin.subset.num_splats();
        collector.add(bin)
      });
      result.and_then(|()| collector.flush())
    };
    if bucket_result.is_err() {
      stop.stop();
    }
    batch_queue.close();

    // Shut the chain down in forward order, closing each queue once its
    // producers have joined.
    let mut results = vec![bucket_result];
    for handle in loader_handles {
      results.push(handle.join().expect("loader panicked"));
    }
    tile_queue.close();
    for handle in device_handles {
      results.push(handle.join().expect("device worker panicked"));
    }
    mesh_queue.close();
    results.push(mesher_handle.join().expect("mesher thread panicked"));

    batch_queue.drain();
    tile_queue.drain();
    mesh_queue.drain();
    combine_errors(results)
  });

  bar.finish_and_clear();
  result?;
  metrics::global().add_counter("pipeline.tiles", stats.tiles);
  Ok(stats)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod mod_test;
