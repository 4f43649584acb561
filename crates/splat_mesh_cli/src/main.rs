//! splatmesh - reconstruct a triangle mesh from oriented splat PLY files.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context};
use clap::Parser;

use splat_mesh::mesher::{PASS_COUNT, PASS_EMIT};
use splat_mesh::{
  metrics, progress, reconstruct, timeplot, FastBlobSet, FilePlyWriter, FileSet, Namer, OocMesher,
  PipelineParams, PlyReader, PlyWriter, SplatSet,
};

#[derive(Parser, Debug)]
#[command(
  name = "splatmesh",
  about = "Out-of-core surface reconstruction from oriented point splats",
  version
)]
struct Options {
  /// Input PLY files (binary_little_endian, x y z nx ny nz radius).
  #[arg(required = true)]
  inputs: Vec<PathBuf>,

  /// Output file, or chunk basename when --split is given.
  #[arg(long)]
  out: PathBuf,

  /// Checkpoint file: written after the counting pass, reused if present.
  #[arg(long)]
  resume: Option<PathBuf>,

  /// Byte budget for the mesher input queue.
  #[arg(long, default_value_t = 512 << 20)]
  mem_mesh: usize,

  /// Byte budget for the loader to device queues.
  #[arg(long, default_value_t = 256 << 20)]
  mem_gather: usize,

  /// Splat budget per loader batch.
  #[arg(long, default_value_t = 8_000_000)]
  max_load_splats: u64,

  /// Splat budget per device tile.
  #[arg(long, default_value_t = 2_000_000)]
  max_device_splats: u64,

  /// Maximum tile side in grid cells (power of two).
  #[arg(long, default_value_t = 64)]
  cell_side: u64,

  /// Split output into chunks of this many cells (0 = single file).
  #[arg(long, default_value_t = 0)]
  split: u64,

  /// Discard components smaller than this fraction of all vertices.
  #[arg(long, default_value_t = 0.0)]
  prune: f64,

  /// Grid spacing in world units.
  #[arg(long, default_value_t = 0.1)]
  spacing: f32,

  /// Internal bucket size in cells.
  #[arg(long, default_value_t = 16)]
  bucket_size: u64,

  /// Device worker count (defaults to the CPU count).
  #[arg(long)]
  devices: Option<usize>,

  /// Loader thread count.
  #[arg(long, default_value_t = 2)]
  loaders: usize,

  /// Write per-worker event timings to this file.
  #[arg(long)]
  timeplot: Option<PathBuf>,

  /// Print the statistics registry on exit.
  #[arg(long)]
  statistics: bool,

  /// Suppress progress bars.
  #[arg(long)]
  quiet: bool,
}

fn run(options: &Options) -> anyhow::Result<u64> {
  if !(0.0..1.0).contains(&options.prune) {
    bail!("--prune must lie in [0, 1)");
  }
  if options.split != 0 && !options.split.is_power_of_two() {
    bail!("--split must be a power of two");
  }
  if !options.cell_side.is_power_of_two() {
    bail!("--cell-side must be a power of two");
  }

  if options.timeplot.is_some() {
    timeplot::start_recording();
  }

  // Open the inputs and build the blob-accelerated splat set.
  let mut files = FileSet::new();
  for path in &options.inputs {
    let reader = PlyReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    log::info!("{}: {} splats", path.display(), reader.len());
    files.add_file(reader);
  }
  let mut set = FastBlobSet::new(files);
  {
    let bar = progress::bar(
      "computing blobs",
      set.base().max_splats(),
      options.quiet,
    );
    set.compute_blobs(options.spacing, options.bucket_size, Some(&bar))?;
    bar.finish_and_clear();
  }
  let grid = set.bounding_grid().clone();
  log::info!(
    "grid: {} x {} x {} cells at spacing {}",
    grid.num_cells(0),
    grid.num_cells(1),
    grid.num_cells(2),
    grid.spacing()
  );

  let params = PipelineParams {
    spacing: options.spacing,
    bucket_size: options.bucket_size,
    max_device_splats: options.max_device_splats,
    max_cell_side: options.cell_side,
    chunk_cells: options.split,
    max_load_splats: options.max_load_splats,
    mem_mesh: options.mem_mesh,
    mem_gather: options.mem_gather,
    devices: options
      .devices
      .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get())),
    loaders: options.loaders,
    prune: options.prune,
    quiet: options.quiet,
    checkpoint: options.resume.clone(),
  };

  let out = options
    .out
    .to_str()
    .context("--out must be valid UTF-8")?
    .to_string();
  let namer = if options.split == 0 {
    Namer::Trivial(out)
  } else {
    Namer::Chunked(out.trim_end_matches(".ply").to_string())
  };

  // A checkpoint skips the counting pass entirely.
  let (mut mesher, start_pass) = match &options.resume {
    Some(path) if path.exists() => {
      log::info!("resuming from {}", path.display());
      (OocMesher::load_checkpoint(path)?, PASS_EMIT)
    }
    _ => (OocMesher::new(), PASS_COUNT),
  };

  let mut writer = FilePlyWriter::new();
  let result = reconstruct(
    &set,
    &grid,
    &params,
    &mut mesher,
    &mut writer,
    &namer,
    start_pass,
  );
  let stats = match result {
    Ok(stats) => stats,
    Err(err) => {
      writer.abort();
      return Err(err.into());
    }
  };

  if let Some(path) = &options.timeplot {
    timeplot::write(path).context("writing timeplot")?;
  }
  if options.statistics {
    print!("{}", metrics::global().report());
  }

  log::info!(
    "done: {} tiles, {} file(s) written",
    stats.tiles,
    stats.files_written
  );
  Ok(stats.files_written)
}

fn main() -> ExitCode {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
  let options = Options::parse();
  match run(&options) {
    Ok(files) => {
      if files == 0 {
        log::warn!("no output produced");
      }
      ExitCode::SUCCESS
    }
    Err(err) => {
      log::error!("{err:#}");
      ExitCode::FAILURE
    }
  }
}
