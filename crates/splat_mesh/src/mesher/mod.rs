//! Out-of-core mesher: welds tile meshes into a global, duplicate-free,
//! component-filtered mesh using bounded memory.
//!
//! The mesher runs two passes over the same stream of tile meshes with a
//! full barrier between them:
//!
//! - **Counting**: per mesh, find the tile-local connected components
//!   (clumps) with a transient union-find over the triangles, then merge
//!   them into the global clump arena. External vertices are represented by
//!   their 64-bit key; a key seen for the first time contributes one global
//!   vertex, and every later sighting only merges components. After this
//!   pass the size of every connected component of the *global* mesh is
//!   known.
//! - **Emitting**: per mesh, recompute the local clumps, drop those whose
//!   component is below the prune threshold, and append the surviving
//!   vertices and triangles to two spill files through the
//!   [`TmpWriterWorkerGroup`]. Within one output chunk an external key is
//!   emitted only on first sight; triangles are written with their final
//!   chunk-local indices. Only the union-find, the per-chunk key indices and
//!   the spill-range bookkeeping stay in memory.
//!
//! [`OocMesher::write`] then lays out one PLY per chunk with a positive
//! retained triangle count, streaming the chunk's spill ranges back in
//! blocks. Chunks that end up empty never open a file.
//!
//! Each output chunk moves through its own [`ChunkState`] lifecycle
//! (`Empty → Counting → Counted → Emitting → Written`), with `Counted`
//! reached at the pass barrier; a chunk whose retained geometry is empty
//! never opens a file and terminates early. The mesher itself keeps a
//! coarser [`State`] that tracks which pass the driver is feeding.
//!
//! Arrival order of tile meshes is irrelevant in both passes; the driver may
//! even reverse it between passes.

pub mod tmp_writer;
pub mod union_find;

pub use tmp_writer::{TmpFileReader, TmpWriterItem, TmpWriterWorkerGroup};
pub use union_find::ClumpArena;

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::mesh::MesherWork;
use crate::metrics;
use crate::ply::{Namer, PlyWriter};
use crate::types::ChunkId;

/// Sentinel for pruned vertices in the local index map.
const PRUNED: u32 = u32::MAX;

/// Vertices and triangles streamed per block while writing output files.
const WRITE_BLOCK: usize = 1 << 16;

/// Mesher pass identifiers.
pub const PASS_COUNT: u32 = 0;
pub const PASS_EMIT: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
  Empty,
  Counting,
  Emitting,
  Written,
}

/// Lifecycle of one output chunk.
///
/// `Empty → Counting → Counted → Emitting → Written`. `Counted` is reached
/// at the pass barrier; `Written` when the chunk's file is finalised. A
/// chunk whose retained triangle count is zero never opens a file and
/// terminates in whatever state it last reached.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum ChunkState {
  #[default]
  Empty,
  Counting,
  Counted,
  Emitting,
  Written,
}

/// Per-chunk bookkeeping, created on first sight in the counting pass.
#[derive(Debug, Default)]
struct ChunkRecord {
  chunk_id: ChunkId,
  state: ChunkState,
  /// Chunk-local index of each emitted external key.
  external_index: HashMap<u64, u32>,
  next_vertex: u32,
  num_triangles: u64,
  /// Element ranges of this chunk in the vertex spill file.
  vertex_ranges: Vec<(u64, u64)>,
  /// Element ranges of this chunk in the triangle spill file.
  triangle_ranges: Vec<(u64, u64)>,
}

/// Pass-1 state persisted for `--resume`.
#[derive(Serialize, Deserialize)]
struct Checkpoint {
  clumps: ClumpArena,
  key_clump: HashMap<u64, u32>,
  total_vertices: u64,
  /// Chunks seen by the counting pass, in first-seen order.
  chunks: Vec<ChunkId>,
}

/// Transient union-find over one mesh's vertices.
struct LocalUf {
  parent: Vec<u32>,
}

impl LocalUf {
  fn new(n: usize) -> Self {
    LocalUf {
      parent: (0..n as u32).collect(),
    }
  }

  fn find(&mut self, mut v: u32) -> u32 {
    while self.parent[v as usize] != v {
      let grandparent = self.parent[self.parent[v as usize] as usize];
      self.parent[v as usize] = grandparent;
      v = grandparent;
    }
    v
  }

  fn union(&mut self, a: u32, b: u32) {
    let ra = self.find(a);
    let rb = self.find(b);
    if ra != rb {
      self.parent[rb as usize] = ra;
    }
  }
}

/// The welder and pruner.
pub struct OocMesher {
  state: State,
  prune_threshold: f64,

  // Global component structure (built in the counting pass).
  clumps: ClumpArena,
  key_clump: HashMap<u64, u32>,
  total_vertices: u64,

  // Emitting state.
  threshold_vertices: u64,
  chunks: Vec<ChunkRecord>,
  chunk_index: HashMap<ChunkId, usize>,
  tmp: TmpWriterWorkerGroup,
  vertices_spilled: u64,
  triangles_spilled: u64,
}

impl OocMesher {
  pub fn new() -> Self {
    OocMesher {
      state: State::Empty,
      prune_threshold: 0.0,
      clumps: ClumpArena::new(),
      key_clump: HashMap::new(),
      total_vertices: 0,
      threshold_vertices: 0,
      chunks: Vec::new(),
      chunk_index: HashMap::new(),
      tmp: TmpWriterWorkerGroup::new(4),
      vertices_spilled: 0,
      triangles_spilled: 0,
    }
  }

  /// Number of passes the driver must feed. Always two: counting, emitting.
  pub fn num_passes(&self) -> u32 {
    2
  }

  /// Relative component size below which geometry is discarded. Zero
  /// disables pruning.
  pub fn set_prune_threshold(&mut self, threshold: f64) {
    assert!(
      (0.0..1.0).contains(&threshold),
      "invalid argument: prune threshold must lie in [0, 1)"
    );
    self.prune_threshold = threshold;
  }

  /// Enter the given pass. Pass [`PASS_EMIT`] may only follow a completed
  /// counting pass; it fixes the prune threshold and starts the spill
  /// writer.
  pub fn begin_pass(&mut self, pass: u32) -> Result<()> {
    match (pass, self.state) {
      (PASS_COUNT, State::Empty) => {
        self.state = State::Counting;
      }
      (PASS_EMIT, State::Counting) => {
        self.threshold_vertices = (self.prune_threshold * self.total_vertices as f64) as u64;
        // The pass barrier: every chunk's counts are final.
        for chunk in &mut self.chunks {
          assert_eq!(chunk.state, ChunkState::Counting);
          chunk.state = ChunkState::Counted;
        }
        self.tmp.start()?;
        self.state = State::Emitting;
      }
      (pass, state) => panic!("cannot enter pass {pass} from state {state:?}"),
    }
    Ok(())
  }

  /// Feed one tile mesh to the current pass.
  pub fn add(&mut self, work: &MesherWork) -> Result<()> {
    match self.state {
      State::Counting => {
        self.count(work);
        Ok(())
      }
      State::Emitting => self.emit(work),
      state => panic!("cannot add meshes in state {state:?}"),
    }
  }

  /// Local clump roots of a mesh, from its triangles.
  fn local_components(work: &MesherWork) -> LocalUf {
    let mut uf = LocalUf::new(work.mesh.vertices.len());
    for triangle in &work.mesh.triangles {
      uf.union(triangle[0], triangle[1]);
      uf.union(triangle[0], triangle[2]);
    }
    uf
  }

  /// Record slot for a chunk, creating it on first sight.
  fn ensure_chunk(&mut self, chunk_id: ChunkId) -> usize {
    match self.chunk_index.get(&chunk_id) {
      Some(&slot) => slot,
      None => {
        let slot = self.chunks.len();
        self.chunks.push(ChunkRecord {
          chunk_id,
          ..ChunkRecord::default()
        });
        self.chunk_index.insert(chunk_id, slot);
        slot
      }
    }
  }

  fn count(&mut self, work: &MesherWork) {
    let slot = self.ensure_chunk(work.chunk_id);
    let chunk = &mut self.chunks[slot];
    assert!(
      matches!(chunk.state, ChunkState::Empty | ChunkState::Counting),
      "chunk {:?} cannot count in state {:?}",
      chunk.chunk_id,
      chunk.state
    );
    chunk.state = ChunkState::Counting;

    let mesh = &work.mesh;
    let num_internal = mesh.num_internal as usize;
    let mut uf = Self::local_components(work);

    // One fresh clump per local component, counting its internal vertices.
    let mut internal_counts: HashMap<u32, u64> = HashMap::new();
    for local in 0..num_internal {
      *internal_counts.entry(uf.find(local as u32)).or_insert(0) += 1;
    }
    let mut rep: HashMap<u32, u32> = HashMap::new();
    for (root, count) in internal_counts {
      let clump = self.clumps.make_clump(count);
      self.total_vertices += count;
      rep.insert(root, clump);
    }

    // Externals: singleton clump per first-seen key, then merge into the
    // local component's clump.
    for (slot, &key) in mesh.external_keys.iter().enumerate() {
      let key_clump = match self.key_clump.get(&key) {
        Some(&clump) => clump,
        None => {
          let clump = self.clumps.make_clump(1);
          self.total_vertices += 1;
          self.key_clump.insert(key, clump);
          clump
        }
      };
      let root = uf.find((num_internal + slot) as u32);
      match rep.get(&root) {
        Some(&clump) => {
          let merged = self.clumps.union(clump, key_clump);
          rep.insert(root, merged);
        }
        None => {
          rep.insert(root, self.clumps.find(key_clump));
        }
      }
    }
  }

  fn emit(&mut self, work: &MesherWork) -> Result<()> {
    let chunk_slot = *self
      .chunk_index
      .get(&work.chunk_id)
      .unwrap_or_else(|| panic!("chunk {:?} skipped the counting pass", work.chunk_id));
    {
      let chunk = &mut self.chunks[chunk_slot];
      assert!(
        matches!(chunk.state, ChunkState::Counted | ChunkState::Emitting),
        "chunk {:?} cannot emit in state {:?}",
        chunk.chunk_id,
        chunk.state
      );
      chunk.state = ChunkState::Emitting;
    }

    let mesh = &work.mesh;
    let num_vertices = mesh.vertices.len();
    let num_internal = mesh.num_internal as usize;
    if num_vertices == 0 {
      return Ok(());
    }
    let mut uf = Self::local_components(work);

    // Component size per local root: global for components reaching an
    // external key, tile-local internal count otherwise (such a component
    // is entirely contained in this mesh).
    let mut internal_counts: HashMap<u32, u64> = HashMap::new();
    for local in 0..num_internal {
      *internal_counts.entry(uf.find(local as u32)).or_insert(0) += 1;
    }
    let mut component_size: HashMap<u32, u64> = internal_counts;
    for slot in 0..mesh.external_keys.len() {
      let root = uf.find((num_internal + slot) as u32);
      let key = mesh.external_keys[slot];
      let clump = *self
        .key_clump
        .get(&key)
        .expect("emitting pass saw a key the counting pass did not");
      let size = self.clumps.component_vertices(clump);
      component_size.insert(root, size);
    }

    let chunk = &mut self.chunks[chunk_slot];
    let mut item = self.tmp.get();

    // Assign chunk-local indices in emission order; externals dedup by key
    // across every mesh of the chunk.
    let mut local_index = vec![PRUNED; num_vertices];
    for local in 0..num_vertices {
      let root = uf.find(local as u32);
      if component_size[&root] < self.threshold_vertices {
        continue;
      }
      if local >= num_internal {
        let key = mesh.external_keys[local - num_internal];
        if let Some(&index) = chunk.external_index.get(&key) {
          local_index[local] = index;
          continue;
        }
        chunk.external_index.insert(key, chunk.next_vertex);
      }
      local_index[local] = chunk.next_vertex;
      chunk.next_vertex += 1;
      item.vertices.push(mesh.vertices[local]);
    }

    for triangle in &mesh.triangles {
      let mapped = [
        local_index[triangle[0] as usize],
        local_index[triangle[1] as usize],
        local_index[triangle[2] as usize],
      ];
      if mapped[0] == PRUNED {
        // The whole triangle lives in a pruned component.
        continue;
      }
      item.triangles.push(mapped);
    }

    // Record which spill ranges belong to this chunk. The writer persists
    // items in push order, so the global element offsets are deterministic.
    let new_vertices = item.vertices.len() as u64;
    let new_triangles = item.triangles.len() as u64;
    if new_vertices > 0 {
      item.vertex_ranges.push((0, new_vertices as usize));
      chunk
        .vertex_ranges
        .push((self.vertices_spilled, self.vertices_spilled + new_vertices));
      self.vertices_spilled += new_vertices;
    }
    if new_triangles > 0 {
      item.triangle_ranges.push((0, new_triangles as usize));
      chunk
        .triangle_ranges
        .push((self.triangles_spilled, self.triangles_spilled + new_triangles));
      self.triangles_spilled += new_triangles;
      chunk.num_triangles += new_triangles;
    }
    self.tmp.push(item);
    Ok(())
  }

  /// Finalise: write one PLY per chunk with retained triangles. Returns the
  /// number of files written.
  pub fn write(&mut self, writer: &mut dyn PlyWriter, namer: &Namer) -> Result<u64> {
    assert_eq!(
      self.state,
      State::Emitting,
      "write requires a completed emitting pass"
    );
    self.tmp.stop()?;

    let result = self.write_chunks(writer, namer);
    self.tmp.remove_files();
    match result {
      Ok(files) => {
        self.state = State::Written;
        Ok(files)
      }
      Err(err) => {
        writer.abort();
        Err(err)
      }
    }
  }

  fn write_chunks(&mut self, writer: &mut dyn PlyWriter, namer: &Namer) -> Result<u64> {
    let vertices_path = self.tmp.vertices_path().expect("spill files exist").to_path_buf();
    let triangles_path = self.tmp.triangles_path().expect("spill files exist").to_path_buf();
    let mut vertex_reader = TmpFileReader::open(&vertices_path)?;
    let mut triangle_reader = TmpFileReader::open(&triangles_path)?;

    let mut files_written = 0;
    let mut block_vertices: Vec<[f32; 3]> = Vec::new();
    let mut block_triangles: Vec<[u32; 3]> = Vec::new();

    for chunk in &mut self.chunks {
      if chunk.num_triangles == 0 {
        // Pruned away: no file is opened and the chunk terminates here.
        metrics::global().add_counter("mesher.chunks_empty", 1);
        continue;
      }
      assert_eq!(chunk.state, ChunkState::Emitting);
      writer.set_num_vertices(chunk.next_vertex as u64);
      writer.set_num_triangles(chunk.num_triangles);
      writer.open(&namer.name(&chunk.chunk_id))?;

      let mut written = 0u64;
      for &(first, last) in &chunk.vertex_ranges {
        let mut cursor = first;
        while cursor < last {
          let count = ((last - cursor) as usize).min(WRITE_BLOCK);
          vertex_reader.read_vertices(cursor, count, &mut block_vertices)?;
          writer.write_vertices(written, &block_vertices)?;
          written += count as u64;
          cursor += count as u64;
        }
      }

      let mut written = 0u64;
      for &(first, last) in &chunk.triangle_ranges {
        let mut cursor = first;
        while cursor < last {
          let count = ((last - cursor) as usize).min(WRITE_BLOCK);
          triangle_reader.read_triangles(cursor, count, &mut block_triangles)?;
          writer.write_triangles(written, &block_triangles)?;
          written += count as u64;
          cursor += count as u64;
        }
      }

      writer.close()?;
      chunk.state = ChunkState::Written;
      files_written += 1;
      metrics::global().add_sample("mesher.chunk_vertices", chunk.next_vertex as f64);
      metrics::global().add_sample("mesher.chunk_triangles", chunk.num_triangles as f64);
    }
    Ok(files_written)
  }

  /// Total distinct vertices seen by the counting pass.
  pub fn total_vertices(&self) -> u64 {
    self.total_vertices
  }

  /// Persist the counting-pass state so a rerun can skip pass 0.
  pub fn save_checkpoint(&self, path: &Path) -> Result<()> {
    assert_eq!(
      self.state,
      State::Counting,
      "checkpoints capture the completed counting pass"
    );
    let checkpoint = Checkpoint {
      clumps: self.clumps.clone(),
      key_clump: self.key_clump.clone(),
      total_vertices: self.total_vertices,
      chunks: self.chunks.iter().map(|c| c.chunk_id).collect(),
    };
    let bytes = bincode::serialize(&checkpoint)
      .map_err(|e| crate::error::Error::InvalidInput(format!("cannot encode checkpoint: {e}")))?;
    std::fs::write(path, bytes)?;
    Ok(())
  }

  /// Rebuild a mesher from a checkpoint, ready for [`PASS_EMIT`].
  pub fn load_checkpoint(path: &Path) -> Result<Self> {
    let bytes = std::fs::read(path)?;
    let checkpoint: Checkpoint = bincode::deserialize(&bytes)
      .map_err(|e| crate::error::Error::InvalidInput(format!("cannot decode checkpoint: {e}")))?;
    let mut mesher = OocMesher::new();
    mesher.clumps = checkpoint.clumps;
    mesher.key_clump = checkpoint.key_clump;
    mesher.total_vertices = checkpoint.total_vertices;
    for chunk_id in checkpoint.chunks {
      let slot = mesher.ensure_chunk(chunk_id);
      mesher.chunks[slot].state = ChunkState::Counting;
    }
    mesher.state = State::Counting;
    Ok(mesher)
  }
}

impl Default for OocMesher {
  fn default() -> Self {
    OocMesher::new()
  }
}
