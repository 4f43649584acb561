//! splat_mesh - Out-of-core surface reconstruction from oriented splats.
//!
//! Rebuilds a single triangle mesh from very large, unordered collections of
//! oriented point samples (centre, radius, normal, quality), scaling to
//! inputs that do not fit in memory.
//!
//! # Pipeline
//!
//! ```text
//! ┌───────────┐   ┌──────────┐   ┌─────────┐   ┌───────────────┐   ┌────────┐
//! │ splat set ├──►│ bucketer ├──►│ loaders ├──►│ device workers├──►│ mesher │
//! │ (streams) │   │ (octree) │   │  (I/O)  │   │ (tree + MT)   │   │ (weld) │
//! └───────────┘   └──────────┘   └─────────┘   └───────────────┘   └────────┘
//! ```
//!
//! - [`splat_set`]: lazy splat and blob streams over PLY files or memory,
//!   with a precomputed blob index for fast bucketing.
//! - [`bucket`]: recursive decomposition of the voxel grid into tiles that
//!   fit a splat budget, plus chunk assignment for split output.
//! - [`splat_tree`] / [`mls`]: per-tile octree and the corner density field.
//! - [`marching`]: marching-tetrahedra extraction with stable 64-bit edge
//!   keys for every vertex on a tile boundary.
//! - [`mesher`]: the two-pass out-of-core welder and pruner.
//! - [`pipeline`]: the staged producer/consumer run tying it all together.
//!
//! The library never allocates proportionally to the input size: splats are
//! streamed, tile meshes are bounded by the device budget, and the mesher
//! spills emitted geometry to temporary files.

pub mod bucket;
pub mod circular_buffer;
pub mod error;
pub mod grid;
pub mod marching;
pub mod mesh;
pub mod mesher;
pub mod metrics;
pub mod mls;
pub mod ply;
pub mod progress;
pub mod range;
pub mod splat_set;
pub mod splat_tree;
pub mod timeplot;
pub mod types;
pub mod work_queue;

pub mod pipeline;

// Re-export the types a driver needs.
pub use error::{Error, Result};
pub use grid::Grid;
pub use mesh::{HostKeyMesh, MesherWork, MeshSizes};
pub use mesher::OocMesher;
pub use pipeline::{reconstruct, PipelineParams, PipelineStats};
pub use ply::{FilePlyWriter, Namer, PlyReader, PlyWriter};
pub use splat_set::{FastBlobSet, FileSet, SplatSet, VectorSet};
pub use types::{ChunkId, Splat, SplatId};
