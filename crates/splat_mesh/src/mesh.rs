//! Per-tile mesh container with the internal/external vertex partition.
//!
//! Internal vertices exist in exactly one tile and are stored first;
//! external vertices sit on tile boundaries and carry 64-bit keys that are
//! stable across tiles, so the mesher can weld them. Triangle indices refer
//! to the combined ordering (internals, then externals).

use serde::{Deserialize, Serialize};

use crate::marching::MeshData;
use crate::types::ChunkId;

/// Vertex and triangle counts of one tile mesh.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSizes {
  pub num_vertices: u64,
  pub num_triangles: u64,
  pub num_internal: u64,
}

impl MeshSizes {
  pub fn new(num_vertices: u64, num_triangles: u64, num_internal: u64) -> Self {
    assert!(num_internal <= num_vertices, "more internals than vertices");
    MeshSizes {
      num_vertices,
      num_triangles,
      num_internal,
    }
  }

  pub fn num_external(&self) -> u64 {
    self.num_vertices - self.num_internal
  }

  /// Approximate host memory this mesh occupies, for queue budgets.
  pub fn host_bytes(&self) -> usize {
    (self.num_vertices * 12 + self.num_external() * 8 + self.num_triangles * 12) as usize
  }
}

/// One tile's mesh, partitioned and keyed for cross-tile welding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HostKeyMesh {
  /// Vertex positions, internals first.
  pub vertices: Vec<[f32; 3]>,
  /// Keys of the external vertices (parallel to the external tail of
  /// `vertices`).
  pub external_keys: Vec<u64>,
  /// Number of internal vertices at the front of `vertices`.
  pub num_internal: u64,
  /// Triangles over the combined vertex numbering.
  pub triangles: Vec<[u32; 3]>,
}

impl HostKeyMesh {
  pub fn sizes(&self) -> MeshSizes {
    MeshSizes::new(
      self.vertices.len() as u64,
      self.triangles.len() as u64,
      self.num_internal,
    )
  }

  pub fn num_external(&self) -> u64 {
    self.vertices.len() as u64 - self.num_internal
  }

  pub fn is_empty(&self) -> bool {
    self.triangles.is_empty()
  }

  /// Check the triangle indices against the vertex count.
  pub fn validate(&self) {
    let count = self.vertices.len() as u32;
    for triangle in &self.triangles {
      for &index in triangle {
        assert!(index < count, "triangle index {index} out of range");
      }
    }
  }

  /// Partition raw extractor output into internals-first order.
  pub fn from_mesh_data(data: MeshData) -> Self {
    let num_vertices = data.vertices.len();
    let num_internal = data.external.iter().filter(|&&e| !e).count();

    let mut remap = vec![0u32; num_vertices];
    let mut vertices = Vec::with_capacity(num_vertices);
    let mut external_keys = Vec::with_capacity(num_vertices - num_internal);

    let mut next = 0u32;
    for (index, &external) in data.external.iter().enumerate() {
      if !external {
        remap[index] = next;
        next += 1;
        vertices.push(data.vertices[index]);
      }
    }
    for (index, &external) in data.external.iter().enumerate() {
      if external {
        remap[index] = next;
        next += 1;
        vertices.push(data.vertices[index]);
        external_keys.push(data.keys[index]);
      }
    }

    let triangles = data
      .triangles
      .iter()
      .map(|t| [remap[t[0] as usize], remap[t[1] as usize], remap[t[2] as usize]])
      .collect();

    HostKeyMesh {
      vertices,
      external_keys,
      num_internal: num_internal as u64,
      triangles,
    }
  }
}

/// One unit of mesher input: a tile mesh tagged with its output chunk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MesherWork {
  pub chunk_id: ChunkId,
  pub mesh: HostKeyMesh,
}
