//! PLY mesh output.
//!
//! Writers are told their vertex and triangle counts before `open`, because
//! the PLY header encodes them and the file is laid out up front. The mesher
//! then streams blocks of vertices and triangles into the reserved regions.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;

/// Bytes per triangle record: u8 list count plus three u32 indices.
const TRIANGLE_RECORD: u64 = 1 + 3 * 4;
/// Bytes per vertex record: three f32 coordinates.
const VERTEX_RECORD: u64 = 3 * 4;

/// Sink for finished meshes, one output file at a time.
pub trait PlyWriter {
  /// Set the vertex count of the next file. Must precede `open`.
  fn set_num_vertices(&mut self, n: u64);

  /// Set the triangle count of the next file. Must precede `open`.
  fn set_num_triangles(&mut self, n: u64);

  /// Begin a new output file.
  fn open(&mut self, name: &str) -> Result<()>;

  /// Store `data` as vertices `first .. first + data.len()`.
  fn write_vertices(&mut self, first: u64, data: &[[f32; 3]]) -> Result<()>;

  /// Store `data` as triangles `first .. first + data.len()`.
  fn write_triangles(&mut self, first: u64, data: &[[u32; 3]]) -> Result<()>;

  /// Finish the current file.
  fn close(&mut self) -> Result<()>;

  /// Discard the current file, if any. Used when a stage aborts so partial
  /// outputs never survive.
  fn abort(&mut self);
}

fn header(num_vertices: u64, num_triangles: u64) -> String {
  format!(
    "ply\n\
     format binary_little_endian 1.0\n\
     element vertex {num_vertices}\n\
     property float32 x\n\
     property float32 y\n\
     property float32 z\n\
     element face {num_triangles}\n\
     property list uint8 uint32 vertex_indices\n\
     end_header\n"
  )
}

/// Writes real PLY files. Partial files are removed on `abort`.
pub struct FilePlyWriter {
  num_vertices: u64,
  num_triangles: u64,
  state: Option<OpenFile>,
}

struct OpenFile {
  path: PathBuf,
  file: BufWriter<File>,
  vertex_base: u64,
  triangle_base: u64,
}

impl FilePlyWriter {
  pub fn new() -> Self {
    FilePlyWriter {
      num_vertices: 0,
      num_triangles: 0,
      state: None,
    }
  }
}

impl Default for FilePlyWriter {
  fn default() -> Self {
    FilePlyWriter::new()
  }
}

impl PlyWriter for FilePlyWriter {
  fn set_num_vertices(&mut self, n: u64) {
    assert!(self.state.is_none(), "cannot resize an open file");
    self.num_vertices = n;
  }

  fn set_num_triangles(&mut self, n: u64) {
    assert!(self.state.is_none(), "cannot resize an open file");
    self.num_triangles = n;
  }

  fn open(&mut self, name: &str) -> Result<()> {
    assert!(self.state.is_none(), "writer is already open");
    let path = Path::new(name).to_path_buf();
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }
    let file = OpenOptions::new()
      .write(true)
      .create(true)
      .truncate(true)
      .open(&path)?;
    let mut file = BufWriter::new(file);
    let header = header(self.num_vertices, self.num_triangles);
    file.write_all(header.as_bytes())?;
    let vertex_base = header.len() as u64;
    let triangle_base = vertex_base + self.num_vertices * VERTEX_RECORD;
    // Reserve the full payload so out-of-order block writes are legal.
    let file_end = triangle_base + self.num_triangles * TRIANGLE_RECORD;
    file.get_ref().set_len(file_end)?;
    self.state = Some(OpenFile {
      path,
      file,
      vertex_base,
      triangle_base,
    });
    Ok(())
  }

  fn write_vertices(&mut self, first: u64, data: &[[f32; 3]]) -> Result<()> {
    let state = self.state.as_mut().expect("writer is not open");
    assert!(first + data.len() as u64 <= self.num_vertices, "vertex block out of range");
    state
      .file
      .seek(SeekFrom::Start(state.vertex_base + first * VERTEX_RECORD))?;
    let mut block = Vec::with_capacity(data.len() * VERTEX_RECORD as usize);
    for vertex in data {
      for coord in vertex {
        block.extend_from_slice(&coord.to_le_bytes());
      }
    }
    state.file.write_all(&block)?;
    Ok(())
  }

  fn write_triangles(&mut self, first: u64, data: &[[u32; 3]]) -> Result<()> {
    let state = self.state.as_mut().expect("writer is not open");
    assert!(
      first + data.len() as u64 <= self.num_triangles,
      "triangle block out of range"
    );
    state
      .file
      .seek(SeekFrom::Start(state.triangle_base + first * TRIANGLE_RECORD))?;
    let mut block = Vec::with_capacity(data.len() * TRIANGLE_RECORD as usize);
    for triangle in data {
      block.push(3u8);
      for index in triangle {
        block.extend_from_slice(&index.to_le_bytes());
      }
    }
    state.file.write_all(&block)?;
    Ok(())
  }

  fn close(&mut self) -> Result<()> {
    let state = self.state.take().expect("writer is not open");
    let mut file = state.file;
    file.flush()?;
    Ok(())
  }

  fn abort(&mut self) {
    if let Some(state) = self.state.take() {
      drop(state.file);
      let _ = std::fs::remove_file(&state.path);
    }
  }
}

/// Keeps outputs in memory instead of on disk. Used by tests and by the
/// checkpoint validator; mirrors the file writer's contract exactly.
#[derive(Default)]
pub struct MemoryPlyWriter {
  num_vertices: u64,
  num_triangles: u64,
  current: Option<(String, MemoryOutput)>,
  outputs: HashMap<String, MemoryOutput>,
}

/// One finished in-memory file.
#[derive(Clone, Debug, Default)]
pub struct MemoryOutput {
  pub vertices: Vec<[f32; 3]>,
  pub triangles: Vec<[u32; 3]>,
}

impl MemoryPlyWriter {
  pub fn new() -> Self {
    MemoryPlyWriter::default()
  }

  /// Output written under `name`, or `None` when no such file was produced.
  pub fn output(&self, name: &str) -> Option<&MemoryOutput> {
    self.outputs.get(name)
  }

  pub fn num_outputs(&self) -> usize {
    self.outputs.len()
  }
}

impl PlyWriter for MemoryPlyWriter {
  fn set_num_vertices(&mut self, n: u64) {
    assert!(self.current.is_none(), "cannot resize an open file");
    self.num_vertices = n;
  }

  fn set_num_triangles(&mut self, n: u64) {
    assert!(self.current.is_none(), "cannot resize an open file");
    self.num_triangles = n;
  }

  fn open(&mut self, name: &str) -> Result<()> {
    assert!(self.current.is_none(), "writer is already open");
    let output = MemoryOutput {
      vertices: vec![[f32::MIN; 3]; self.num_vertices as usize],
      triangles: vec![[u32::MAX; 3]; self.num_triangles as usize],
    };
    self.current = Some((name.to_string(), output));
    Ok(())
  }

  fn write_vertices(&mut self, first: u64, data: &[[f32; 3]]) -> Result<()> {
    let (_, output) = self.current.as_mut().expect("writer is not open");
    let first = first as usize;
    output.vertices[first..first + data.len()].copy_from_slice(data);
    Ok(())
  }

  fn write_triangles(&mut self, first: u64, data: &[[u32; 3]]) -> Result<()> {
    let (_, output) = self.current.as_mut().expect("writer is not open");
    let first = first as usize;
    output.triangles[first..first + data.len()].copy_from_slice(data);
    Ok(())
  }

  fn close(&mut self) -> Result<()> {
    let (name, output) = self.current.take().expect("writer is not open");
    self.outputs.insert(name, output);
    Ok(())
  }

  fn abort(&mut self) {
    self.current = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_memory_writer_roundtrip() {
    let mut writer = MemoryPlyWriter::new();
    writer.set_num_vertices(3);
    writer.set_num_triangles(1);
    writer.open("out.ply").unwrap();
    writer
      .write_vertices(0, &[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]])
      .unwrap();
    writer.write_triangles(0, &[[0, 1, 2]]).unwrap();
    writer.close().unwrap();

    let output = writer.output("out.ply").expect("file must exist");
    assert_eq!(output.vertices.len(), 3);
    assert_eq!(output.triangles, vec![[0, 1, 2]]);
    assert!(writer.output("missing.ply").is_none());
  }

  #[test]
  fn test_file_writer_layout() {
    let dir = std::env::temp_dir().join(format!("splat_mesh_ply_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("tri.ply");
    let name = path.to_str().unwrap();

    let mut writer = FilePlyWriter::new();
    writer.set_num_vertices(3);
    writer.set_num_triangles(1);
    writer.open(name).unwrap();
    writer
      .write_vertices(0, &[[0.5, 0.0, 0.0], [0.0, 0.5, 0.0], [0.0, 0.0, 0.5]])
      .unwrap();
    writer.write_triangles(0, &[[2, 1, 0]]).unwrap();
    writer.close().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    let header_end = bytes
      .windows(11)
      .position(|w| w == b"end_header\n")
      .map(|p| p + 11)
      .unwrap();
    let payload = &bytes[header_end..];
    assert_eq!(payload.len(), 3 * 12 + 13);
    assert_eq!(f32::from_le_bytes(payload[0..4].try_into().unwrap()), 0.5);
    // Triangle record: count byte then three little-endian u32 indices.
    let tri = &payload[36..];
    assert_eq!(tri[0], 3);
    assert_eq!(u32::from_le_bytes(tri[1..5].try_into().unwrap()), 2);

    std::fs::remove_file(&path).unwrap();
    let _ = std::fs::remove_dir(&dir);
  }

  #[test]
  fn test_file_writer_abort_removes_file() {
    let dir = std::env::temp_dir().join(format!("splat_mesh_ply_abort_{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("partial.ply");

    let mut writer = FilePlyWriter::new();
    writer.set_num_vertices(1);
    writer.set_num_triangles(0);
    writer.open(path.to_str().unwrap()).unwrap();
    writer.abort();
    assert!(!path.exists());
    let _ = std::fs::remove_dir(&dir);
  }
}
