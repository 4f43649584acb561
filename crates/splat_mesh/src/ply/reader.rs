//! PLY splat input.
//!
//! Parses enough of the header to locate the seven required float32 vertex
//! properties (`x y z nx ny nz radius`) and then serves random-access record
//! ranges. Unknown properties are skipped via the record stride; unknown
//! elements after the vertex element are ignored entirely.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::Splat;

/// Properties every input file must provide, in the order we store offsets.
const REQUIRED: [&str; 7] = ["x", "y", "z", "nx", "ny", "nz", "radius"];

/// Parsed metadata of one input PLY file.
#[derive(Clone, Debug)]
pub struct PlyReader {
  path: PathBuf,
  num_vertices: u64,
  stride: usize,
  /// Byte offsets of the required properties within one record.
  offsets: [usize; 7],
  data_offset: u64,
}

fn scalar_size(type_name: &str) -> Option<usize> {
  match type_name {
    "char" | "int8" | "uchar" | "uint8" => Some(1),
    "short" | "int16" | "ushort" | "uint16" => Some(2),
    "int" | "int32" | "uint" | "uint32" | "float" | "float32" => Some(4),
    "double" | "float64" | "int64" | "uint64" => Some(8),
    _ => None,
  }
}

fn is_float32(type_name: &str) -> bool {
  matches!(type_name, "float" | "float32")
}

impl PlyReader {
  /// Open a file and parse its header.
  pub fn open(path: &Path) -> Result<Self> {
    let format_error = |reason: &str| Error::Format {
      path: path.to_path_buf(),
      reason: reason.to_string(),
    };

    let mut file = File::open(path)?;
    // Headers are textual and short; 64 KiB is far beyond any sane header.
    let mut prefix = vec![0u8; 64 * 1024];
    let mut filled = 0;
    while filled < prefix.len() {
      let n = file.read(&mut prefix[filled..])?;
      if n == 0 {
        break;
      }
      filled += n;
    }
    prefix.truncate(filled);

    let end_marker = b"end_header\n";
    let header_end = prefix
      .windows(end_marker.len())
      .position(|w| w == end_marker)
      .ok_or_else(|| format_error("missing end_header"))?
      + end_marker.len();
    let header = std::str::from_utf8(&prefix[..header_end])
      .map_err(|_| format_error("header is not valid text"))?;

    let mut lines = header.lines().map(|l| l.trim_end_matches('\r'));
    if lines.next() != Some("ply") {
      return Err(format_error("not a PLY file"));
    }

    let mut num_vertices: Option<u64> = None;
    let mut stride = 0usize;
    let mut offsets = [usize::MAX; 7];
    let mut in_vertex_element = false;
    let mut saw_format = false;

    for line in lines {
      let mut tokens = line.split_whitespace();
      match tokens.next() {
        Some("format") => {
          let rest: Vec<&str> = tokens.collect();
          if rest != ["binary_little_endian", "1.0"] {
            return Err(format_error("only binary_little_endian 1.0 is supported"));
          }
          saw_format = true;
        }
        Some("comment") | Some("obj_info") => {}
        Some("element") => {
          let kind = tokens.next().ok_or_else(|| format_error("bad element line"))?;
          if kind == "vertex" {
            if num_vertices.is_some() {
              return Err(format_error("duplicate vertex element"));
            }
            let count = tokens
              .next()
              .and_then(|t| t.parse::<u64>().ok())
              .ok_or_else(|| format_error("bad vertex count"))?;
            num_vertices = Some(count);
            in_vertex_element = true;
          } else {
            // Records of later elements live after all the vertices, so
            // they can simply be ignored. An element before the vertices
            // would shift the payload and is rejected.
            if num_vertices.is_none() {
              return Err(format_error("vertex element must come first"));
            }
            in_vertex_element = false;
          }
        }
        Some("property") if in_vertex_element => {
          let type_name = tokens.next().ok_or_else(|| format_error("bad property line"))?;
          if type_name == "list" {
            return Err(format_error("list property in vertex element"));
          }
          let size =
            scalar_size(type_name).ok_or_else(|| format_error("unknown property type"))?;
          let name = tokens.next().ok_or_else(|| format_error("bad property line"))?;
          if let Some(slot) = REQUIRED.iter().position(|&r| r == name) {
            if !is_float32(type_name) {
              return Err(format_error("required properties must be float32"));
            }
            offsets[slot] = stride;
          }
          stride += size;
        }
        Some("property") => {}
        Some("end_header") => break,
        _ => return Err(format_error("unrecognised header line")),
      }
    }

    if !saw_format {
      return Err(format_error("missing format line"));
    }
    let num_vertices = num_vertices.ok_or_else(|| format_error("missing vertex element"))?;
    if offsets.contains(&usize::MAX) {
      return Err(format_error("missing one of x y z nx ny nz radius"));
    }

    Ok(PlyReader {
      path: path.to_path_buf(),
      num_vertices,
      stride,
      offsets,
      data_offset: header_end as u64,
    })
  }

  /// Number of splat records in the file (finite or not).
  pub fn len(&self) -> u64 {
    self.num_vertices
  }

  pub fn is_empty(&self) -> bool {
    self.num_vertices == 0
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Bytes per record, used to size read buffers.
  pub fn record_size(&self) -> usize {
    self.stride
  }

  /// Open an independent read handle. Each stream owns its own handle so
  /// concurrent streams never share file positions.
  pub fn create_handle(&self) -> Result<PlyReadHandle> {
    Ok(PlyReadHandle {
      meta: self.clone(),
      file: File::open(&self.path)?,
      scratch: Vec::new(),
    })
  }
}

/// Random-access reader over one file's splat records.
pub struct PlyReadHandle {
  meta: PlyReader,
  file: File,
  scratch: Vec<u8>,
}

impl PlyReadHandle {
  /// Read records `first .. first + out.len()` into `out`.
  pub fn read(&mut self, first: u64, out: &mut [Splat]) -> Result<()> {
    let count = out.len() as u64;
    assert!(
      first + count <= self.meta.num_vertices,
      "record range out of range"
    );
    let stride = self.meta.stride;
    self.scratch.resize(stride * out.len(), 0);
    self
      .file
      .seek(SeekFrom::Start(self.meta.data_offset + first * stride as u64))?;
    self.file.read_exact(&mut self.scratch)?;

    let field = |record: &[u8], slot: usize| {
      let at = self.meta.offsets[slot];
      f32::from_le_bytes(record[at..at + 4].try_into().unwrap())
    };
    for (record, splat) in self.scratch.chunks_exact(stride).zip(out.iter_mut()) {
      let position = [field(record, 0), field(record, 1), field(record, 2)];
      let normal = [field(record, 3), field(record, 4), field(record, 5)];
      let radius = field(record, 6);
      *splat = Splat::from_file_record(position, normal, radius);
    }
    Ok(())
  }
}

#[cfg(test)]
#[path = "reader_test.rs"]
mod reader_test;
