//! Output file naming.

use crate::types::ChunkId;

/// Maps a chunk identity to an output file name.
#[derive(Clone, Debug)]
pub enum Namer {
  /// Always the configured file name (single-output mode).
  Trivial(String),
  /// `{base}_XXXX_YYYY_ZZZZ.ply` from the chunk coordinates. Fields are
  /// zero-padded to four digits and widen when a coordinate needs more.
  Chunked(String),
}

impl Namer {
  pub fn name(&self, chunk_id: &ChunkId) -> String {
    match self {
      Namer::Trivial(name) => name.clone(),
      Namer::Chunked(base) => format!(
        "{}_{:04}_{:04}_{:04}.ply",
        base, chunk_id.coords[0], chunk_id.coords[1], chunk_id.coords[2]
      ),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_trivial() {
    let namer = Namer::Trivial("foo.ply".to_string());
    let chunk = ChunkId::new(123, [1, 2, 3]);
    assert_eq!(namer.name(&chunk), "foo.ply");
  }

  #[test]
  fn test_chunked() {
    let namer = Namer::Chunked("foo".to_string());
    let chunk = ChunkId::new(123, [0, 5, 3000]);
    assert_eq!(namer.name(&chunk), "foo_0000_0005_3000.ply");
  }

  #[test]
  fn test_chunked_wide_fields() {
    let namer = Namer::Chunked("foo".to_string());
    let chunk = ChunkId::new(123, [100, 123456, 2345678]);
    assert_eq!(namer.name(&chunk), "foo_0100_123456_2345678.ply");
  }
}
