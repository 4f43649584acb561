//! PLY input and output.
//!
//! Input files are `binary_little_endian 1.0` point clouds whose vertex
//! element carries at least `x, y, z, nx, ny, nz, radius` as 32-bit floats;
//! additional properties are tolerated and skipped. Output files carry bare
//! `x, y, z` vertices and a 32-bit-index triangle list.

pub mod namer;
pub mod reader;
pub mod writer;

pub use namer::Namer;
pub use reader::{PlyReadHandle, PlyReader};
pub use writer::{FilePlyWriter, MemoryPlyWriter, PlyWriter};
