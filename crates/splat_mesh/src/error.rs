//! Error types for recoverable failures.
//!
//! Caller misuse (bad bucket sizes, non-power-of-two cell sides, appends past
//! the 64-bit index space) is a programmer error and panics; it is never
//! represented here. `Error` covers the failures a correct caller can still
//! hit: I/O, malformed input files, unusable data sets and cooperative
//! cancellation.

use std::path::PathBuf;

/// Recoverable pipeline error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// Underlying file or stream failure.
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// A PLY file did not match the expected format.
  #[error("malformed PLY file {path}: {reason}")]
  Format { path: PathBuf, reason: String },

  /// The input data cannot be meshed (e.g. no finite splats at all).
  #[error("invalid input: {0}")]
  InvalidInput(String),

  /// A worker observed the stop token and abandoned its work.
  #[error("operation cancelled")]
  Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
