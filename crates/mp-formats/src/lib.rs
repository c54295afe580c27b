//! Module codecs for modpack.
//!
//! Loads and saves ProTracker MOD and The Player 6.1A byte images.
//! All input is consumed from in-memory buffers and all output is
//! appended to a caller-owned `Vec<u8>`; no I/O happens here.

use std::fmt;

mod options;
mod player61a;
mod protracker;
mod reader;

pub use options::Options;
pub use player61a::{load_p61a, save_p61a};
pub use protracker::{load_mod, save_mod, PATTERN_SIZE};
pub use reader::ByteReader;

/// Error type for module codecs.
#[derive(Debug)]
pub enum FormatError {
    /// Input ended in the middle of a structure
    UnexpectedEof,
    /// A structural invariant of the format was violated
    Malformed(&'static str),
    /// Unrecognized magic bytes or format name
    Unsupported(String),
    /// Option accepted on the surface but without an implementation
    Unimplemented(&'static str),
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FormatError::UnexpectedEof => write!(f, "premature end of data"),
            FormatError::Malformed(what) => write!(f, "malformed input: {}", what),
            FormatError::Unsupported(what) => write!(f, "unsupported format: {}", what),
            FormatError::Unimplemented(what) => write!(f, "not implemented: {}", what),
        }
    }
}

impl std::error::Error for FormatError {}
