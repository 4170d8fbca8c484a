//! Decompressor for "CM" streams, which carry their own decompression routine
//! as 16-bit real-mode x86 code.
//!
//! A stream is a sequence of compressed blocks followed by the decompressor
//! image. There is no built-in decompression algorithm here: instead, the
//! image is loaded into a small emulated real-mode machine (see the `cpu` and
//! `memory` modules) and called once per block, according to the calling
//! convention documented in the `harness` module. The machine state after each
//! call is checked before its output is accepted, so a broken or hostile
//! decompressor can cause an error but cannot produce a truncated or
//! inconsistent result.
//!
//! See the `stream` module for the container format.
//!
//! # Example
//!
//! ```no_run
//! let input = std::fs::read("data.cm").unwrap();
//! if cmunpack::is_container_format(&input) {
//!     let output = cmunpack::decompress(&input).unwrap();
//!     std::fs::write("data", output).unwrap();
//! }
//! ```
//!
//! # Inconsistencies
//!
//! - The decompressor may consume one byte more than the block's compressed
//!   length without error; some decompressors read one byte ahead.
//! - There is no instruction budget unless `Options::max_steps` is set. A
//!   decompressor that never returns hangs `decompress`.

use std::fmt;

#[macro_use]
mod debug;
pub use debug::set_verbosity;

pub mod cpu;
pub mod cursor;
pub mod harness;
pub mod memory;
mod pointer;
pub use pointer::Pointer;
pub mod stream;

use cursor::Overrun;
use harness::{ExecutionError, Harness, SetupError};
use memory::MapError;
use stream::{Container, FormatError};

pub use stream::is_container_format;

/// Tunables for `decompress_with`. The `Default` value is what `decompress`
/// uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Options {
    /// Give up on a block after this many instructions. `None` means run
    /// until the decompressor halts, however long that takes.
    pub max_steps: Option<u64>,
}

/// Broad classification of an `Error`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The input ended early.
    Overrun,
    /// The input is structurally invalid.
    Malformed,
    /// The decompressor image is too big for the code region.
    Capacity,
    /// The decompressor did not return to its caller.
    UnexpectedHalt,
    /// The decompressor returned with carry set.
    DecompressionFailed,
    /// The decompressor consumed or produced the wrong number of bytes.
    LengthMismatch,
    /// The fixed memory layout is inconsistent. Never caused by input.
    Layout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A container format error.
    Format(FormatError),
    /// The decompressor image is `len` bytes but only `available` fit.
    Capacity { len: usize, available: usize },
    /// The memory layout could not be mapped.
    Layout(MapError),
    /// The decompressor misbehaved on the block at `offset`.
    Execution { offset: usize, err: ExecutionError },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Format(FormatError::Overrun(_)) => ErrorKind::Overrun,
            Error::Format(_) => ErrorKind::Malformed,
            Error::Capacity { .. } => ErrorKind::Capacity,
            Error::Layout(_) => ErrorKind::Layout,
            Error::Execution { err, .. } => match err {
                ExecutionError::UnexpectedHalt { .. } => ErrorKind::UnexpectedHalt,
                ExecutionError::DecompressionFailed => ErrorKind::DecompressionFailed,
                ExecutionError::LengthMismatch { .. } => ErrorKind::LengthMismatch,
            },
        }
    }
}

impl std::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Format(err) => err.fmt(f),
            Error::Capacity { len, available } =>
                write!(f, "decompressor is {} bytes long, but only {} bytes of code space are available", len, available),
            Error::Layout(err) => write!(f, "memory layout: {}", err),
            Error::Execution { offset, err } => write!(f, "block at offset {}: {}", offset, err),
        }
    }
}

impl From<FormatError> for Error {
    fn from(err: FormatError) -> Self {
        Error::Format(err)
    }
}

impl From<Overrun> for Error {
    fn from(err: Overrun) -> Self {
        Error::Format(FormatError::Overrun(err))
    }
}

impl From<MapError> for Error {
    fn from(err: MapError) -> Self {
        Error::Layout(err)
    }
}

impl From<SetupError> for Error {
    fn from(err: SetupError) -> Self {
        match err {
            SetupError::Capacity { len, available } => Error::Capacity { len, available },
            SetupError::Layout(err) => Error::Layout(err),
        }
    }
}

/// Decompresses a whole stream with default `Options`.
pub fn decompress(buf: &[u8]) -> Result<Vec<u8>, Error> {
    decompress_with(buf, &Options::default())
}

/// Decompresses a whole stream. Either every block decompresses and the
/// result is their concatenation, or there is an error and no output.
pub fn decompress_with(buf: &[u8], options: &Options) -> Result<Vec<u8>, Error> {
    let container = Container::parse(buf)?;
    let image = container.image();
    debug!("decompressor: {} paragraphs, entry {:#06x}", image.len_paragraphs, image.entry);

    let mut harness = Harness::new(image, options)?;
    let mut output = Vec::new();
    for block in container.blocks() {
        let block = block?;
        let result = harness.run_block(&block)?;
        result.check(&block)
            .map_err(|err| Error::Execution { offset: block.offset, err })?;
        output.extend_from_slice(harness.output(block.uncompressed_len));
    }
    debug!("decompressed {} bytes", output.len());
    Ok(output)
}
