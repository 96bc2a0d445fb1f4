//! # Stratus Archive
//!
//! Streaming archive codec for build directories.
//!
//! A [`Packer`] walks a directory lazily and writes a single zstd-compressed stream; [`unpack`]
//! reads it back, restoring modification times so staleness checks of the pipeline tool behave
//! the same after a round trip. [`pack_stream`] and [`unpack_stream`] adapt both ends to the
//! async [`ByteSource`](stratus_core::traits::ByteSource) used by object stores.
//!
//! ## Usage
//!
//! ```no_run
//! use stratus_archive::{Packer, unpack};
//! use stratus_core::glob::PatternSet;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let packer = Packer::new("./my-build", &PatternSet::parse(["data/"])?);
//! let mut archive = Vec::new();
//! packer.write_to(&mut archive, |entry| println!("adding {}", entry.path))?;
//!
//! unpack(archive.as_slice(), "./copy".as_ref(), |_| true)?;
//! # Ok(())
//! # }
//! ```

mod format;
mod pack;
mod stream;
mod unpack;

pub use format::{ArchiveEntry, COMPRESSION_LEVEL, EntryKind, MAGIC};
pub use pack::{PackEntry, PackSummary, Packer};
pub use stream::{pack_stream, unpack_stream};
pub use unpack::{UnpackSummary, safe_relative_path, unpack};
