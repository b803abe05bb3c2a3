#![no_std]

//! Copy-on-write filesystem for raw NOR flash.
//!
//! The filesystem sits directly on a [`BlockDevice`] with page-granular
//! programming and sector-granular erasure and never programs a region twice
//! between two erases. All metadata changes are written to fresh blocks and
//! become visible atomically by appending one record to the superblock pair.
//!
//! # On-Disk Layout
//!
//! | blocks  | content                                          |
//! |---------|--------------------------------------------------|
//! |  0 - 1  | superblock pair, append-only log of records      |
//! |  2 - n  | directory blocks, file data blocks, free blocks  |
//!
//! A superblock record:
//!
//! | bytes   | content                              |
//! |---------|--------------------------------------|
//! |  0 - 3  | magic `NRFS`                         |
//! |  4 - 7  | format version (major << 16 | minor) |
//! |  8 - 11 | revision                             |
//! | 12 - 19 | block size, block count              |
//! | 20 - 23 | root directory head block            |
//! | 24 - 27 | allocator cursor                     |
//! | 28 - 31 | superblock pair erase count          |
//! | 32 - 35 | CRC-32 over bytes 0 - 31             |
//!
//! Directory blocks hold `u16` length-prefixed, postcard-serialized entries
//! followed by a footer in the last program unit of the block. File data is
//! either stored inline in the directory entry or as a chain of data blocks,
//! each starting with the little-endian number of the previous block.
//!
//! # Important Implementation Details
//! * RAM use is bounded by the cache and lookahead sizes of the device and
//!   the handle pool capacities, there is no allocator.
//! * File data and directories are only reachable through a committed
//!   superblock record, so a power loss at any point leaves the previous
//!   state intact.
//! * The filesystem is not reentrant, wrap it in a lock to share it.

extern crate delog;
delog::generate_macros!();

#[cfg(any(test, feature = "alloc"))]
extern crate alloc;

mod alloc_map;
mod crc;
mod dir;
mod driver;
mod error;
mod file;
mod fs;
mod handles;
mod io;
mod path;
#[cfg(any(test, feature = "alloc"))]
pub mod ram;
mod superblock;
mod volume;

pub use crate::driver::{BlockDevice, Geometry};
pub use crate::error::{Error, Result};
pub use crate::fs::{
    DirEntry, DirHandle, FileHandle, FileType, Filesystem, FsInfo, Metadata, MountFailure,
    OpenFlags, SeekFrom,
};

/// Longest name of a single path component, in bytes.
pub const NAME_MAX: usize = 64;
/// Longest normalised path an open file remembers, in bytes.
pub const PATH_MAX: usize = 256;
/// Files up to this size are stored inside their directory entry.
pub const INLINE_MAX: usize = 64;
/// Deepest directory nesting, counted in path components.
pub const MAX_DEPTH: usize = 8;

/// Default number of concurrently open files.
pub const FS_MAX_FILES: usize = 3;
/// Default number of concurrently open directories.
pub const FS_MAX_DIRS: usize = 3;

pub type Name = heapless::String<NAME_MAX>;

#[cfg(test)]
mod tests;

#[cfg(test)]
#[macro_use]
extern crate std;
