use generic_array::typenum::Unsigned;
use generic_array::ArrayLength;

use crate::dir::{FOOTER_LEN, RECORD_MAX};
use crate::error::{Error, Result};
use crate::superblock::RECORD_LEN;
use crate::INLINE_MAX;

/// Raw flash with erase-before-program semantics.
///
/// Offsets are relative to the start of `block`. The filesystem only issues
/// reads aligned to `READ_SIZE`, programs aligned to `PROG_SIZE` and never
/// programs a range twice without erasing the block in between. An erased
/// block may contain anything, the filesystem does not rely on an erase value.
///
/// Errors are passed on verbatim, implementations should not retry.
pub trait BlockDevice {
    /// Minimum read granularity in bytes.
    const READ_SIZE: usize;
    /// Program granularity in bytes.
    const PROG_SIZE: usize;
    /// Erase granularity in bytes, one filesystem block.
    const BLOCK_SIZE: usize;
    const BLOCK_COUNT: usize;
    /// Rated erase cycles per block, 0 disables wear reporting.
    const BLOCK_CYCLES: u32;

    /// Size of the read cache and of every program cache, in bytes.
    type CacheSize: ArrayLength<u8>;
    /// Size of the allocator bitmap in bytes, each byte tracks 8 blocks.
    type LookaheadSize: ArrayLength<u8>;

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<usize>;
    fn program(&mut self, block: u32, off: u32, data: &[u8]) -> Result<usize>;
    fn erase(&mut self, block: u32) -> Result<()>;
    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    const READ_SIZE: usize = D::READ_SIZE;
    const PROG_SIZE: usize = D::PROG_SIZE;
    const BLOCK_SIZE: usize = D::BLOCK_SIZE;
    const BLOCK_COUNT: usize = D::BLOCK_COUNT;
    const BLOCK_CYCLES: u32 = D::BLOCK_CYCLES;
    type CacheSize = D::CacheSize;
    type LookaheadSize = D::LookaheadSize;

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<usize> {
        (**self).read(block, off, buf)
    }

    fn program(&mut self, block: u32, off: u32, data: &[u8]) -> Result<usize> {
        (**self).program(block, off, data)
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        (**self).erase(block)
    }

    fn sync(&mut self) -> Result<()> {
        (**self).sync()
    }
}

/// The configuration of a [`BlockDevice`] as plain values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub read_size: u32,
    pub prog_size: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub block_cycles: u32,
    pub cache_size: u32,
    pub lookahead_size: u32,
}

impl Geometry {
    pub fn of<D: BlockDevice>() -> Self {
        Self {
            read_size: D::READ_SIZE as u32,
            prog_size: D::PROG_SIZE as u32,
            block_size: D::BLOCK_SIZE as u32,
            block_count: D::BLOCK_COUNT as u32,
            block_cycles: D::BLOCK_CYCLES,
            cache_size: D::CacheSize::USIZE as u32,
            lookahead_size: D::LookaheadSize::USIZE as u32,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = self.read_size > 0
            && self.prog_size > 0
            && self.cache_size > 0
            && self.lookahead_size > 0
            && self.block_size > 0;
        if !nonzero {
            return Err(Error::Invalid);
        }
        if self.cache_size % self.read_size != 0
            || self.cache_size % self.prog_size != 0
            || self.block_size % self.cache_size != 0
        {
            return Err(Error::Invalid);
        }
        if self.block_count < 8 || self.cache_size < RECORD_LEN as u32 {
            return Err(Error::Invalid);
        }
        let footer = self.footer_size();
        if self.block_size < footer + 2 + RECORD_MAX as u32
            || self.payload_size() <= INLINE_MAX as u32
        {
            return Err(Error::Invalid);
        }
        Ok(())
    }

    pub(crate) fn round_up(&self, len: u32) -> u32 {
        len.div_ceil(self.prog_size) * self.prog_size
    }

    /// Bytes at the end of a directory block reserved for its footer.
    pub(crate) fn footer_size(&self) -> u32 {
        self.round_up(FOOTER_LEN as u32)
    }

    /// Data bytes per file block, after the back pointer.
    pub(crate) fn payload_size(&self) -> u32 {
        self.block_size - 4
    }

    /// Largest file the device could hold.
    pub(crate) fn file_max(&self) -> u32 {
        let bytes = self.payload_size() as u64 * self.block_count as u64;
        bytes.min(i32::MAX as u64) as u32
    }
}
