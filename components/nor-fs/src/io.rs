use generic_array::GenericArray;

use crate::crc::get_u32_le;
use crate::driver::{BlockDevice, Geometry};
use crate::error::{Error, Result};

pub(crate) const NULL_BLOCK: u32 = u32::MAX;

/// Reported when a device returns fewer bytes than requested.
const SHORT_READ: i32 = -1;

/// Block device access through a read cache, plus the shared program cache
/// used by directory and superblock writes.
pub(crate) struct Io<D: BlockDevice> {
    pub dev: D,
    pub geometry: Geometry,
    rcache_block: u32,
    rcache_off: u32,
    rcache: GenericArray<u8, D::CacheSize>,
    pub pcache: GenericArray<u8, D::CacheSize>,
}

impl<D: BlockDevice> Io<D> {
    pub fn new(dev: D) -> Self {
        Self {
            dev,
            geometry: Geometry::of::<D>(),
            rcache_block: NULL_BLOCK,
            rcache_off: 0,
            rcache: GenericArray::default(),
            pcache: GenericArray::default(),
        }
    }

    pub fn check_block(&self, block: u32) -> Result<u32> {
        if block < self.geometry.block_count {
            Ok(block)
        } else {
            error!("block pointer out of range: {}", block);
            Err(Error::Corrupt)
        }
    }

    fn invalidate(&mut self, block: u32) {
        if self.rcache_block == block {
            self.rcache_block = NULL_BLOCK;
        }
    }

    pub fn read(&mut self, block: u32, mut off: u32, buf: &mut [u8]) -> Result<()> {
        self.check_block(block)?;
        if off as usize + buf.len() > self.geometry.block_size as usize {
            return Err(Error::Corrupt);
        }
        let cache = self.rcache.len() as u32;
        let mut done = 0;
        while done < buf.len() {
            let hit = self.rcache_block == block
                && off >= self.rcache_off
                && off < self.rcache_off + cache;
            if !hit {
                let base = off - off % cache;
                self.rcache_block = NULL_BLOCK;
                let n = self.dev.read(block, base, &mut self.rcache)?;
                if n != self.rcache.len() {
                    return Err(Error::Io(SHORT_READ));
                }
                self.rcache_block = block;
                self.rcache_off = base;
            }
            let start = (off - self.rcache_off) as usize;
            let n = (cache as usize - start).min(buf.len() - done);
            buf[done..done + n].copy_from_slice(&self.rcache[start..start + n]);
            done += n;
            off += n as u32;
        }
        Ok(())
    }

    pub fn read_u32(&mut self, block: u32, off: u32) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read(block, off, &mut buf)?;
        Ok(get_u32_le(&buf))
    }

    pub fn program(&mut self, block: u32, off: u32, data: &[u8]) -> Result<()> {
        self.invalidate(block);
        trace!("prog {} {:x} {}", block, off, data.len());
        self.dev.program(block, off, data).map_err(|e| {
            error!("program of block {} failed: {:?}", block, e);
            e
        })?;
        Ok(())
    }

    /// Programs the first `len` bytes of the program cache.
    pub fn program_pcache(&mut self, block: u32, off: u32, len: usize) -> Result<()> {
        self.invalidate(block);
        trace!("prog {} {:x} {}", block, off, len);
        self.dev.program(block, off, &self.pcache[..len]).map_err(|e| {
            error!("program of block {} failed: {:?}", block, e);
            e
        })?;
        Ok(())
    }

    pub fn erase(&mut self, block: u32) -> Result<()> {
        self.invalidate(block);
        trace!("erase {}", block);
        self.dev.erase(block).map_err(|e| {
            error!("erase of block {} failed: {:?}", block, e);
            e
        })
    }

    pub fn sync(&mut self) -> Result<()> {
        self.dev.sync()
    }
}
