//! NOR flash simulated in RAM, for tests and host tools.

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Error, Result};

/// Program or erase outside of the device.
pub const RAM_ERR_RANGE: i32 = 0x7261_6d01;
/// Program not aligned to the program size.
pub const RAM_ERR_ALIGN: i32 = 0x7261_6d02;
/// Program over a page that was programmed since its last erase.
pub const RAM_ERR_REPROGRAM: i32 = 0x7261_6d03;
/// Mutation attempted after a simulated power loss.
pub const RAM_ERR_POWER: i32 = 0x7261_6d04;

pub struct RamFlash {
    data: Vec<u8>,
    programmed: Vec<bool>,
    erases: Vec<u32>,
    block_size: usize,
    prog_size: usize,
    erase_fill: u8,
    power_budget: Option<u32>,
}

impl RamFlash {
    /// A device in factory state, every block erased.
    pub fn new(block_size: usize, block_count: usize, prog_size: usize) -> Self {
        Self {
            data: vec![0xff; block_size * block_count],
            programmed: vec![false; block_size * block_count / prog_size],
            erases: vec![0; block_count],
            block_size,
            prog_size,
            erase_fill: 0xff,
            power_budget: None,
        }
    }

    /// Content written by subsequent erases.
    pub fn set_erase_fill(&mut self, fill: u8) {
        self.erase_fill = fill;
    }

    /// Lets `ops` more programs or erases succeed, then fails every further one.
    pub fn cut_power_after(&mut self, ops: u32) {
        self.power_budget = Some(ops);
    }

    pub fn restore_power(&mut self) {
        self.power_budget = None;
    }

    pub fn erase_count(&self, block: u32) -> u32 {
        self.erases.get(block as usize).copied().unwrap_or(0)
    }

    pub fn total_erases(&self) -> u64 {
        self.erases.iter().map(|&n| n as u64).sum()
    }

    fn spend_power(&mut self) -> Result<()> {
        match &mut self.power_budget {
            None => Ok(()),
            Some(0) => Err(Error::Io(RAM_ERR_POWER)),
            Some(left) => {
                *left -= 1;
                Ok(())
            }
        }
    }

    fn range(&self, block: u32, off: u32, len: usize) -> Result<usize> {
        let start = block as usize * self.block_size + off as usize;
        if off as usize + len > self.block_size || start + len > self.data.len() {
            return Err(Error::Io(RAM_ERR_RANGE));
        }
        Ok(start)
    }

    pub fn read(&self, block: u32, off: u32, buf: &mut [u8]) -> Result<usize> {
        let start = self.range(block, off, buf.len())?;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(buf.len())
    }

    pub fn program(&mut self, block: u32, off: u32, data: &[u8]) -> Result<usize> {
        let start = self.range(block, off, data.len())?;
        if start % self.prog_size != 0 || data.len() % self.prog_size != 0 {
            return Err(Error::Io(RAM_ERR_ALIGN));
        }
        let pages = start / self.prog_size..(start + data.len()) / self.prog_size;
        if self.programmed[pages.clone()].iter().any(|&p| p) {
            return Err(Error::Io(RAM_ERR_REPROGRAM));
        }
        self.spend_power()?;
        self.programmed[pages].fill(true);
        self.data[start..start + data.len()].copy_from_slice(data);
        Ok(data.len())
    }

    pub fn erase(&mut self, block: u32) -> Result<()> {
        let start = self.range(block, 0, self.block_size)?;
        self.spend_power()?;
        self.data[start..start + self.block_size].fill(self.erase_fill);
        let pages = start / self.prog_size..(start + self.block_size) / self.prog_size;
        self.programmed[pages].fill(false);
        self.erases[block as usize] += 1;
        Ok(())
    }
}

/// Declares a [`BlockDevice`](crate::BlockDevice) backed by a [`RamFlash`].
///
/// ```ignore
/// nor_fs::ram_flash!(
///     name = Flash,
///     block_size = 4096,
///     block_count = 256,
///     read_size = 1,
///     prog_size = 256,
///     block_cycles = 500,
///     cache_size_ty = generic_array::typenum::U256,
///     lookahead_size_ty = generic_array::typenum::U32,
/// );
/// ```
#[macro_export]
macro_rules! ram_flash {
    (
        name = $name:ident,
        block_size = $block_size:expr,
        block_count = $block_count:expr,
        read_size = $read_size:expr,
        prog_size = $prog_size:expr,
        block_cycles = $block_cycles:expr,
        cache_size_ty = $cache_size:path,
        lookahead_size_ty = $lookahead_size:path $(,)?
    ) => {
        pub struct $name {
            flash: $crate::ram::RamFlash,
        }

        impl $name {
            pub fn new() -> Self {
                Self {
                    flash: $crate::ram::RamFlash::new($block_size, $block_count, $prog_size),
                }
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl core::ops::Deref for $name {
            type Target = $crate::ram::RamFlash;

            fn deref(&self) -> &Self::Target {
                &self.flash
            }
        }

        impl core::ops::DerefMut for $name {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.flash
            }
        }

        impl $crate::BlockDevice for $name {
            const READ_SIZE: usize = $read_size;
            const PROG_SIZE: usize = $prog_size;
            const BLOCK_SIZE: usize = $block_size;
            const BLOCK_COUNT: usize = $block_count;
            const BLOCK_CYCLES: u32 = $block_cycles;
            type CacheSize = $cache_size;
            type LookaheadSize = $lookahead_size;

            fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> $crate::Result<usize> {
                self.flash.read(block, off, buf)
            }

            fn program(&mut self, block: u32, off: u32, data: &[u8]) -> $crate::Result<usize> {
                self.flash.program(block, off, data)
            }

            fn erase(&mut self, block: u32) -> $crate::Result<()> {
                self.flash.erase(block)
            }
        }
    };
}
