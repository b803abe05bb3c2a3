#![no_std]

//! [`BlockDevice`] for Winbond W25Q128 class SPI NOR flash.
//!
//! One filesystem block is one 4 KiB erase sector. Programs are split into
//! 256 byte pages, the chip wraps around within a page otherwise.

extern crate delog;
delog::generate_macros!();

use embedded_hal::{blocking::spi::Transfer, digital::v2::OutputPin};
use generic_array::typenum::U256;
use nor_fs::{BlockDevice, Error, Result};
use spi_memory::series25::Flash;
use spi_memory::{BlockDevice as _, Read as _};

/// The SPI transfer or chip select failed, or the chip reported an
/// unexpected status.
pub const W25Q_ERR_SPI: i32 = 0x6565_6565;
/// Access beyond the end of the chip.
pub const W25Q_ERR_RANGE: i32 = 0x6578_7046;
/// The chip did not identify as the expected part.
pub const W25Q_ERR_JEDEC: i32 = 0x6a65_6465;

pub const FLASH_SIZE: usize = 0x100_0000;
pub const SECTOR_SIZE: usize = 4096;
pub const PAGE_SIZE: usize = 256;

/// Manufacturer, memory type and capacity of a W25Q128JV.
pub const JEDEC_ID: [u8; 3] = [0xef, 0x40, 0x18];

pub struct W25qFlash<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    flash: Flash<SPI, CS>,
}

impl<SPI, CS> W25qFlash<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    fn raw_command(spim: &mut SPI, cs: &mut CS, buf: &mut [u8]) -> Result<()> {
        cs.set_low().map_err(|_| Error::Io(W25Q_ERR_SPI))?;
        let result = spim.transfer(buf).map(|_| ());
        cs.set_high().map_err(|_| Error::Io(W25Q_ERR_SPI))?;
        result.map_err(|_| Error::Io(W25Q_ERR_SPI))
    }

    /// Dumps the identification and status registers.
    pub fn selftest(spim: &mut SPI, cs: &mut CS) -> Result<()> {
        macro_rules! doraw {
            ($buf:expr, $str:expr) => {
                let mut buf = $buf;
                Self::raw_command(spim, cs, &mut buf)?;
                trace!($str, delog::hex_str!(&buf[1..]));
            };
        }

        doraw!([0x9f, 0, 0, 0], "JEDEC {}");
        doraw!([0x05, 0], "SR1 {}");
        doraw!([0x35, 0], "SR2 {}");
        doraw!([0x15, 0], "SR3 {}");
        Ok(())
    }

    /// Takes over the bus and checks that a W25Q128 answers on it.
    pub fn new(mut spim: SPI, mut cs: CS) -> Result<Self> {
        Self::selftest(&mut spim, &mut cs)?;

        let mut flash = Flash::init(spim, cs).map_err(|_| {
            error!("flash init failed");
            Error::Io(W25Q_ERR_SPI)
        })?;
        let jedec_id = flash.read_jedec_id().map_err(|_| Error::Io(W25Q_ERR_SPI))?;
        info!(
            "Ext. Flash: {:x} {}",
            jedec_id.mfr_code(),
            delog::hex_str!(jedec_id.device_id())
        );
        // the id buffer carries trailing bytes after memory type and capacity
        if jedec_id.mfr_code() != JEDEC_ID[0] || !jedec_id.device_id().starts_with(&JEDEC_ID[1..]) {
            error!("unknown flash chip");
            return Err(Error::Io(W25Q_ERR_JEDEC));
        }
        Ok(Self { flash })
    }

    pub fn size(&self) -> usize {
        FLASH_SIZE
    }

    pub fn erase_chip(&mut self) -> Result<()> {
        info!("erasing the whole chip");
        self.flash.erase_all().map_err(|_| Error::Io(W25Q_ERR_SPI))
    }

    fn address(block: u32, off: u32, len: usize) -> Result<u32> {
        let start = block as usize * SECTOR_SIZE + off as usize;
        if off as usize + len > SECTOR_SIZE || start + len > FLASH_SIZE {
            return Err(Error::Io(W25Q_ERR_RANGE));
        }
        Ok(start as u32)
    }
}

impl<SPI, CS> BlockDevice for W25qFlash<SPI, CS>
where
    SPI: Transfer<u8>,
    CS: OutputPin,
{
    const READ_SIZE: usize = 1;
    const PROG_SIZE: usize = PAGE_SIZE;
    const BLOCK_SIZE: usize = SECTOR_SIZE;
    const BLOCK_COUNT: usize = FLASH_SIZE / SECTOR_SIZE;
    const BLOCK_CYCLES: u32 = 500;
    type CacheSize = U256;
    type LookaheadSize = U256;

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<usize> {
        trace!("EFr {:x} {:x} {:x}", block, off, buf.len());
        if buf.is_empty() {
            return Ok(0);
        }
        let addr = Self::address(block, off, buf.len())?;
        self.flash
            .read(addr, buf)
            .map_err(|_| Error::Io(W25Q_ERR_SPI))?;
        Ok(buf.len())
    }

    fn program(&mut self, block: u32, off: u32, data: &[u8]) -> Result<usize> {
        trace!("EFw {:x} {:x} {:x}", block, off, data.len());
        let mut addr = Self::address(block, off, data.len())?;
        let mut buf = [0; PAGE_SIZE];
        for chunk in data.chunks(PAGE_SIZE) {
            let buf = &mut buf[..chunk.len()];
            buf.copy_from_slice(chunk);
            self.flash
                .write_bytes(addr, buf)
                .map_err(|_| Error::Io(W25Q_ERR_SPI))?;
            addr += PAGE_SIZE as u32;
        }
        Ok(data.len())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        trace!("EFe {:x}", block);
        let addr = Self::address(block, 0, SECTOR_SIZE)?;
        self.flash
            .erase_sectors(addr, 1)
            .map_err(|_| Error::Io(W25Q_ERR_SPI))
    }
}


#[cfg(test)]
#[macro_use]
extern crate std;
