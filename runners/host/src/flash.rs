use std::{
    fs::{File, OpenOptions},
    io::{self, Read as _, Seek as _, SeekFrom, Write as _},
    path::Path,
};

use generic_array::typenum::U256;
use log::{debug, error, info};
use nor_fs::{BlockDevice, Error, Result};
use w25qxx::{FLASH_SIZE, PAGE_SIZE, SECTOR_SIZE};

/// The image file could not be read or written.
pub const FILE_ERR_IO: i32 = 0x6669_6c65;
/// Access beyond the end of the image.
pub const FILE_ERR_RANGE: i32 = 0x6578_7046;

// Same geometry as the external flash on the board.
nor_fs::ram_flash!(
    name = RamImage,
    block_size = SECTOR_SIZE,
    block_count = FLASH_SIZE / SECTOR_SIZE,
    read_size = 1,
    prog_size = PAGE_SIZE,
    block_cycles = 500,
    cache_size_ty = U256,
    lookahead_size_ty = U256,
);

/// A W25Q128 image in a regular file.
///
/// Programs AND the data into the image like a NOR cell can only clear
/// bits, erases set a whole sector to 0xFF.
pub struct FileFlash {
    file: File,
}

impl FileFlash {
    /// Opens `path`, creating an erased image if it does not exist.
    pub fn open(path: &Path) -> io::Result<Self> {
        let len = FLASH_SIZE as u64;
        if path.exists() {
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            let actual = file.metadata()?.len();
            if actual != len {
                error!("image {} has {} bytes, expected {}", path.display(), actual, len);
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "image size does not match the flash size",
                ));
            }
            debug!("opened image {}", path.display());
            return Ok(Self { file });
        }

        info!("creating erased image {}", path.display());
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let erased = vec![0xffu8; SECTOR_SIZE];
        for _ in 0..FLASH_SIZE / SECTOR_SIZE {
            file.write_all(&erased)?;
        }
        file.flush()?;
        Ok(Self { file })
    }

    fn seek(&mut self, block: u32, off: u32, len: usize) -> Result<()> {
        let start = block as usize * SECTOR_SIZE + off as usize;
        if off as usize + len > SECTOR_SIZE || start + len > FLASH_SIZE {
            return Err(Error::Io(FILE_ERR_RANGE));
        }
        self.file
            .seek(SeekFrom::Start(start as u64))
            .map_err(io_error)?;
        Ok(())
    }
}

fn io_error(e: io::Error) -> Error {
    error!("image access failed: {}", e);
    Error::Io(FILE_ERR_IO)
}

impl BlockDevice for FileFlash {
    const READ_SIZE: usize = 1;
    const PROG_SIZE: usize = PAGE_SIZE;
    const BLOCK_SIZE: usize = SECTOR_SIZE;
    const BLOCK_COUNT: usize = FLASH_SIZE / SECTOR_SIZE;
    const BLOCK_CYCLES: u32 = 500;
    type CacheSize = U256;
    type LookaheadSize = U256;

    fn read(&mut self, block: u32, off: u32, buf: &mut [u8]) -> Result<usize> {
        self.seek(block, off, buf.len())?;
        self.file.read_exact(buf).map_err(io_error)?;
        Ok(buf.len())
    }

    fn program(&mut self, block: u32, off: u32, data: &[u8]) -> Result<usize> {
        let mut cells = vec![0u8; data.len()];
        self.read(block, off, &mut cells)?;
        for (cell, byte) in cells.iter_mut().zip(data) {
            *cell &= byte;
        }
        self.seek(block, off, data.len())?;
        self.file.write_all(&cells).map_err(io_error)?;
        Ok(data.len())
    }

    fn erase(&mut self, block: u32) -> Result<()> {
        self.seek(block, 0, SECTOR_SIZE)?;
        self.file
            .write_all(&[0xff; SECTOR_SIZE])
            .map_err(io_error)
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush().map_err(io_error)
    }
}
