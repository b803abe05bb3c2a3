//! Persistent boot counter.

use nor_fs::BlockDevice;

use crate::{Error, FileHandle, FileMode, FsPort, Result, SeekOrigin};

pub const BOOT_COUNT_PATH: &str = "/boots.txt";

/// Increments the counter in [`BOOT_COUNT_PATH`] and returns the new value.
///
/// A missing or short file counts as zero boots so far.
pub fn bump_boot_count<D: BlockDevice, const FILES: usize, const DIRS: usize>(
    port: &FsPort<D, FILES, DIRS>,
) -> Result<u32> {
    let mode = FileMode::READ | FileMode::WRITE | FileMode::CREATE;
    let file = port.open_file(BOOT_COUNT_PATH, mode)?;
    let result = bump(port, file);
    let closed = port.close_file(file);
    let count = result?;
    closed?;
    info!("boot count: {}", count);
    Ok(count)
}

fn bump<D: BlockDevice, const FILES: usize, const DIRS: usize>(
    port: &FsPort<D, FILES, DIRS>,
    file: FileHandle,
) -> Result<u32> {
    let mut buf = [0u8; 4];
    let count = match port.read(file, &mut buf) {
        Ok(4) => u32::from_le_bytes(buf),
        Ok(_) | Err(Error::EndOfFile) => 0,
        Err(e) => return Err(e),
    };
    let count = count.wrapping_add(1);
    port.seek(file, 0, SeekOrigin::Set)?;
    port.write(file, &count.to_le_bytes())?;
    Ok(count)
}
