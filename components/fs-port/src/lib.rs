#![no_std]

//! File system port on top of [`nor_fs`].
//!
//! [`FsPort`] owns a mounted [`Filesystem`] behind a single spin lock, so it
//! can be shared between tasks. Every call takes the lock for its whole
//! duration and translates core status codes into [`Error`].

extern crate delog;
delog::generate_macros!();

pub mod boot;
mod error;

use bitflags::bitflags;
use nor_fs::{
    BlockDevice, FileType, Filesystem, Metadata, MountFailure, OpenFlags, SeekFrom,
    FS_MAX_DIRS, FS_MAX_FILES,
};
use spin::Mutex;

pub use crate::error::{Error, Result};
pub use nor_fs::{DirHandle, FileHandle, FsInfo, Name};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const CREATE = 0x04;
        const TRUNC = 0x08;
    }

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Attributes: u8 {
        const FILE = 0x01;
        const DIRECTORY = 0x10;
    }
}

impl From<FileMode> for OpenFlags {
    fn from(mode: FileMode) -> Self {
        let mut flags = OpenFlags::empty();
        flags.set(OpenFlags::READ, mode.contains(FileMode::READ));
        flags.set(OpenFlags::WRITE, mode.contains(FileMode::WRITE));
        flags.set(OpenFlags::CREATE, mode.contains(FileMode::CREATE));
        flags.set(OpenFlags::TRUNCATE, mode.contains(FileMode::TRUNC));
        flags
    }
}

impl From<Metadata> for Attributes {
    fn from(metadata: Metadata) -> Self {
        match metadata.file_type {
            FileType::File => Attributes::FILE,
            FileType::Dir => Attributes::DIRECTORY,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekOrigin {
    Set,
    Cur,
    End,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileStat {
    pub attributes: Attributes,
    pub size: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub attributes: Attributes,
    pub size: u32,
    pub name: Name,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Refuse every operation that would modify the volume.
    pub read_only: bool,
}

pub struct FsPort<D: BlockDevice, const FILES: usize = FS_MAX_FILES, const DIRS: usize = FS_MAX_DIRS>
{
    fs: Mutex<Filesystem<D, FILES, DIRS>>,
    read_only: bool,
}

impl<D: BlockDevice, const FILES: usize, const DIRS: usize> FsPort<D, FILES, DIRS> {
    /// Mounts `device`, formatting it first if it holds no usable filesystem.
    pub fn init(device: D) -> Result<Self> {
        Self::init_with(device, Options::default())
    }

    /// Like [`Self::init`]. A read-only port never formats.
    pub fn init_with(device: D, options: Options) -> Result<Self> {
        let fs = match Filesystem::mount(device) {
            Ok(fs) => fs,
            Err(MountFailure {
                error: error @ (nor_fs::Error::NotFormatted | nor_fs::Error::Corrupt),
                mut device,
            }) if !options.read_only => {
                warn!("mount failed with {:?}, formatting", error);
                Filesystem::<D>::format(&mut device)?;
                Filesystem::mount(device).map_err(|failure| {
                    error!("mount after format failed: {:?}", failure.error);
                    failure.error
                })?
            }
            Err(failure) => {
                error!("mount failed: {:?}", failure.error);
                return Err(failure.error.into());
            }
        };
        Ok(Self {
            fs: Mutex::new(fs),
            read_only: options.read_only,
        })
    }

    /// Returns the device, open handles are dropped without committing.
    pub fn unmount(self) -> D {
        self.fs.into_inner().unmount()
    }

    fn writable(&self) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly)
        } else {
            Ok(())
        }
    }

    /// True for regular files only.
    pub fn exists(&self, path: &str) -> bool {
        trace!("exists {}", path);
        matches!(self.fs.lock().metadata(path), Ok(m) if m.is_file())
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        trace!("dir_exists {}", path);
        matches!(self.fs.lock().metadata(path), Ok(m) if m.is_dir())
    }

    pub fn get_size(&self, path: &str) -> Result<u32> {
        trace!("get_size {}", path);
        let metadata = self.fs.lock().metadata(path)?;
        if metadata.is_dir() {
            return Err(Error::IsADirectory);
        }
        Ok(metadata.size)
    }

    pub fn get_stat(&self, path: &str) -> Result<FileStat> {
        trace!("get_stat {}", path);
        let metadata = self.fs.lock().metadata(path)?;
        Ok(FileStat {
            attributes: metadata.into(),
            size: metadata.size,
        })
    }

    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<()> {
        trace!("rename {} {}", old_path, new_path);
        self.writable()?;
        Ok(self.fs.lock().rename(old_path, new_path)?)
    }

    /// Deletes a file, directories are refused.
    pub fn delete(&self, path: &str) -> Result<()> {
        trace!("delete {}", path);
        self.writable()?;
        let mut fs = self.fs.lock();
        if fs.metadata(path)?.is_dir() {
            return Err(Error::IsADirectory);
        }
        Ok(fs.remove(path)?)
    }

    pub fn open_file(&self, path: &str, mode: FileMode) -> Result<FileHandle> {
        trace!("open_file {} {:?}", path, mode);
        if mode.is_empty() {
            return Err(Error::InvalidParameter);
        }
        if mode != FileMode::READ {
            self.writable()?;
        }
        Ok(self.fs.lock().open(path, mode.into())?)
    }

    pub fn seek(&self, file: FileHandle, offset: i32, origin: SeekOrigin) -> Result<()> {
        trace!("seek {:?} {} {:?}", file, offset, origin);
        let pos = match origin {
            SeekOrigin::Set => {
                SeekFrom::Start(u32::try_from(offset).map_err(|_| Error::InvalidParameter)?)
            }
            SeekOrigin::Cur => SeekFrom::Current(offset),
            SeekOrigin::End => SeekFrom::End(offset),
        };
        self.fs.lock().seek(file, pos)?;
        Ok(())
    }

    /// Writes all of `data` at the current position.
    pub fn write(&self, file: FileHandle, data: &[u8]) -> Result<()> {
        trace!("write {:?} {}", file, data.len());
        self.writable()?;
        let written = self.fs.lock().write(file, data)?;
        if written != data.len() {
            return Err(Error::IoFailure);
        }
        Ok(())
    }

    /// Reads up to `buf.len()` bytes, [`Error::EndOfFile`] when there are none.
    pub fn read(&self, file: FileHandle, buf: &mut [u8]) -> Result<usize> {
        trace!("read {:?} {}", file, buf.len());
        match self.fs.lock().read(file, buf)? {
            0 if !buf.is_empty() => Err(Error::EndOfFile),
            n => Ok(n),
        }
    }

    /// Commits the file. The handle is released even if the commit fails.
    pub fn close_file(&self, file: FileHandle) -> Result<()> {
        trace!("close_file {:?}", file);
        self.fs.lock().close(file).map_err(|e| {
            warn!("close failed: {:?}", e);
            e.into()
        })
    }

    pub fn create_dir(&self, path: &str) -> Result<()> {
        trace!("create_dir {}", path);
        self.writable()?;
        Ok(self.fs.lock().create_dir(path)?)
    }

    /// Removes an empty directory, files are refused.
    pub fn remove_dir(&self, path: &str) -> Result<()> {
        trace!("remove_dir {}", path);
        self.writable()?;
        let mut fs = self.fs.lock();
        if fs.metadata(path)?.is_file() {
            return Err(Error::NotADirectory);
        }
        Ok(fs.remove(path)?)
    }

    pub fn open_dir(&self, path: &str) -> Result<DirHandle> {
        trace!("open_dir {}", path);
        Ok(self.fs.lock().open_dir(path)?)
    }

    /// Next entry, [`Error::EndOfStream`] after the last one.
    pub fn read_dir(&self, dir: DirHandle) -> Result<DirEntry> {
        trace!("read_dir {:?}", dir);
        match self.fs.lock().read_dir(dir)? {
            Some(entry) => Ok(DirEntry {
                attributes: entry.metadata.into(),
                size: entry.metadata.size,
                name: entry.name,
            }),
            None => Err(Error::EndOfStream),
        }
    }

    pub fn close_dir(&self, dir: DirHandle) -> Result<()> {
        trace!("close_dir {:?}", dir);
        Ok(self.fs.lock().close_dir(dir)?)
    }

    pub fn info(&self) -> Result<FsInfo> {
        Ok(self.fs.lock().info()?)
    }
}


#[cfg(test)]
#[macro_use]
extern crate std;
