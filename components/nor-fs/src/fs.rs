use crate::dir::{make_name, DirCursor, Entry, EntryKind};
use crate::driver::{BlockDevice, Geometry};
use crate::error::{Error, Result};
use crate::file::FileState;
use crate::handles::{Handle, HandleTable};
use crate::io::NULL_BLOCK;
use crate::path::{Path, Rebase};
use crate::volume::{Edit, Node, Pin, Pins, Volume};
use crate::{Name, FS_MAX_DIRS, FS_MAX_FILES, MAX_DEPTH};

pub use crate::file::{OpenFlags, SeekFrom};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    File,
    Dir,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Metadata {
    pub file_type: FileType,
    /// Committed size in bytes, 0 for directories.
    pub size: u32,
}

impl Metadata {
    pub fn is_dir(&self) -> bool {
        self.file_type == FileType::Dir
    }

    pub fn is_file(&self) -> bool {
        self.file_type == FileType::File
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub name: Name,
    pub metadata: Metadata,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FsInfo {
    pub block_size: u32,
    pub block_count: u32,
    /// Blocks reachable from the committed root, superblocks included.
    pub blocks_used: u32,
    pub revision: u32,
    pub superblock_erases: u32,
    /// The superblock pair went past the rated erase cycles.
    pub worn: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle(Handle);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DirHandle(Handle);

/// Returned by [`Filesystem::mount`], hands the device back.
#[derive(Debug)]
pub struct MountFailure<D> {
    pub error: Error,
    pub device: D,
}

/// A mounted volume with its pools of open files and directories.
///
/// Nothing written through a file handle is visible to other handles or
/// survives a power loss before `sync` or `close` of that handle returns.
/// Namespace operations (`remove`, `rename`, `create_dir`) are committed
/// before they return.
pub struct Filesystem<D: BlockDevice, const FILES: usize = FS_MAX_FILES, const DIRS: usize = FS_MAX_DIRS>
{
    vol: Volume<D>,
    files: HandleTable<FileState<D::CacheSize>, FILES>,
    dirs: HandleTable<DirCursor, DIRS>,
}

impl<D: BlockDevice> Filesystem<D> {
    /// Writes an empty filesystem, destroying whatever the device held.
    pub fn format(dev: &mut D) -> Result<()> {
        Geometry::of::<D>().validate()?;
        info!("formatting {} blocks", D::BLOCK_COUNT);
        Volume::new(dev).format()
    }

    pub fn is_mountable(dev: &mut D) -> bool {
        Geometry::of::<D>().validate().is_ok() && Volume::new(dev).load().is_ok()
    }
}

impl<D: BlockDevice, const FILES: usize, const DIRS: usize> Filesystem<D, FILES, DIRS> {
    pub fn mount(dev: D) -> Result<Self, MountFailure<D>> {
        if let Err(error) = Geometry::of::<D>().validate() {
            return Err(MountFailure { error, device: dev });
        }
        let mut vol = Volume::new(dev);
        match vol.load() {
            Ok(()) => {
                info!("mounted at revision {}", vol.revision());
                Ok(Self {
                    vol,
                    files: HandleTable::new(),
                    dirs: HandleTable::new(),
                })
            }
            Err(error) => Err(MountFailure {
                error,
                device: vol.into_device(),
            }),
        }
    }

    /// Gives the device back. Open files are dropped without a commit.
    pub fn unmount(self) -> D {
        if self.files.in_use() > 0 {
            warn!("unmounting with {} open files", self.files.in_use());
        }
        self.vol.into_device()
    }

    pub fn info(&mut self) -> Result<FsInfo> {
        let geometry = self.vol.geometry();
        Ok(FsInfo {
            block_size: geometry.block_size,
            block_count: geometry.block_count,
            blocks_used: self.vol.used_blocks()?,
            revision: self.vol.revision(),
            superblock_erases: self.vol.pair_erases(),
            worn: self.vol.worn(),
        })
    }

    fn pins(&self) -> ([Pin; FILES], [Pin; DIRS]) {
        let files = self.files.map(|file| file.pin());
        let dirs = self.dirs.map(|cursor| {
            if cursor.block != NULL_BLOCK {
                Pin::Dir {
                    block: cursor.block,
                }
            } else {
                Pin::None
            }
        });
        (files, dirs)
    }

    pub fn metadata(&mut self, path: &str) -> Result<Metadata> {
        let path = Path::parse(path)?;
        Ok(match self.vol.resolve(&path)? {
            Node::Root => Metadata {
                file_type: FileType::Dir,
                size: 0,
            },
            Node::Entry(entry) => entry.metadata(),
        })
    }

    pub fn exists(&mut self, path: &str) -> Result<bool> {
        match self.metadata(path) {
            Ok(_) => Ok(true),
            Err(Error::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<FileHandle> {
        let handle = self.files.acquire()?;
        match self.open_state(path, flags) {
            Ok(state) => {
                *self.files.get_mut(handle)? = state;
                Ok(FileHandle(handle))
            }
            Err(e) => {
                self.files.release(handle)?;
                Err(e)
            }
        }
    }

    fn open_state(&mut self, path: &str, flags: OpenFlags) -> Result<FileState<D::CacheSize>> {
        if flags.contains(OpenFlags::TRUNCATE) && !flags.contains(OpenFlags::WRITE) {
            return Err(Error::Invalid);
        }
        let path = Path::parse(path)?;
        let buf = path.to_buf()?;
        match self.vol.resolve(&path) {
            Ok(Node::Root) => Err(Error::IsDir),
            Ok(Node::Entry(Entry {
                kind: EntryKind::Dir { .. },
                ..
            })) => Err(Error::IsDir),
            Ok(Node::Entry(Entry {
                kind: EntryKind::File { size, data },
                ..
            })) => {
                if flags.contains(OpenFlags::TRUNCATE) {
                    Ok(FileState::created(buf, flags))
                } else {
                    Ok(FileState::opened(buf, flags, size, data))
                }
            }
            Err(Error::NotFound) if flags.contains(OpenFlags::CREATE) => {
                if path.dir_hint() {
                    return Err(Error::NotDir);
                }
                self.vol.resolve_dir(path.parent())?;
                debug!("creating {}", buf.as_str());
                Ok(FileState::created(buf, flags))
            }
            Err(e) => Err(e),
        }
    }

    fn with_file<R>(
        &mut self,
        handle: FileHandle,
        f: impl FnOnce(&mut Volume<D>, &mut FileState<D::CacheSize>, &Pins) -> Result<R>,
    ) -> Result<R> {
        self.vol.ack();
        let (files, dirs) = self.pins();
        let pins = Pins {
            files: &files,
            dirs: &dirs,
        };
        let file = self.files.get_mut(handle.0)?;
        f(&mut self.vol, file, &pins)
    }

    pub fn read(&mut self, handle: FileHandle, buf: &mut [u8]) -> Result<usize> {
        self.with_file(handle, |vol, file, pins| vol.file_read(file, buf, pins))
    }

    pub fn write(&mut self, handle: FileHandle, data: &[u8]) -> Result<usize> {
        self.with_file(handle, |vol, file, pins| vol.file_write(file, data, pins))
    }

    /// Moves the position, positions past the end are allowed.
    pub fn seek(&mut self, handle: FileHandle, pos: SeekFrom) -> Result<u32> {
        let file_max = self.vol.geometry().file_max();
        self.files.get_mut(handle.0)?.seek(pos, file_max)
    }

    pub fn tell(&self, handle: FileHandle) -> Result<u32> {
        Ok(self.files.get(handle.0)?.pos)
    }

    /// Size as seen through this handle, uncommitted writes included.
    pub fn file_size(&self, handle: FileHandle) -> Result<u32> {
        Ok(self.files.get(handle.0)?.size)
    }

    pub fn sync(&mut self, handle: FileHandle) -> Result<()> {
        self.with_file(handle, |vol, file, pins| vol.file_sync(file, pins))
    }

    /// Commits and releases the handle. The handle is released even when
    /// the commit fails.
    pub fn close(&mut self, handle: FileHandle) -> Result<()> {
        let result = self.with_file(handle, |vol, file, pins| vol.file_sync(file, pins));
        if result == Err(Error::BadHandle) {
            return result;
        }
        self.files.release(handle.0)?;
        result
    }

    /// Removes a file or an empty directory.
    pub fn remove(&mut self, path: &str) -> Result<()> {
        self.vol.ack();
        let path = Path::parse(path)?;
        let entry = match self.vol.resolve(&path)? {
            Node::Root => return Err(Error::Invalid),
            Node::Entry(entry) => entry,
        };
        if let EntryKind::Dir { head } = entry.kind {
            if !self.vol.io.dir_is_empty(head)? {
                return Err(Error::NotEmpty);
            }
        }

        let (files, dirs) = self.pins();
        let pins = Pins {
            files: &files,
            dirs: &dirs,
        };
        let root = self.vol.root();
        let root = self
            .vol
            .apply(root, path.parent(), Edit::Remove(path.name()?), &pins)?;
        self.vol.commit(root)?;

        self.files.for_each_mut(|file| {
            if Path::parse(&file.path).map_or(false, |p| p.is_within(&path)) {
                file.orphaned = true;
            }
        });
        Ok(())
    }

    /// Moves `from` to `to`, replacing a file or an empty directory there.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.vol.ack();
        let src = Path::parse(from)?;
        let dst = Path::parse(to)?;
        if src.is_root() || dst.is_root() {
            return Err(Error::Invalid);
        }
        let entry = match self.vol.resolve(&src)? {
            Node::Root => return Err(Error::Invalid),
            Node::Entry(entry) => entry,
        };
        if src.components() == dst.components() {
            return Ok(());
        }
        if dst.is_within(&src) {
            return Err(Error::Invalid);
        }
        if dst.dir_hint() && !entry.is_dir() {
            return Err(Error::NotDir);
        }

        let parent = self.vol.resolve_dir(dst.parent())?;
        if let Some(existing) = self.vol.io.dir_find(parent, dst.name()?)? {
            match (entry.is_dir(), existing.kind) {
                (false, EntryKind::Dir { .. }) => return Err(Error::IsDir),
                (true, EntryKind::File { .. }) => return Err(Error::NotDir),
                (true, EntryKind::Dir { head }) => {
                    if !self.vol.io.dir_is_empty(head)? {
                        return Err(Error::NotEmpty);
                    }
                }
                (false, EntryKind::File { .. }) => {}
            }
        }
        if let EntryKind::Dir { head } = entry.kind {
            if dst.depth() + self.vol.dir_height(head, 0)? > MAX_DEPTH {
                return Err(Error::NameTooLong);
            }
        }

        let moved = Entry {
            name: make_name(dst.name()?)?,
            kind: entry.kind,
        };
        let (files, dirs) = self.pins();
        let pins = Pins {
            files: &files,
            dirs: &dirs,
        };
        let root = self.vol.root();
        let root = if src.parent() == dst.parent() {
            let edit = Edit::Rename {
                from: src.name()?,
                to: &moved,
            };
            self.vol.apply(root, src.parent(), edit, &pins)?
        } else {
            let root = self
                .vol
                .apply(root, dst.parent(), Edit::Upsert(&moved), &pins)?;
            self.vol
                .apply(root, src.parent(), Edit::Remove(src.name()?), &pins)?
        };
        self.vol.commit(root)?;

        self.files.for_each_mut(|file| {
            let rebase = match Path::parse(&file.path) {
                Ok(p) if p.is_within(&src) => Path::rebase(&file.path, &src, &dst),
                Ok(p) if p.is_within(&dst) => Rebase::Lost,
                _ => Rebase::Unaffected,
            };
            match rebase {
                Rebase::Unaffected => {}
                Rebase::Moved(path) => file.path = path,
                Rebase::Lost => file.orphaned = true,
            }
        });
        Ok(())
    }

    pub fn create_dir(&mut self, path: &str) -> Result<()> {
        self.vol.ack();
        let path = Path::parse(path)?;
        if path.is_root() {
            return Err(Error::Exists);
        }
        let name = path.name()?;
        let parent = self.vol.resolve_dir(path.parent())?;
        if self.vol.io.dir_find(parent, name)?.is_some() {
            return Err(Error::Exists);
        }

        let (files, dirs) = self.pins();
        let pins = Pins {
            files: &files,
            dirs: &dirs,
        };
        let mut w = self.vol.dir_begin(&pins)?;
        let head = self.vol.dir_finish(&mut w)?;
        let entry = Entry::dir(name, head)?;
        let root = self.vol.root();
        let root = self
            .vol
            .apply(root, path.parent(), Edit::Insert(&entry), &pins)?;
        self.vol.commit(root)
    }

    pub fn open_dir(&mut self, path: &str) -> Result<DirHandle> {
        let handle = self.dirs.acquire()?;
        match self.dir_cursor(path) {
            Ok(cursor) => {
                *self.dirs.get_mut(handle)? = cursor;
                Ok(DirHandle(handle))
            }
            Err(e) => {
                self.dirs.release(handle)?;
                Err(e)
            }
        }
    }

    fn dir_cursor(&mut self, path: &str) -> Result<DirCursor> {
        let path = Path::parse(path)?;
        let head = match self.vol.resolve(&path)? {
            Node::Root => self.vol.root(),
            Node::Entry(Entry {
                kind: EntryKind::Dir { head },
                ..
            }) => head,
            Node::Entry(_) => return Err(Error::NotDir),
        };
        self.vol.io.dir_open(head)
    }

    /// Next entry in on-disk order, `None` after the last one.
    ///
    /// The listing is the directory as it was when opened.
    pub fn read_dir(&mut self, handle: DirHandle) -> Result<Option<DirEntry>> {
        let cursor = self.dirs.get_mut(handle.0)?;
        Ok(self.vol.io.dir_next(cursor)?.map(|entry| DirEntry {
            metadata: entry.metadata(),
            name: entry.name,
        }))
    }

    pub fn close_dir(&mut self, handle: DirHandle) -> Result<()> {
        self.dirs.release(handle.0)
    }
}
