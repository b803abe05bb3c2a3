//! Open file state and file data chains.
//!
//! Files up to [`INLINE_MAX`] bytes live inside their directory entry.
//! Larger files are a chain of data blocks linked backwards:
//!
//! | bytes            | content                                         |
//! |------------------|-------------------------------------------------|
//! | `0 - 3`          | previous block of the chain, unused in the first |
//! | `4 - block_size` | file data                                       |
//!
//! A write never touches programmed blocks. It starts a new chain at the
//! first modified block, sharing the blocks before it with the old chain, and
//! copies the rest of the old content once the writer is flushed.

use bitflags::bitflags;
use generic_array::{ArrayLength, GenericArray};

use crate::crc::set_u32_le;
use crate::dir::{make_name, Entry, EntryKind, FileData};
use crate::driver::BlockDevice;
use crate::error::{Error, Result};
use crate::io::NULL_BLOCK;
use crate::path::{Path, PathBuf};
use crate::volume::{Edit, Pending, Pin, Pins, Volume};
use crate::INLINE_MAX;

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        /// Create the file if it does not exist. The entry becomes visible
        /// with the first sync or close.
        const CREATE = 0x04;
        /// Start from an empty file, requires `WRITE`.
        const TRUNCATE = 0x08;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekFrom {
    Start(u32),
    Current(i32),
    End(i32),
}

/// Committed content a handle reads from and a writer copies from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Base {
    Inline,
    Chain { tail: u32 },
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Writer {
    block: u32,
    prev: u32,
    /// Position of `block` in the chain.
    idx: u32,
    /// File position of the next byte.
    pos: u32,
    /// Offset in `block` the cache starts at.
    base: u32,
    fill: u32,
}

pub(crate) struct FileState<C: ArrayLength<u8>> {
    pub path: PathBuf,
    pub flags: OpenFlags,
    pub pos: u32,
    pub size: u32,
    base: Base,
    base_size: u32,
    inline: heapless::Vec<u8, INLINE_MAX>,
    pub dirty: bool,
    /// The entry was removed or replaced, nothing is committed any more.
    pub orphaned: bool,
    writer: Option<Writer>,
    /// Last chain block looked up, as index and block number.
    hint: Option<(u32, u32)>,
    cache: GenericArray<u8, C>,
}

impl<C: ArrayLength<u8>> Default for FileState<C> {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            flags: OpenFlags::empty(),
            pos: 0,
            size: 0,
            base: Base::Inline,
            base_size: 0,
            inline: heapless::Vec::new(),
            dirty: false,
            orphaned: false,
            writer: None,
            hint: None,
            cache: GenericArray::default(),
        }
    }
}

impl<C: ArrayLength<u8>> FileState<C> {
    /// State of a file that has no entry yet, or is truncated.
    pub fn created(path: PathBuf, flags: OpenFlags) -> Self {
        Self {
            path,
            flags,
            dirty: true,
            ..Self::default()
        }
    }

    pub fn opened(path: PathBuf, flags: OpenFlags, size: u32, data: FileData) -> Self {
        let mut state = Self {
            path,
            flags,
            size,
            base_size: size,
            ..Self::default()
        };
        match data {
            FileData::Inline(bytes) => state.inline = bytes,
            FileData::Chain { tail } => state.base = Base::Chain { tail },
        }
        state
    }

    /// Blocks this handle needs that the committed tree may not reference.
    pub fn pin(&self) -> Pin {
        let chain = match self.base {
            Base::Chain { tail } if self.base_size > 0 => Some((tail, self.base_size)),
            _ => None,
        };
        let pending = self.writer.map(|w| Pending {
            block: w.block,
            prev: w.prev,
            idx: w.idx,
        });
        Pin::File { chain, pending }
    }

    /// Drops unflushed writes, the committed base stays.
    pub fn abandon_writer(&mut self) {
        self.writer = None;
        self.size = self.base_size;
    }

    pub fn seek(&mut self, pos: SeekFrom, file_max: u32) -> Result<u32> {
        let target = match pos {
            SeekFrom::Start(off) => off as i64,
            SeekFrom::Current(delta) => self.pos as i64 + delta as i64,
            SeekFrom::End(delta) => self.size as i64 + delta as i64,
        };
        if target < 0 {
            return Err(Error::Invalid);
        }
        if target > file_max as i64 {
            return Err(Error::FileTooLarge);
        }
        self.pos = target as u32;
        Ok(self.pos)
    }
}

impl<D: BlockDevice> Volume<D> {
    /// Block `idx` of the base chain.
    fn chain_block(&mut self, file: &mut FileState<D::CacheSize>, idx: u32) -> Result<u32> {
        let Base::Chain { tail } = file.base else {
            return Err(Error::Corrupt);
        };
        let payload = self.io.geometry.payload_size();
        let last = file.base_size.div_ceil(payload).saturating_sub(1);
        if idx > last {
            return Err(Error::Corrupt);
        }
        let (mut at, mut block) = match file.hint {
            Some((hint_idx, hint_block)) if hint_idx >= idx => (hint_idx, hint_block),
            _ => (last, tail),
        };
        while at > idx {
            block = self.io.read_u32(block, 0)?;
            self.io.check_block(block)?;
            at -= 1;
        }
        file.hint = Some((idx, block));
        Ok(block)
    }

    /// Reads committed content at `pos`, returns the number of bytes read.
    fn read_base(
        &mut self,
        file: &mut FileState<D::CacheSize>,
        mut pos: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        if pos >= file.base_size {
            return Ok(0);
        }
        let len = buf.len().min((file.base_size - pos) as usize);
        if file.base == Base::Inline {
            let start = pos as usize;
            let src = file.inline.get(start..start + len).ok_or(Error::Corrupt)?;
            buf[..len].copy_from_slice(src);
            return Ok(len);
        }

        let payload = self.io.geometry.payload_size();
        let mut done = 0;
        while done < len {
            let idx = pos / payload;
            let off = pos % payload;
            let n = ((payload - off) as usize).min(len - done);
            let block = self.chain_block(file, idx)?;
            self.io.read(block, 4 + off, &mut buf[done..done + n])?;
            done += n;
            pos += n as u32;
        }
        Ok(len)
    }

    /// Opens a new chain whose content up to `at` equals the base.
    fn writer_start(
        &mut self,
        file: &mut FileState<D::CacheSize>,
        at: u32,
        pins: &Pins,
    ) -> Result<()> {
        let payload = self.io.geometry.payload_size();
        let idx = at / payload;
        let prev = if idx > 0 {
            self.chain_block(file, idx - 1)?
        } else {
            NULL_BLOCK
        };
        let block = self.alloc_erased(pins)?;
        set_u32_le(&mut file.cache[..4], prev);
        file.writer = Some(Writer {
            block,
            prev,
            idx,
            pos: idx * payload,
            base: 0,
            fill: 4,
        });
        self.copy_base(file, at, pins)
    }

    fn writer_push(
        &mut self,
        file: &mut FileState<D::CacheSize>,
        mut data: &[u8],
        pins: &Pins,
    ) -> Result<()> {
        let block_size = self.io.geometry.block_size;
        let cache = file.cache.len() as u32;
        while !data.is_empty() {
            let mut w = file.writer.ok_or(Error::Invalid)?;
            if w.base == block_size {
                let next = self.alloc_erased(pins)?;
                set_u32_le(&mut file.cache[..4], w.block);
                w = Writer {
                    block: next,
                    prev: w.block,
                    idx: w.idx + 1,
                    pos: w.pos,
                    base: 0,
                    fill: 4,
                };
                file.writer = Some(w);
            }
            let start = w.fill as usize;
            let n = data.len().min((cache - w.fill) as usize);
            file.cache[start..start + n].copy_from_slice(&data[..n]);
            w.fill += n as u32;
            w.pos += n as u32;
            data = &data[n..];
            if w.fill == cache {
                self.io.program(w.block, w.base, &file.cache)?;
                w.base += cache;
                w.fill = 0;
            }
            file.writer = Some(w);
        }
        Ok(())
    }

    /// Copies base content from the writer position up to `until`.
    fn copy_base(
        &mut self,
        file: &mut FileState<D::CacheSize>,
        until: u32,
        pins: &Pins,
    ) -> Result<()> {
        let mut chunk = [0u8; 64];
        loop {
            let pos = file.writer.ok_or(Error::Invalid)?.pos;
            if pos >= until {
                return Ok(());
            }
            let n = ((until - pos) as usize).min(chunk.len());
            let read = self.read_base(file, pos, &mut chunk[..n])?;
            if read != n {
                return Err(Error::Corrupt);
            }
            self.writer_push(file, &chunk[..n], pins)?;
        }
    }

    /// Completes the writer's chain, which becomes the uncommitted base.
    fn writer_flush(&mut self, file: &mut FileState<D::CacheSize>, pins: &Pins) -> Result<()> {
        if file.writer.is_none() {
            return Ok(());
        }
        let until = file.base_size;
        self.copy_base(file, until, pins)?;
        let w = file.writer.ok_or(Error::Invalid)?;
        if w.fill > 0 {
            let len = self.io.geometry.round_up(w.fill) as usize;
            self.io.program(w.block, w.base, &file.cache[..len])?;
        }
        trace!("flushed chain tail {} size {}", w.block, w.pos);
        file.writer = None;
        file.base = Base::Chain { tail: w.block };
        file.base_size = w.pos;
        file.size = w.pos;
        file.inline.clear();
        file.hint = None;
        file.dirty = true;
        Ok(())
    }

    pub fn file_read(
        &mut self,
        file: &mut FileState<D::CacheSize>,
        buf: &mut [u8],
        pins: &Pins,
    ) -> Result<usize> {
        if !file.flags.contains(OpenFlags::READ) {
            return Err(Error::NotReadable);
        }
        if let Err(e) = self.writer_flush(file, pins) {
            file.abandon_writer();
            return Err(e);
        }
        let pos = file.pos;
        let n = self.read_base(file, pos, buf)?;
        file.pos += n as u32;
        Ok(n)
    }

    pub fn file_write(
        &mut self,
        file: &mut FileState<D::CacheSize>,
        data: &[u8],
        pins: &Pins,
    ) -> Result<usize> {
        if !file.flags.contains(OpenFlags::WRITE) {
            return Err(Error::NotWritable);
        }
        if data.is_empty() {
            return Ok(0);
        }
        let end = file.pos as u64 + data.len() as u64;
        if end > self.io.geometry.file_max() as u64 {
            return Err(Error::FileTooLarge);
        }
        match self.write_at_pos(file, data, end as u32, pins) {
            Ok(()) => Ok(data.len()),
            Err(e) => {
                file.abandon_writer();
                Err(e)
            }
        }
    }

    fn write_at_pos(
        &mut self,
        file: &mut FileState<D::CacheSize>,
        data: &[u8],
        end: u32,
        pins: &Pins,
    ) -> Result<()> {
        if matches!(file.writer, Some(w) if w.pos != file.pos) {
            self.writer_flush(file, pins)?;
        }

        if file.writer.is_none()
            && file.base == Base::Inline
            && end.max(file.size) as usize <= INLINE_MAX
        {
            let start = file.pos as usize;
            if file.inline.len() < end as usize {
                file.inline
                    .resize(end as usize, 0)
                    .map_err(|_| Error::FileTooLarge)?;
            }
            file.inline[start..end as usize].copy_from_slice(data);
            file.size = file.inline.len() as u32;
            file.base_size = file.size;
            file.pos = end;
            file.dirty = true;
            return Ok(());
        }

        if file.writer.is_none() {
            let at = file.pos.min(file.size);
            self.writer_start(file, at, pins)?;
        }
        let zeros = [0u8; 64];
        loop {
            let pos = file.writer.ok_or(Error::Invalid)?.pos;
            if pos >= file.pos {
                break;
            }
            let n = ((file.pos - pos) as usize).min(zeros.len());
            self.writer_push(file, &zeros[..n], pins)?;
        }
        self.writer_push(file, data, pins)?;
        file.pos = end;
        file.size = file.size.max(end);
        file.dirty = true;
        Ok(())
    }

    /// Flushes the writer and commits the file's entry.
    pub fn file_sync(&mut self, file: &mut FileState<D::CacheSize>, pins: &Pins) -> Result<()> {
        if let Err(e) = self.writer_flush(file, pins) {
            file.abandon_writer();
            return Err(e);
        }
        if !file.dirty || file.orphaned {
            return Ok(());
        }

        let path = Path::parse(&file.path)?;
        let data = match file.base {
            Base::Inline => FileData::Inline(file.inline.clone()),
            Base::Chain { tail } => FileData::Chain { tail },
        };
        let entry = Entry {
            name: make_name(path.name()?)?,
            kind: EntryKind::File {
                size: file.size,
                data,
            },
        };
        let root = self.root();
        let root = self.apply(root, path.parent(), Edit::Upsert(&entry), pins)?;
        self.commit(root)?;
        debug!("synced {} size {}", file.path.as_str(), file.size);
        file.dirty = false;
        Ok(())
    }
}
