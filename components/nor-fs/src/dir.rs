//! Directory blocks.
//!
//! A directory is a forward-linked chain of blocks:
//!
//! | bytes              | content                                   |
//! |--------------------|-------------------------------------------|
//! | `0 - used`         | records: `u16` LE length, postcard `Entry` |
//! | `used - region`    | never programmed                          |
//! | `region - region+3`| magic `DIRB`                              |
//! | `+4 - +7`          | bytes used by records                     |
//! | `+8 - +11`         | next block of the chain or `0xffff_ffff`  |
//! | `+12 - +15`        | CRC-32 over the records and bytes +0..+11 |
//!
//! with `region = block_size - footer_size`. Directories are never modified
//! in place, every change writes a new chain.

use serde::{Deserialize, Serialize};

use crate::crc::{crc32_finish, crc32_update, get_u16_le, get_u32_le, set_u16_le, set_u32_le, CRC32_INIT};
use crate::driver::BlockDevice;
use crate::error::{Error, Result};
use crate::fs::{FileType, Metadata};
use crate::io::{Io, NULL_BLOCK};
use crate::{Name, INLINE_MAX};

pub(crate) const FOOTER_LEN: usize = 16;
/// Longest serialized entry.
pub(crate) const RECORD_MAX: usize = 192;
const DIR_MAGIC: [u8; 4] = *b"DIRB";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Entry {
    pub name: Name,
    pub kind: EntryKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum EntryKind {
    File { size: u32, data: FileData },
    Dir { head: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum FileData {
    Inline(heapless::Vec<u8, INLINE_MAX>),
    /// Last block of a backward-linked chain.
    Chain { tail: u32 },
}

impl Entry {
    pub fn dir(name: &str, head: u32) -> Result<Self> {
        Ok(Self {
            name: make_name(name)?,
            kind: EntryKind::Dir { head },
        })
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, EntryKind::Dir { .. })
    }

    pub fn metadata(&self) -> Metadata {
        match self.kind {
            EntryKind::File { size, .. } => Metadata {
                file_type: FileType::File,
                size,
            },
            EntryKind::Dir { .. } => Metadata {
                file_type: FileType::Dir,
                size: 0,
            },
        }
    }

    /// Writes the length-prefixed record, returns its total length.
    pub fn encode(&self, buf: &mut [u8; RECORD_MAX + 2]) -> Result<usize> {
        let len = postcard::to_slice(self, &mut buf[2..])
            .map_err(|_| Error::NameTooLong)?
            .len();
        set_u16_le(buf, len as u16);
        Ok(len + 2)
    }

    fn validate(&self, block_count: u32) -> Result<()> {
        let in_range = |b: u32| b >= 2 && b < block_count;
        let ok = match &self.kind {
            EntryKind::Dir { head } => in_range(*head),
            EntryKind::File {
                size,
                data: FileData::Inline(data),
            } => data.len() as u32 == *size,
            EntryKind::File {
                size,
                data: FileData::Chain { tail },
            } => *size > 0 && in_range(*tail),
        };
        if ok && !self.name.is_empty() {
            Ok(())
        } else {
            error!("invalid directory entry {:?}", self);
            Err(Error::Corrupt)
        }
    }
}

pub(crate) fn make_name(name: &str) -> Result<Name> {
    let mut out = Name::new();
    out.push_str(name).map_err(|_| Error::NameTooLong)?;
    Ok(out)
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct Footer {
    pub used: u32,
    pub next: u32,
}

/// Iteration state over a directory chain, also the directory handle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct DirCursor {
    pub block: u32,
    pub off: u32,
    pub used: u32,
    pub next: u32,
    hops: u32,
}

impl Default for DirCursor {
    fn default() -> Self {
        Self {
            block: NULL_BLOCK,
            off: 0,
            used: 0,
            next: NULL_BLOCK,
            hops: 0,
        }
    }
}

/// A directory chain being written.
#[derive(Clone, Copy, Debug)]
pub(crate) struct DirWriter {
    pub head: u32,
    pub block: u32,
    pub used: u32,
    crc: u32,
    base: u32,
    fill: u32,
}

impl DirWriter {
    pub fn new(block: u32) -> Self {
        Self {
            head: block,
            block,
            used: 0,
            crc: CRC32_INIT,
            base: 0,
            fill: 0,
        }
    }

    /// Continues the chain in a fresh `block`, after the previous was sealed.
    pub fn advance(&mut self, block: u32) {
        *self = Self {
            head: self.head,
            ..Self::new(block)
        };
    }
}

impl<D: BlockDevice> Io<D> {
    fn region(&self) -> u32 {
        self.geometry.block_size - self.geometry.footer_size()
    }

    /// Room for records in one directory block.
    pub fn dir_capacity(&self) -> u32 {
        self.region()
    }

    pub fn load_footer(&mut self, block: u32) -> Result<Footer> {
        self.check_block(block)?;
        let region = self.region();
        let mut footer = [0u8; FOOTER_LEN];
        self.read(block, region, &mut footer)?;
        if footer[..4] != DIR_MAGIC {
            error!("block {} is not a directory block", block);
            return Err(Error::Corrupt);
        }
        let used = get_u32_le(&footer[4..]);
        let next = get_u32_le(&footer[8..]);
        if used > region || (next != NULL_BLOCK && (next < 2 || next >= self.geometry.block_count)) {
            error!("directory block {} has a bad footer", block);
            return Err(Error::Corrupt);
        }

        let mut crc = CRC32_INIT;
        let mut chunk = [0u8; 32];
        let mut off = 0;
        while off < used {
            let n = (used - off).min(chunk.len() as u32) as usize;
            self.read(block, off, &mut chunk[..n])?;
            crc = crc32_update(crc, &chunk[..n]);
            off += n as u32;
        }
        crc = crc32_update(crc, &footer[..12]);
        if crc32_finish(crc) != get_u32_le(&footer[12..]) {
            error!("directory block {} fails its checksum", block);
            return Err(Error::Corrupt);
        }
        Ok(Footer { used, next })
    }

    /// Decodes the record at `off`, returns it with its length on disk.
    pub fn read_record(&mut self, block: u32, off: u32, used: u32) -> Result<(Entry, u32)> {
        let mut prefix = [0u8; 2];
        self.read(block, off, &mut prefix)?;
        let len = get_u16_le(&prefix) as usize;
        if len == 0 || len > RECORD_MAX || off + 2 + len as u32 > used {
            return Err(Error::Corrupt);
        }
        let mut buf = [0u8; RECORD_MAX];
        self.read(block, off + 2, &mut buf[..len])?;
        let entry: Entry = postcard::from_bytes(&buf[..len]).map_err(|_| Error::Corrupt)?;
        entry.validate(self.geometry.block_count)?;
        Ok((entry, len as u32 + 2))
    }

    pub fn dir_open(&mut self, head: u32) -> Result<DirCursor> {
        let footer = self.load_footer(head)?;
        Ok(DirCursor {
            block: head,
            off: 0,
            used: footer.used,
            next: footer.next,
            hops: 0,
        })
    }

    pub fn dir_next(&mut self, cursor: &mut DirCursor) -> Result<Option<Entry>> {
        loop {
            if cursor.block == NULL_BLOCK {
                return Ok(None);
            }
            if cursor.off < cursor.used {
                let (entry, len) = self.read_record(cursor.block, cursor.off, cursor.used)?;
                cursor.off += len;
                return Ok(Some(entry));
            }
            if cursor.next == NULL_BLOCK {
                cursor.block = NULL_BLOCK;
                return Ok(None);
            }
            cursor.hops += 1;
            if cursor.hops > self.geometry.block_count {
                return Err(Error::Corrupt);
            }
            let next = cursor.next;
            let footer = self.load_footer(next)?;
            cursor.block = next;
            cursor.off = 0;
            cursor.used = footer.used;
            cursor.next = footer.next;
        }
    }

    pub fn dir_find(&mut self, head: u32, name: &str) -> Result<Option<Entry>> {
        let mut cursor = self.dir_open(head)?;
        while let Some(entry) = self.dir_next(&mut cursor)? {
            if entry.name == name {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    pub fn dir_is_empty(&mut self, head: u32) -> Result<bool> {
        let mut cursor = self.dir_open(head)?;
        Ok(self.dir_next(&mut cursor)?.is_none())
    }

    /// Appends record bytes, the caller made sure they fit the block.
    pub fn dir_stream(&mut self, w: &mut DirWriter, mut bytes: &[u8]) -> Result<()> {
        let cache = self.pcache.len() as u32;
        let region = self.region();
        w.crc = crc32_update(w.crc, bytes);
        w.used += bytes.len() as u32;
        while !bytes.is_empty() {
            let n = (bytes.len() as u32).min(cache - w.fill) as usize;
            let start = w.fill as usize;
            self.pcache[start..start + n].copy_from_slice(&bytes[..n]);
            w.fill += n as u32;
            bytes = &bytes[n..];
            if w.fill == cache || w.base + w.fill == region {
                let len = self.geometry.round_up(w.fill) as usize;
                self.program_pcache(w.block, w.base, len)?;
                w.base += w.fill;
                w.fill = 0;
            }
        }
        Ok(())
    }

    /// Programs what is left of the records and the footer linking to `next`.
    pub fn dir_seal(&mut self, w: &mut DirWriter, next: u32) -> Result<()> {
        if w.fill > 0 {
            let len = self.geometry.round_up(w.fill) as usize;
            self.program_pcache(w.block, w.base, len)?;
            w.base += w.fill;
            w.fill = 0;
        }
        let footer_size = self.geometry.footer_size() as usize;
        let region = self.region();
        let footer = &mut self.pcache[..footer_size];
        footer.fill(0);
        footer[..4].copy_from_slice(&DIR_MAGIC);
        set_u32_le(&mut footer[4..], w.used);
        set_u32_le(&mut footer[8..], next);
        let crc = crc32_finish(crc32_update(w.crc, &footer[..12]));
        set_u32_le(&mut footer[12..], crc);
        self.program_pcache(w.block, region, footer_size)
    }
}
