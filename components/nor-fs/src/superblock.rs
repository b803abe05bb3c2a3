use crate::crc::{crc32, get_u32_le, set_u32_le};

pub(crate) const MAGIC: [u8; 4] = *b"NRFS";
/// Major version in the upper half, minor version in the lower half.
pub(crate) const VERSION: u32 = 0x0001_0000;
pub(crate) const RECORD_LEN: usize = 36;
pub(crate) const SUPERBLOCK_PAIR: [u32; 2] = [0, 1];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Superblock {
    pub version: u32,
    pub revision: u32,
    pub block_size: u32,
    pub block_count: u32,
    pub root: u32,
    pub cursor: u32,
    pub pair_erases: u32,
}

impl Superblock {
    pub fn encode(&self, buf: &mut [u8]) {
        buf[..4].copy_from_slice(&MAGIC);
        set_u32_le(&mut buf[4..], self.version);
        set_u32_le(&mut buf[8..], self.revision);
        set_u32_le(&mut buf[12..], self.block_size);
        set_u32_le(&mut buf[16..], self.block_count);
        set_u32_le(&mut buf[20..], self.root);
        set_u32_le(&mut buf[24..], self.cursor);
        set_u32_le(&mut buf[28..], self.pair_erases);
        let crc = crc32(&buf[..32]);
        set_u32_le(&mut buf[32..], crc);
    }

    /// `None` for erased, torn or foreign slots.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < RECORD_LEN || buf[..4] != MAGIC {
            return None;
        }
        if crc32(&buf[..32]) != get_u32_le(&buf[32..]) {
            return None;
        }
        Some(Self {
            version: get_u32_le(&buf[4..]),
            revision: get_u32_le(&buf[8..]),
            block_size: get_u32_le(&buf[12..]),
            block_count: get_u32_le(&buf[16..]),
            root: get_u32_le(&buf[20..]),
            cursor: get_u32_le(&buf[24..]),
            pair_erases: get_u32_le(&buf[28..]),
        })
    }

    pub fn major(&self) -> u16 {
        (self.version >> 16) as u16
    }
}

/// Sequence comparison that survives the revision counter wrapping.
pub(crate) fn newer(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

/// Position of the superblock log.
#[derive(Clone, Copy, Debug)]
pub(crate) struct SuperState {
    /// Last committed record.
    pub current: Superblock,
    /// Highest revision handed out, committed or not.
    pub revision: u32,
    pub pair_erases: u32,
    /// Block of the pair currently appended to.
    pub block: u32,
    /// Next free slot in `block`, `None` forces a switch to the other block.
    pub next_slot: Option<u32>,
}
