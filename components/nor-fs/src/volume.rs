//! Mounted filesystem state: superblock log, allocator and copy-on-write
//! directory updates.

use crate::alloc_map::{Lookahead, Step};
use crate::dir::{DirWriter, Entry, EntryKind, FileData};
use crate::driver::{BlockDevice, Geometry};
use crate::error::{Error, Result};
use crate::io::{Io, NULL_BLOCK};
use crate::path::Path;
use crate::superblock::{newer, SuperState, Superblock, RECORD_LEN, SUPERBLOCK_PAIR, VERSION};
use crate::MAX_DEPTH;

/// Blocks an open handle keeps alive although they may be unreachable from
/// the committed root.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) enum Pin {
    #[default]
    None,
    File {
        /// Tail and size of the chain the handle reads from.
        chain: Option<(u32, u32)>,
        pending: Option<Pending>,
    },
    /// Remaining chain of a directory being iterated.
    Dir { block: u32 },
}

/// A chain under construction, `block` may not be programmed yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Pending {
    pub block: u32,
    pub prev: u32,
    pub idx: u32,
}

pub(crate) struct Pins<'a> {
    pub files: &'a [Pin],
    pub dirs: &'a [Pin],
}

impl Pins<'static> {
    pub const NONE: Self = Pins {
        files: &[],
        dirs: &[],
    };
}

/// One change to a single directory.
#[derive(Clone, Copy)]
pub(crate) enum Edit<'a> {
    /// Appends a new entry, fails if the name is taken.
    Insert(&'a Entry),
    /// Replaces the entry of the same name in place, or appends it.
    Upsert(&'a Entry),
    Remove(&'a str),
    /// Replaces `from` in place and drops any entry named like `to`.
    Rename { from: &'a str, to: &'a Entry },
    SetHead { name: &'a str, head: u32 },
}

pub(crate) enum Node {
    Root,
    Entry(Entry),
}

pub(crate) struct Volume<D: BlockDevice> {
    pub io: Io<D>,
    free: Lookahead<D::LookaheadSize>,
    sb: SuperState,
}

impl<D: BlockDevice> Volume<D> {
    pub fn new(dev: D) -> Self {
        let io = Io::new(dev);
        let geometry = io.geometry;
        Self {
            free: Lookahead::new(2, geometry.block_count),
            sb: SuperState {
                current: Superblock {
                    version: VERSION,
                    revision: 0,
                    block_size: geometry.block_size,
                    block_count: geometry.block_count,
                    root: NULL_BLOCK,
                    cursor: 2,
                    pair_erases: 0,
                },
                revision: 0,
                pair_erases: 0,
                block: SUPERBLOCK_PAIR[0],
                next_slot: None,
            },
            io,
        }
    }

    pub fn into_device(self) -> D {
        self.io.dev
    }

    pub fn geometry(&self) -> Geometry {
        self.io.geometry
    }

    pub fn root(&self) -> u32 {
        self.sb.current.root
    }

    pub fn revision(&self) -> u32 {
        self.sb.current.revision
    }

    pub fn pair_erases(&self) -> u32 {
        self.sb.pair_erases
    }

    pub fn worn(&self) -> bool {
        let cycles = self.io.geometry.block_cycles;
        cycles != 0 && self.sb.pair_erases / 2 >= cycles
    }

    fn slot_size(&self) -> u32 {
        self.io.geometry.round_up(RECORD_LEN as u32)
    }

    fn slots(&self) -> u32 {
        self.io.geometry.block_size / self.slot_size()
    }

    pub fn load(&mut self) -> Result<()> {
        let geometry = self.io.geometry;
        let slot_size = self.slot_size();
        let mut best: Option<(Superblock, u32)> = None;
        let mut buf = [0u8; RECORD_LEN];
        for block in SUPERBLOCK_PAIR {
            for slot in 0..self.slots() {
                self.io.read(block, slot * slot_size, &mut buf)?;
                if let Some(record) = Superblock::decode(&buf) {
                    if best.map_or(true, |(b, _)| newer(record.revision, b.revision)) {
                        best = Some((record, block));
                    }
                }
            }
        }

        let Some((record, block)) = best else {
            info!("no superblock found");
            return Err(Error::NotFormatted);
        };
        if record.major() != (VERSION >> 16) as u16 {
            error!("unsupported on-disk version {:x}", record.version);
            return Err(Error::Corrupt);
        }
        if record.block_size != geometry.block_size || record.block_count != geometry.block_count {
            error!(
                "geometry mismatch: {}x{} on disk",
                record.block_size, record.block_count
            );
            return Err(Error::Corrupt);
        }
        if record.root < 2 || record.root >= geometry.block_count {
            return Err(Error::Corrupt);
        }
        self.io.load_footer(record.root)?;

        self.sb = SuperState {
            current: record,
            revision: record.revision,
            pair_erases: record.pair_erases,
            block,
            next_slot: None,
        };
        self.free = Lookahead::new(record.cursor, geometry.block_count);
        debug!(
            "superblock revision {} in block {}, root {}",
            record.revision, block, record.root
        );
        Ok(())
    }

    pub fn format(&mut self) -> Result<()> {
        let geometry = self.io.geometry;
        geometry.validate()?;
        for block in SUPERBLOCK_PAIR {
            self.io.erase(block)?;
        }
        self.sb.block = SUPERBLOCK_PAIR[0];
        self.sb.next_slot = Some(0);
        self.free = Lookahead::new(2, geometry.block_count);
        self.ack();

        let mut w = self.dir_begin(&Pins::NONE)?;
        let root = self.dir_finish(&mut w)?;
        self.commit(root)?;

        // Second copy of the first record, the pair is never left with a
        // single valid block after a format.
        let record = self.sb.current;
        self.write_record(SUPERBLOCK_PAIR[1], 0, &record)?;
        self.io.sync()
    }

    fn write_record(&mut self, block: u32, slot: u32, record: &Superblock) -> Result<()> {
        let slot_size = self.slot_size() as usize;
        let buf = &mut self.io.pcache[..slot_size];
        buf.fill(0);
        record.encode(&mut buf[..RECORD_LEN]);
        self.io.program_pcache(block, slot * slot_size as u32, slot_size)
    }

    /// Makes `root` the committed root directory.
    pub fn commit(&mut self, root: u32) -> Result<()> {
        let geometry = self.io.geometry;
        self.sb.revision = self.sb.revision.wrapping_add(1);
        let mut record = Superblock {
            version: VERSION,
            revision: self.sb.revision,
            block_size: geometry.block_size,
            block_count: geometry.block_count,
            root,
            cursor: self.free.cursor(geometry.block_count),
            pair_erases: self.sb.pair_erases,
        };
        self.io.sync()?;

        let (block, slot) = match self.sb.next_slot {
            Some(slot) if slot < self.slots() => (self.sb.block, slot),
            _ => {
                let other = if self.sb.block == SUPERBLOCK_PAIR[0] {
                    SUPERBLOCK_PAIR[1]
                } else {
                    SUPERBLOCK_PAIR[0]
                };
                self.sb.next_slot = None;
                self.io.erase(other)?;
                self.sb.pair_erases = self.sb.pair_erases.wrapping_add(1);
                record.pair_erases = self.sb.pair_erases;
                self.sb.block = other;
                debug!("superblock moves to block {}", other);
                if self.worn() {
                    warn!(
                        "superblock pair erased {} times, rated for {} cycles",
                        self.sb.pair_erases, geometry.block_cycles
                    );
                }
                (other, 0)
            }
        };
        self.sb.next_slot = Some(slot + 1);
        self.write_record(block, slot, &record)?;
        self.io.sync()?;

        self.sb.current = record;
        self.ack();
        debug!("committed revision {} root {}", record.revision, root);
        Ok(())
    }

    /// Marks every block handed out so far as reachable or abandoned.
    pub fn ack(&mut self) {
        self.free.ack(self.io.geometry.block_count);
    }

    pub fn alloc(&mut self, pins: &Pins) -> Result<u32> {
        let count = self.io.geometry.block_count;
        loop {
            match self.free.step(count) {
                Step::Found(block) => return Ok(block),
                Step::Refill => self.refill(pins)?,
                Step::Exhausted => {
                    warn!("no free blocks left");
                    return Err(Error::NoSpace);
                }
            }
        }
    }

    pub fn alloc_erased(&mut self, pins: &Pins) -> Result<u32> {
        let block = self.alloc(pins)?;
        self.io.erase(block)?;
        Ok(block)
    }

    fn refill(&mut self, pins: &Pins) -> Result<()> {
        let count = self.io.geometry.block_count;
        let root = self.sb.current.root;
        self.free.begin_refill();
        let Self { io, free, .. } = self;
        let result = traverse(io, root, pins, &mut |block| free.mark(block, count));
        if result.is_err() {
            self.free.invalidate();
        }
        result
    }

    /// Blocks reachable from the committed root, superblocks included.
    pub fn used_blocks(&mut self) -> Result<u32> {
        let root = self.sb.current.root;
        let mut used = 0;
        traverse(&mut self.io, root, &Pins::NONE, &mut |_| used += 1)?;
        Ok(used)
    }

    pub fn dir_begin(&mut self, pins: &Pins) -> Result<DirWriter> {
        let block = self.alloc_erased(pins)?;
        Ok(DirWriter::new(block))
    }

    pub fn dir_push(&mut self, w: &mut DirWriter, entry: &Entry, pins: &Pins) -> Result<()> {
        let mut buf = [0u8; crate::dir::RECORD_MAX + 2];
        let len = entry.encode(&mut buf)?;
        if w.used + len as u32 > self.io.dir_capacity() {
            let next = self.alloc_erased(pins)?;
            self.io.dir_seal(w, next)?;
            w.advance(next);
        }
        self.io.dir_stream(w, &buf[..len])
    }

    pub fn dir_finish(&mut self, w: &mut DirWriter) -> Result<u32> {
        self.io.dir_seal(w, NULL_BLOCK)?;
        Ok(w.head)
    }

    /// Writes a copy of the directory at `head` with `edit` applied.
    fn rewrite_dir(&mut self, head: u32, edit: Edit, pins: &Pins) -> Result<u32> {
        let mut cursor = self.io.dir_open(head)?;
        let mut w = self.dir_begin(pins)?;
        let mut hit = false;
        while let Some(entry) = self.io.dir_next(&mut cursor)? {
            match edit {
                Edit::Insert(new) if entry.name == new.name => return Err(Error::Exists),
                Edit::Upsert(new) if entry.name == new.name => {
                    match (entry.is_dir(), new.is_dir()) {
                        (true, false) => return Err(Error::IsDir),
                        (false, true) => return Err(Error::NotDir),
                        _ => {}
                    }
                    hit = true;
                    self.dir_push(&mut w, new, pins)?;
                }
                Edit::Remove(name) if entry.name == name => hit = true,
                Edit::Rename { from, to } if entry.name == from => {
                    hit = true;
                    self.dir_push(&mut w, to, pins)?;
                }
                Edit::Rename { to, .. } if entry.name == to.name => {}
                Edit::SetHead { name, head } if entry.name == name => {
                    hit = true;
                    self.dir_push(&mut w, &Entry::dir(name, head)?, pins)?;
                }
                _ => self.dir_push(&mut w, &entry, pins)?,
            }
        }
        match edit {
            Edit::Insert(new) | Edit::Upsert(new) => {
                if !hit {
                    self.dir_push(&mut w, new, pins)?;
                }
            }
            _ if !hit => return Err(Error::NotFound),
            _ => {}
        }
        self.dir_finish(&mut w)
    }

    /// Applies `edit` to the directory at `dirs` below `root` and rewrites
    /// every ancestor, returns the new root. Nothing is committed.
    pub fn apply(&mut self, root: u32, dirs: &[&str], edit: Edit, pins: &Pins) -> Result<u32> {
        match dirs.split_first() {
            None => self.rewrite_dir(root, edit, pins),
            Some((&name, rest)) => {
                let child = self.lookup_dir(root, name)?;
                let child = self.apply(child, rest, edit, pins)?;
                self.rewrite_dir(root, Edit::SetHead { name, head: child }, pins)
            }
        }
    }

    fn lookup_dir(&mut self, head: u32, name: &str) -> Result<u32> {
        match self.io.dir_find(head, name)? {
            Some(Entry {
                kind: EntryKind::Dir { head },
                ..
            }) => Ok(head),
            Some(_) => Err(Error::NotDir),
            None => Err(Error::NotFound),
        }
    }

    /// Head block of the directory with the given components.
    pub fn resolve_dir(&mut self, dirs: &[&str]) -> Result<u32> {
        let mut head = self.sb.current.root;
        for name in dirs {
            head = self.lookup_dir(head, name)?;
        }
        Ok(head)
    }

    pub fn resolve(&mut self, path: &Path) -> Result<Node> {
        let Ok(name) = path.name() else {
            return Ok(Node::Root);
        };
        let parent = self.resolve_dir(path.parent())?;
        let entry = self.io.dir_find(parent, name)?.ok_or(Error::NotFound)?;
        if path.dir_hint() && !entry.is_dir() {
            return Err(Error::NotDir);
        }
        Ok(Node::Entry(entry))
    }

    /// Levels of directories below the one at `head`.
    pub fn dir_height(&mut self, head: u32, level: usize) -> Result<usize> {
        if level > MAX_DEPTH {
            return Err(Error::Corrupt);
        }
        let mut cursor = self.io.dir_open(head)?;
        let mut height = 0;
        while let Some(entry) = self.io.dir_next(&mut cursor)? {
            if let EntryKind::Dir { head } = entry.kind {
                height = height.max(1 + self.dir_height(head, level + 1)?);
            }
        }
        Ok(height)
    }
}

/// Reports every block reachable from `root` or held by `pins`.
fn traverse<D: BlockDevice>(
    io: &mut Io<D>,
    root: u32,
    pins: &Pins,
    mark: &mut dyn FnMut(u32),
) -> Result<()> {
    for block in SUPERBLOCK_PAIR {
        mark(block);
    }
    if root != NULL_BLOCK {
        walk_dir(io, root, 0, mark)?;
    }
    for pin in pins.files.iter().chain(pins.dirs.iter()) {
        match *pin {
            Pin::None => {}
            Pin::File { chain, pending } => {
                if let Some((tail, size)) = chain {
                    walk_chain(io, tail, size, mark)?;
                }
                if let Some(pending) = pending {
                    mark(pending.block);
                    walk_back(io, pending.prev, pending.idx, mark)?;
                }
            }
            Pin::Dir { block } => walk_dir_blocks(io, block, mark)?,
        }
    }
    Ok(())
}

fn walk_dir<D: BlockDevice>(
    io: &mut Io<D>,
    head: u32,
    depth: usize,
    mark: &mut dyn FnMut(u32),
) -> Result<()> {
    if depth > MAX_DEPTH {
        error!("directory nesting too deep at block {}", head);
        return Err(Error::Corrupt);
    }
    let mut block = head;
    let mut hops = 0;
    while block != NULL_BLOCK {
        mark(block);
        let footer = io.load_footer(block)?;
        let mut off = 0;
        while off < footer.used {
            let (entry, len) = io.read_record(block, off, footer.used)?;
            off += len;
            match entry.kind {
                EntryKind::Dir { head } => walk_dir(io, head, depth + 1, mark)?,
                EntryKind::File {
                    size,
                    data: FileData::Chain { tail },
                } => walk_chain(io, tail, size, mark)?,
                EntryKind::File { .. } => {}
            }
        }
        block = footer.next;
        hops += 1;
        if hops > io.geometry.block_count {
            return Err(Error::Corrupt);
        }
    }
    Ok(())
}

fn walk_dir_blocks<D: BlockDevice>(
    io: &mut Io<D>,
    mut block: u32,
    mark: &mut dyn FnMut(u32),
) -> Result<()> {
    let mut hops = 0;
    while block != NULL_BLOCK {
        mark(block);
        block = io.load_footer(block)?.next;
        hops += 1;
        if hops > io.geometry.block_count {
            return Err(Error::Corrupt);
        }
    }
    Ok(())
}

fn walk_chain<D: BlockDevice>(
    io: &mut Io<D>,
    tail: u32,
    size: u32,
    mark: &mut dyn FnMut(u32),
) -> Result<()> {
    let blocks = size.div_ceil(io.geometry.payload_size());
    walk_back(io, tail, blocks, mark)
}

/// Marks `count` blocks of a chain, starting at `block` and following the
/// back pointers.
fn walk_back<D: BlockDevice>(
    io: &mut Io<D>,
    mut block: u32,
    count: u32,
    mark: &mut dyn FnMut(u32),
) -> Result<()> {
    for i in 0..count {
        io.check_block(block)?;
        mark(block);
        if i + 1 < count {
            block = io.read_u32(block, 0)?;
        }
    }
    Ok(())
}
