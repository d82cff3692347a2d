//! Inodes.
//!
//! An inode is a one-sector record describing a file or directory: its
//! length and the sectors holding its content, reached through a three-tier
//! block map (direct pointers, first-level index blocks, one second-level
//! index block). Unallocated pointers hold [`SECTOR_NONE`]; they are filled
//! in on demand as writes land past the materialized extents, which is how
//! files grow.
//!
//! The kernel keeps a table of open inodes so that opening a sector twice
//! yields the same in-memory record. `open_count` tracks the live handles;
//! when the last handle closes an inode marked removed, every sector
//! reachable from its block map is returned to the free-map along with the
//! header sector itself.
//!
//! Locking: the open-inode table lock guards the table and the open counts;
//! each inode's cached on-disk image sits behind its own lock, held across
//! whole read/write operations so concurrent writers cannot interleave
//! block-map growth.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;
use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use super::FileSys;
use crate::param::{
    INDEX_FANOUT, MAXFILE, NDIRECT, NINDIRECT, SECTOR_NONE, SECTOR_SIZE,
};

/// Identifies an inode header sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Identifies a first-level index block.
pub const INDIRECT_MAGIC: u32 = 0x6899_5383;

/// Identifies the second-level index block.
pub const DOUBLY_MAGIC: u32 = 0x6631_2117;

/// On-disk inode. Exactly one sector.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct DiskInode {
    /// File size in bytes.
    pub length: i32,
    magic: u32,
    is_dir: u32,
    /// Own sector number, for header write-back.
    start: u32,
    direct: [u32; NDIRECT],
    indirect: [u32; NINDIRECT],
    doubly: u32,
}

const_assert_eq!(core::mem::size_of::<DiskInode>(), SECTOR_SIZE);

/// An index block: one sector of sector pointers behind a small header.
/// Both tiers share the shape and differ only in magic.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
struct IndexBlock {
    start: u32,
    magic: u32,
    slots: [u32; INDEX_FANOUT],
}

const_assert_eq!(core::mem::size_of::<IndexBlock>(), SECTOR_SIZE);

impl DiskInode {
    fn new(length: i32, is_dir: bool, start: u32) -> Self {
        Self {
            length,
            magic: INODE_MAGIC,
            is_dir: is_dir as u32,
            start,
            direct: [SECTOR_NONE; NDIRECT],
            indirect: [SECTOR_NONE; NINDIRECT],
            doubly: SECTOR_NONE,
        }
    }

    fn is_dir(&self) -> bool {
        self.is_dir != 0
    }
}

impl IndexBlock {
    fn new(magic: u32, start: u32) -> Self {
        Self {
            start,
            magic,
            slots: [SECTOR_NONE; INDEX_FANOUT],
        }
    }
}

/// In-memory record for an open on-disk inode. At most one exists per
/// sector; all handles to the same sector share it.
pub struct Inode {
    pub sector: u32,
    state: Mutex<OpenState>,
    data: Mutex<DiskInode>,
}

struct OpenState {
    open_count: u32,
    deny_write_count: u32,
    removed: bool,
}

/// Table of open inodes, keyed by sector.
pub struct Itable {
    list: Mutex<Vec<Arc<Inode>>>,
}

impl Itable {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(Vec::new()),
        }
    }
}

impl FileSys {
    /// Initializes an inode of `length` zero bytes at `sector`, materializing
    /// every data sector in `[0, length)`. Returns false if disk allocation
    /// fails; a partially built block map is rolled back.
    pub fn inode_create(&self, sector: u32, length: usize, is_dir: bool) -> bool {
        let mut data = DiskInode::new(length as i32, is_dir, sector);
        for pos in num_iter::range_step(0, length, SECTOR_SIZE) {
            if self.block_alloc(&mut data, pos).is_err() {
                self.release_blocks(&data);
                return false;
            }
        }
        self.write_header(&data);
        true
    }

    /// Returns a handle for the inode at `sector`, sharing the open record
    /// if one exists.
    pub fn inode_open(&self, sector: u32) -> Arc<Inode> {
        let mut list = self.itable.list.lock();
        if let Some(ino) = list.iter().find(|i| i.sector == sector) {
            ino.state.lock().open_count += 1;
            return ino.clone();
        }

        let mut data = DiskInode::new(0, false, sector);
        self.cache.read(sector, 0, data.as_bytes_mut());
        assert_eq!(data.magic, INODE_MAGIC, "inode_open: bad magic");
        let ino = Arc::new(Inode {
            sector,
            state: Mutex::new(OpenState {
                open_count: 1,
                deny_write_count: 0,
                removed: false,
            }),
            data: Mutex::new(data),
        });
        list.push(ino.clone());
        ino
    }

    /// Takes another handle on an already-open inode.
    pub fn inode_reopen(&self, ino: &Arc<Inode>) -> Arc<Inode> {
        let _list = self.itable.list.lock();
        ino.state.lock().open_count += 1;
        ino.clone()
    }

    /// Drops a handle. The last close of a removed inode releases every
    /// sector reachable from its block map and then the header sector
    /// itself.
    pub fn inode_close(&self, ino: Arc<Inode>) {
        let mut list = self.itable.list.lock();
        let (last, removed) = {
            let mut st = ino.state.lock();
            debug_assert!(st.open_count > 0);
            st.open_count -= 1;
            (st.open_count == 0, st.removed)
        };
        if !last {
            return;
        }
        if let Some(pos) = list.iter().position(|i| Arc::ptr_eq(i, &ino)) {
            let _ = list.swap_remove(pos);
        }
        if removed {
            let data = ino.data.lock();
            self.release_blocks(&data);
            self.freemap.lock().release(ino.sector, 1);
        }
    }

    /// Marks the inode for deletion at last close.
    pub fn inode_remove(&self, ino: &Inode) {
        ino.state.lock().removed = true;
    }

    /// Reads up to `buf.len()` bytes at byte offset `ofs`. Returns the byte
    /// count actually read, short at end of file. Holes read as zeros.
    pub fn inode_read_at(&self, ino: &Inode, buf: &mut [u8], ofs: usize) -> usize {
        let data = ino.data.lock();
        let length = data.length.max(0) as usize;
        let mut read = 0;
        while read < buf.len() {
            let pos = ofs + read;
            if pos >= length {
                break;
            }
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - read)
                .min(SECTOR_SIZE - sector_ofs)
                .min(length - pos);
            match self.block_lookup(&data, pos) {
                Some(sector) => self.cache.read(sector, sector_ofs, &mut buf[read..read + chunk]),
                None => buf[read..read + chunk].fill(0),
            }
            read += chunk;
        }
        read
    }

    /// Writes `buf` at byte offset `ofs`, extending the file when the write
    /// ends past the current length. Returns the byte count written, short
    /// only if disk allocation fails. Returns 0 while writes are denied.
    pub fn inode_write_at(&self, ino: &Inode, buf: &[u8], ofs: usize) -> usize {
        if ino.state.lock().deny_write_count > 0 {
            return 0;
        }
        let mut data = ino.data.lock();
        let end = (ofs + buf.len()).min(MAXFILE * SECTOR_SIZE);
        if end > data.length.max(0) as usize {
            data.length = end as i32;
        }
        let mut written = 0;
        while written < buf.len() {
            let pos = ofs + written;
            let sector_ofs = pos % SECTOR_SIZE;
            let chunk = (buf.len() - written).min(SECTOR_SIZE - sector_ofs);
            let sector = match self.block_alloc(&mut data, pos) {
                Ok(s) => s,
                Err(()) => break,
            };
            self.cache.write(sector, sector_ofs, &buf[written..written + chunk]);
            written += chunk;
        }
        // The loop may have added pointers; persist the header either way.
        self.write_header(&data);
        written
    }

    pub fn inode_length(&self, ino: &Inode) -> usize {
        ino.data.lock().length.max(0) as usize
    }

    pub fn inode_is_dir(&self, ino: &Inode) -> bool {
        ino.data.lock().is_dir()
    }

    /// Disables writes. May be called at most once per opener.
    pub fn inode_deny_write(&self, ino: &Inode) {
        let mut st = ino.state.lock();
        st.deny_write_count += 1;
        debug_assert!(st.deny_write_count <= st.open_count);
    }

    /// Re-enables writes; pairs with [`FileSys::inode_deny_write`].
    pub fn inode_allow_write(&self, ino: &Inode) {
        let mut st = ino.state.lock();
        debug_assert!(st.deny_write_count > 0);
        st.deny_write_count -= 1;
    }

    pub(super) fn inode_open_count(&self, ino: &Inode) -> u32 {
        ino.state.lock().open_count
    }

    /// Resolves byte offset `pos` to its data sector without allocating.
    /// `None` for holes and offsets past the block map.
    fn block_lookup(&self, data: &DiskInode, pos: usize) -> Option<u32> {
        let idx = pos / SECTOR_SIZE;
        let sector = if idx < NDIRECT {
            data.direct[idx]
        } else if idx < NDIRECT + NINDIRECT * INDEX_FANOUT {
            let off = idx - NDIRECT;
            let blk = data.indirect[off / INDEX_FANOUT];
            if blk == SECTOR_NONE {
                return None;
            }
            self.read_index(blk, INDIRECT_MAGIC).slots[off % INDEX_FANOUT]
        } else if idx < MAXFILE {
            let off = idx - NDIRECT - NINDIRECT * INDEX_FANOUT;
            if data.doubly == SECTOR_NONE {
                return None;
            }
            let sub = self.read_index(data.doubly, DOUBLY_MAGIC).slots[off / INDEX_FANOUT];
            if sub == SECTOR_NONE {
                return None;
            }
            self.read_index(sub, INDIRECT_MAGIC).slots[off % INDEX_FANOUT]
        } else {
            return None;
        };
        if sector == SECTOR_NONE {
            None
        } else {
            Some(sector)
        }
    }

    /// Resolves byte offset `pos` to its data sector, allocating the leaf
    /// and any missing index blocks. New leaves are zero-filled through the
    /// cache before the pointer that references them is persisted. Changed
    /// index blocks are written back here; the caller persists the header.
    fn block_alloc(&self, data: &mut DiskInode, pos: usize) -> Result<u32, ()> {
        let idx = pos / SECTOR_SIZE;
        if idx < NDIRECT {
            if data.direct[idx] == SECTOR_NONE {
                data.direct[idx] = self.alloc_zeroed_leaf()?;
            }
            return Ok(data.direct[idx]);
        }

        if idx < NDIRECT + NINDIRECT * INDEX_FANOUT {
            let off = idx - NDIRECT;
            let i = off / INDEX_FANOUT;
            if data.indirect[i] == SECTOR_NONE {
                data.indirect[i] = self.alloc_index(INDIRECT_MAGIC)?;
            }
            return self.index_alloc(data.indirect[i], INDIRECT_MAGIC, off % INDEX_FANOUT);
        }

        if idx < MAXFILE {
            let off = idx - NDIRECT - NINDIRECT * INDEX_FANOUT;
            if data.doubly == SECTOR_NONE {
                data.doubly = self.alloc_index(DOUBLY_MAGIC)?;
            }
            let mut doubly = self.read_index(data.doubly, DOUBLY_MAGIC);
            let i = off / INDEX_FANOUT;
            if doubly.slots[i] == SECTOR_NONE {
                doubly.slots[i] = self.alloc_index(INDIRECT_MAGIC)?;
                self.cache.write(data.doubly, 0, doubly.as_bytes());
            }
            return self.index_alloc(doubly.slots[i], INDIRECT_MAGIC, off % INDEX_FANOUT);
        }

        Err(())
    }

    /// Ensures `slot` of the index block at `sector` points at a leaf,
    /// allocating and zeroing one if needed.
    fn index_alloc(&self, sector: u32, magic: u32, slot: usize) -> Result<u32, ()> {
        let mut index = self.read_index(sector, magic);
        if index.slots[slot] == SECTOR_NONE {
            index.slots[slot] = self.alloc_zeroed_leaf()?;
            self.cache.write(sector, 0, index.as_bytes());
        }
        Ok(index.slots[slot])
    }

    fn alloc_zeroed_leaf(&self) -> Result<u32, ()> {
        let sector = self.freemap.lock().allocate(1).ok_or(())?;
        self.cache.zero(sector);
        Ok(sector)
    }

    fn alloc_index(&self, magic: u32) -> Result<u32, ()> {
        let sector = self.freemap.lock().allocate(1).ok_or(())?;
        self.cache.write(sector, 0, IndexBlock::new(magic, sector).as_bytes());
        Ok(sector)
    }

    fn read_index(&self, sector: u32, magic: u32) -> IndexBlock {
        let mut index = IndexBlock::new(magic, sector);
        self.cache.read(sector, 0, index.as_bytes_mut());
        assert_eq!(index.magic, magic, "index block magic");
        index
    }

    fn write_header(&self, data: &DiskInode) {
        self.cache.write(data.start, 0, data.as_bytes());
    }

    /// Releases every sector reachable from `data`'s block map, walking
    /// the direct pointers and both index tiers. The header sector itself
    /// is the caller's to release.
    pub(super) fn release_blocks(&self, data: &DiskInode) {
        for &sector in data.direct.iter().filter(|&&s| s != SECTOR_NONE) {
            self.freemap.lock().release(sector, 1);
        }
        for &blk in data.indirect.iter().filter(|&&s| s != SECTOR_NONE) {
            self.release_index(blk, INDIRECT_MAGIC);
        }
        if data.doubly != SECTOR_NONE {
            let doubly = self.read_index(data.doubly, DOUBLY_MAGIC);
            for &sub in doubly.slots.iter().filter(|&&s| s != SECTOR_NONE) {
                self.release_index(sub, INDIRECT_MAGIC);
            }
            self.freemap.lock().release(data.doubly, 1);
        }
    }

    fn release_index(&self, sector: u32, magic: u32) {
        let index = self.read_index(sector, magic);
        for &leaf in index.slots.iter().filter(|&&s| s != SECTOR_NONE) {
            self.freemap.lock().release(leaf, 1);
        }
        self.freemap.lock().release(sector, 1);
    }
}
