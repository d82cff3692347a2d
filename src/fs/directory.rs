//! Directories.
//!
//! A directory is an inode whose data is a packed run of fixed-size entries
//! mapping names to inode sectors. Entries with `in_use` cleared are holes
//! that later additions reuse. Every directory carries `.` and `..`; the
//! root's `..` points at itself.

use alloc::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use super::inode::Inode;
use super::FileSys;
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

/// A single directory entry.
#[repr(C)]
#[derive(AsBytes, FromBytes)]
pub struct Dirent {
    /// Sector of the entry's inode header.
    pub sector: u32,
    /// NUL-terminated name.
    name: [u8; NAME_MAX + 1],
    /// In use or free?
    in_use: u8,
}

pub const DIRENT_SIZE: usize = core::mem::size_of::<Dirent>();

impl Dirent {
    fn empty() -> Self {
        Self {
            sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
        }
    }

    fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(NAME_MAX);
        &self.name[..len]
    }

    fn set_name(&mut self, name: &[u8]) {
        debug_assert!(name.len() <= NAME_MAX);
        self.name = [0; NAME_MAX + 1];
        self.name[..name.len()].copy_from_slice(name);
    }

    fn is_dot(&self) -> bool {
        self.name_bytes() == b"." || self.name_bytes() == b".."
    }
}

/// An open directory: an inode handle known to hold directory data.
pub struct Dir {
    pub inode: Arc<Inode>,
}

impl FileSys {
    /// Creates a directory inode at `sector` with room for `entry_cnt`
    /// entries; more are allocated as the directory grows.
    pub fn dir_create(&self, sector: u32, entry_cnt: usize) -> bool {
        self.inode_create(sector, entry_cnt * DIRENT_SIZE, true)
    }

    /// Wraps an inode handle, taking ownership of it.
    pub fn dir_open(&self, inode: Arc<Inode>) -> Dir {
        Dir { inode }
    }

    pub fn dir_open_root(&self) -> Dir {
        self.dir_open(self.inode_open(ROOT_DIR_SECTOR))
    }

    pub fn dir_reopen(&self, dir: &Dir) -> Dir {
        Dir {
            inode: self.inode_reopen(&dir.inode),
        }
    }

    pub fn dir_close(&self, dir: Dir) {
        self.inode_close(dir.inode);
    }

    /// Looks `name` up in `dir`, returning a fresh handle on its inode.
    pub fn dir_lookup(&self, dir: &Dir, name: &[u8]) -> Option<Arc<Inode>> {
        self.find_entry(&dir.inode, name)
            .map(|(e, _)| self.inode_open(e.sector))
    }

    /// Adds `name` → `sector` to `dir`. Fails on an invalid or duplicate
    /// name or when the directory cannot grow.
    pub fn dir_add(&self, dir: &Dir, name: &[u8], sector: u32) -> bool {
        if !super::path::valid_name(name) {
            return false;
        }
        if self.find_entry(&dir.inode, name).is_some() {
            return false;
        }

        // First free slot, or end of file when there are no holes.
        let mut ofs = 0;
        let mut e = Dirent::empty();
        while self.inode_read_at(&dir.inode, e.as_bytes_mut(), ofs) == DIRENT_SIZE {
            if e.in_use == 0 {
                break;
            }
            ofs += DIRENT_SIZE;
        }

        e.in_use = 1;
        e.set_name(name);
        e.sector = sector;
        self.inode_write_at(&dir.inode, e.as_bytes(), ofs) == DIRENT_SIZE
    }

    /// Removes `name` from `dir` and marks its inode for deletion.
    ///
    /// Removal is refused when the target is a non-empty directory. It is
    /// also refused when the target directory is some process's working
    /// directory (`cwd`) or is held open elsewhere. Plain files may be
    /// removed while open; their blocks go when the last handle closes.
    pub fn dir_remove(&self, dir: &Dir, name: &[u8], cwd: u32) -> bool {
        let (e, ofs) = match self.find_entry(&dir.inode, name) {
            Some(found) => found,
            None => return false,
        };
        let ino = self.inode_open(e.sector);
        let ok = (|| {
            if self.inode_is_dir(&ino) {
                if !self.dir_is_empty(&ino) {
                    return false;
                }
                if ino.sector == cwd {
                    return false;
                }
                // Our own handle is one of them.
                if self.inode_open_count(&ino) > 1 {
                    return false;
                }
            }
            let mut cleared = Dirent::empty();
            cleared.sector = e.sector;
            cleared.set_name(name);
            if self.inode_write_at(&dir.inode, cleared.as_bytes(), ofs) != DIRENT_SIZE {
                return false;
            }
            self.inode_remove(&ino);
            true
        })();
        self.inode_close(ino);
        ok
    }

    /// Streams the next entry name after byte position `pos`, skipping `.`
    /// and `..`. Returns false at end of directory.
    pub fn dir_readdir(&self, ino: &Inode, pos: &mut usize, out: &mut [u8; NAME_MAX + 1]) -> bool {
        let mut e = Dirent::empty();
        while self.inode_read_at(ino, e.as_bytes_mut(), *pos) == DIRENT_SIZE {
            *pos += DIRENT_SIZE;
            if e.in_use != 0 && !e.is_dot() {
                *out = [0; NAME_MAX + 1];
                out[..e.name_bytes().len()].copy_from_slice(e.name_bytes());
                return true;
            }
        }
        false
    }

    /// True if `ino` holds no in-use entries besides `.` and `..`.
    pub(super) fn dir_is_empty(&self, ino: &Inode) -> bool {
        let mut ofs = 0;
        let mut e = Dirent::empty();
        while self.inode_read_at(ino, e.as_bytes_mut(), ofs) == DIRENT_SIZE {
            ofs += DIRENT_SIZE;
            if e.in_use != 0 && !e.is_dot() {
                return false;
            }
        }
        true
    }

    fn find_entry(&self, ino: &Inode, name: &[u8]) -> Option<(Dirent, usize)> {
        let mut ofs = 0;
        let mut e = Dirent::empty();
        while self.inode_read_at(ino, e.as_bytes_mut(), ofs) == DIRENT_SIZE {
            if e.in_use != 0 && e.name_bytes() == name {
                return Some((e, ofs));
            }
            ofs += DIRENT_SIZE;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::tests::fresh_fs;
    use crate::param::ROOT_DIR_SECTOR;

    #[test]
    fn add_lookup_remove() {
        let fs = fresh_fs(4096);
        let root = fs.dir_open_root();
        let sector = fs.alloc_sector_for_test();
        assert!(fs.inode_create(sector, 0, false));

        assert!(fs.dir_add(&root, b"hello", sector));
        assert!(!fs.dir_add(&root, b"hello", sector), "duplicate name");

        let ino = fs.dir_lookup(&root, b"hello").unwrap();
        assert_eq!(ino.sector, sector);
        fs.inode_close(ino);

        assert!(fs.dir_remove(&root, b"hello", ROOT_DIR_SECTOR));
        assert!(fs.dir_lookup(&root, b"hello").is_none());
        fs.dir_close(root);
    }

    #[test]
    fn rejects_bad_names() {
        let fs = fresh_fs(4096);
        let root = fs.dir_open_root();
        assert!(!fs.dir_add(&root, b"", 2));
        assert!(!fs.dir_add(&root, b"name-that-is-too-long", 2));
        fs.dir_close(root);
    }

    #[test]
    fn removed_entry_slot_is_reused() {
        let fs = fresh_fs(4096);
        let root = fs.dir_open_root();
        let s1 = fs.alloc_sector_for_test();
        let s2 = fs.alloc_sector_for_test();
        assert!(fs.inode_create(s1, 0, false));
        assert!(fs.inode_create(s2, 0, false));

        assert!(fs.dir_add(&root, b"a", s1));
        let len_after_a = fs.inode_length(&root.inode);
        assert!(fs.dir_remove(&root, b"a", ROOT_DIR_SECTOR));
        assert!(fs.dir_add(&root, b"b", s2));
        assert_eq!(fs.inode_length(&root.inode), len_after_a);
        fs.dir_close(root);
    }

    #[test]
    fn readdir_skips_dots() {
        let fs = fresh_fs(4096);
        let root = fs.dir_open_root();
        let s = fs.alloc_sector_for_test();
        assert!(fs.inode_create(s, 0, false));
        assert!(fs.dir_add(&root, b"only", s));

        let mut pos = 0;
        let mut name = [0u8; NAME_MAX + 1];
        assert!(fs.dir_readdir(&root.inode, &mut pos, &mut name));
        assert_eq!(&name[..4], b"only");
        assert!(!fs.dir_readdir(&root.inode, &mut pos, &mut name));
        fs.dir_close(root);
    }
}
