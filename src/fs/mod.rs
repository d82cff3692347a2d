//! File system. Four layers:
//!   + Free-map: allocator for raw disk sectors.
//!   + Inodes: block maps, reading, writing, growth, open-inode table.
//!   + Directories: inodes with special contents (lists of other inodes!).
//!   + Names: paths like /usr/bin/ls resolved against a working directory.
//!
//! Everything below the free-map goes through the buffer cache; the cache
//! is flushed at shutdown, which is the only durability promise made.
//!
//! Path-level operations (create/open/remove/mkdir/chdir) serialize on a
//! single file-system lock. Data-plane reads and writes on open inodes rely
//! on the per-inode and per-cache-slot locks instead.

use alloc::sync::Arc;
use alloc::vec;

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::bio::Bcache;
use crate::hal::Disk;
use crate::param::{NAME_MAX, ROOT_DIR_SECTOR};

pub mod directory;
pub mod freemap;
pub mod inode;
pub mod path;

pub use directory::{Dir, Dirent, DIRENT_SIZE};
pub use inode::Inode;

use freemap::FreeMap;
use inode::Itable;

use crate::param::FREE_MAP_SECTOR;

/// Leaf-name sentinel produced when a path canonicalizes to a directory
/// itself ("/", "a/b/" with empty remainder) rather than to a named child.
pub const ROOT_LEAF: &[u8] = b"root";

/// A resolved leaf name.
pub type LeafName = ArrayVec<u8, NAME_MAX>;

pub struct FileSys {
    pub(crate) cache: Bcache,
    freemap: Mutex<FreeMap>,
    itable: Itable,
    /// Serializes path-level operations.
    oplock: Mutex<()>,
}

impl FileSys {
    /// Mounts the file system on `disk`. With `format` set, the disk is
    /// reinitialized: fresh free-map, empty root directory with `.`/`..`.
    pub fn mount(disk: Arc<dyn Disk>, format: bool) -> Result<Self, ()> {
        let nsectors = disk.sector_count();
        let fs = Self {
            cache: Bcache::new(disk),
            freemap: Mutex::new(FreeMap::new(nsectors)),
            itable: Itable::new(),
            oplock: Mutex::new(()),
        };
        if format {
            fs.format()?;
        } else {
            fs.load_free_map();
        }
        Ok(fs)
    }

    /// Writes any unwritten state to disk: the free-map contents, then every
    /// dirty cache slot.
    pub fn shutdown(&self) {
        self.sync_free_map();
        self.cache.flush();
    }

    /// Forces dirty cached sectors to disk without unmounting.
    pub fn flush(&self) {
        self.cache.flush();
    }

    /// Unallocated sectors remaining on the volume.
    pub fn free_sector_count(&self) -> usize {
        self.freemap.lock().free_count()
    }

    fn format(&self) -> Result<(), ()> {
        let bitmap_len = {
            let mut fm = self.freemap.lock();
            fm.format();
            fm.byte_len()
        };
        if !self.inode_create(FREE_MAP_SECTOR, bitmap_len, false) {
            return Err(());
        }
        if !self.dir_create(ROOT_DIR_SECTOR, 16) {
            return Err(());
        }
        let root = self.dir_open_root();
        let ok = self.dir_add(&root, b".", ROOT_DIR_SECTOR)
            && self.dir_add(&root, b"..", ROOT_DIR_SECTOR);
        self.dir_close(root);
        if !ok {
            return Err(());
        }
        self.sync_free_map();
        self.cache.flush();
        Ok(())
    }

    fn load_free_map(&self) {
        let ino = self.inode_open(FREE_MAP_SECTOR);
        let len = self.inode_length(&ino);
        let mut bytes = vec![0u8; len];
        let read = self.inode_read_at(&ino, &mut bytes, 0);
        assert_eq!(read, len, "free-map short read");
        self.freemap.lock().load_bytes(&bytes);
        self.inode_close(ino);
    }

    fn sync_free_map(&self) {
        let bytes = {
            let fm = self.freemap.lock();
            fm.as_bytes().to_vec()
        };
        let ino = self.inode_open(FREE_MAP_SECTOR);
        let written = self.inode_write_at(&ino, &bytes, 0);
        assert_eq!(written, bytes.len(), "free-map short write");
        self.inode_close(ino);
    }

    /// Creates a plain file of `initial_size` bytes at `path`.
    pub fn create(&self, cwd: u32, path: &[u8], initial_size: usize) -> bool {
        let _op = self.oplock.lock();
        let (parent, leaf) = match self.resolve_parent(cwd, path) {
            Ok(r) => r,
            Err(()) => return false,
        };
        let parent = scopeguard::guard(parent, |d| self.dir_close(d));
        if &leaf[..] == ROOT_LEAF {
            return false;
        }
        if let Some(existing) = self.dir_lookup(&parent, &leaf) {
            self.inode_close(existing);
            return false;
        }
        let sector = match self.freemap.lock().allocate(1) {
            Some(s) => s,
            None => return false,
        };
        if !self.inode_create(sector, initial_size, false) {
            self.freemap.lock().release(sector, 1);
            return false;
        }
        if !self.dir_add(&parent, &leaf, sector) {
            let ino = self.inode_open(sector);
            self.inode_remove(&ino);
            self.inode_close(ino);
            return false;
        }
        true
    }

    /// Opens the inode named by `path`, file or directory. A path that
    /// canonicalizes to a directory itself opens that directory's inode.
    pub fn open(&self, cwd: u32, path: &[u8]) -> Option<Arc<Inode>> {
        let _op = self.oplock.lock();
        let (parent, leaf) = self.resolve_parent(cwd, path).ok()?;
        let parent = scopeguard::guard(parent, |d| self.dir_close(d));
        if &leaf[..] == ROOT_LEAF {
            Some(self.inode_reopen(&parent.inode))
        } else {
            self.dir_lookup(&parent, &leaf)
        }
    }

    /// Deletes the file or empty directory named by `path`. `cwd` is the
    /// calling process's working directory, which may not be removed.
    pub fn remove(&self, cwd: u32, path: &[u8]) -> bool {
        let _op = self.oplock.lock();
        let (parent, leaf) = match self.resolve_parent(cwd, path) {
            Ok(r) => r,
            Err(()) => return false,
        };
        let parent = scopeguard::guard(parent, |d| self.dir_close(d));
        if &leaf[..] == ROOT_LEAF {
            return false;
        }
        self.dir_remove(&parent, &leaf, cwd)
    }

    /// Creates a directory at `path`, wiring its `.` and `..` entries.
    pub fn mkdir(&self, cwd: u32, path: &[u8]) -> bool {
        let _op = self.oplock.lock();
        let (parent, leaf) = match self.resolve_parent(cwd, path) {
            Ok(r) => r,
            Err(()) => return false,
        };
        let parent = scopeguard::guard(parent, |d| self.dir_close(d));
        if &leaf[..] == ROOT_LEAF {
            return false;
        }
        if let Some(existing) = self.dir_lookup(&parent, &leaf) {
            self.inode_close(existing);
            return false;
        }
        let sector = match self.freemap.lock().allocate(1) {
            Some(s) => s,
            None => return false,
        };
        if !self.dir_create(sector, 0) {
            self.freemap.lock().release(sector, 1);
            return false;
        }
        let new_dir = self.dir_open(self.inode_open(sector));
        let ok = self.dir_add(&new_dir, b".", sector)
            && self.dir_add(&new_dir, b"..", parent.inode.sector)
            && self.dir_add(&parent, &leaf, sector);
        if !ok {
            self.inode_remove(&new_dir.inode);
        }
        self.dir_close(new_dir);
        ok
    }

    /// Resolves `path` to a directory and returns its sector, the caller's
    /// new working directory.
    pub fn chdir(&self, cwd: u32, path: &[u8]) -> Option<u32> {
        let _op = self.oplock.lock();
        let dir = self.resolve_dir(cwd, path).ok()?;
        let sector = dir.inode.sector;
        self.dir_close(dir);
        Some(sector)
    }

    /// Resolves all but the last component of `path`, returning the parent
    /// directory and the leaf name. A path canonicalizing to a directory
    /// itself yields that directory and the [`ROOT_LEAF`] sentinel.
    fn resolve_parent(&self, cwd: u32, path: &[u8]) -> Result<(Dir, LeafName), ()> {
        let path = path::strip_trailing_slash(path);
        if path::is_bare(path) {
            let mut leaf = LeafName::new();
            leaf.try_extend_from_slice(ROOT_LEAF)
                .expect("resolve_parent: sentinel longer than NAME_MAX");
            return Ok((self.dir_open_root(), leaf));
        }

        let start = if path[0] == b'/' { ROOT_DIR_SECTOR } else { cwd };
        let mut dir = self.dir_open(self.inode_open(start));
        let mut rest = path;
        loop {
            // is_bare ruled out the component-free case above.
            let (name, more) = match path::skip_elem(rest) {
                Some(split) => split,
                None => {
                    self.dir_close(dir);
                    return Err(());
                }
            };
            if more.is_empty() {
                if name.len() > NAME_MAX {
                    self.dir_close(dir);
                    return Err(());
                }
                let mut leaf = LeafName::new();
                leaf.try_extend_from_slice(name)
                    .expect("resolve_parent: leaf longer than NAME_MAX");
                return Ok((dir, leaf));
            }
            match self.descend(dir, name) {
                Ok(next) => dir = next,
                Err(()) => return Err(()),
            }
            rest = more;
        }
    }

    /// Resolves every component of `path`; each one, the last included,
    /// must name a directory.
    fn resolve_dir(&self, cwd: u32, path: &[u8]) -> Result<Dir, ()> {
        let path = path::strip_trailing_slash(path);
        if path::is_bare(path) {
            return Ok(self.dir_open_root());
        }

        let start = if path[0] == b'/' { ROOT_DIR_SECTOR } else { cwd };
        let mut dir = self.dir_open(self.inode_open(start));
        let mut rest = path;
        while let Some((name, more)) = path::skip_elem(rest) {
            dir = self.descend(dir, name)?;
            rest = more;
        }
        Ok(dir)
    }

    /// Steps from `dir` into its child `name`, which must be a directory.
    /// Closes `dir` in every case.
    fn descend(&self, dir: Dir, name: &[u8]) -> Result<Dir, ()> {
        let next = match self.dir_lookup(&dir, name) {
            Some(ino) => ino,
            None => {
                self.dir_close(dir);
                return Err(());
            }
        };
        self.dir_close(dir);
        if !self.inode_is_dir(&next) {
            self.inode_close(next);
            return Err(());
        }
        Ok(self.dir_open(next))
    }
}

#[cfg(test)]
impl FileSys {
    pub(crate) fn alloc_sector_for_test(&self) -> u32 {
        self.freemap.lock().allocate(1).unwrap()
    }
}
