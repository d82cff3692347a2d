//! Open files.
//!
//! A [`File`] pairs an open inode handle with a byte position. Reads and
//! writes advance the position; `seek`/`tell` expose it. Directory handles
//! use the same object, and their position doubles as the `readdir` cursor.

use alloc::sync::Arc;

use spin::Mutex;

use crate::fs::{FileSys, Inode};

pub struct File {
    pub inode: Arc<Inode>,
    pos: Mutex<usize>,
}

impl File {
    /// Wraps an inode handle, taking ownership of it. Position starts at 0.
    pub fn new(inode: Arc<Inode>) -> Self {
        Self {
            inode,
            pos: Mutex::new(0),
        }
    }

    /// Reads from the current position, advancing it by the bytes read.
    pub fn read(&self, fs: &FileSys, buf: &mut [u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = fs.inode_read_at(&self.inode, buf, *pos);
        *pos += n;
        n
    }

    /// Writes at the current position, advancing it by the bytes written.
    pub fn write(&self, fs: &FileSys, buf: &[u8]) -> usize {
        let mut pos = self.pos.lock();
        let n = fs.inode_write_at(&self.inode, buf, *pos);
        *pos += n;
        n
    }

    pub fn seek(&self, pos: usize) {
        *self.pos.lock() = pos;
    }

    pub fn tell(&self) -> usize {
        *self.pos.lock()
    }

    pub fn length(&self, fs: &FileSys) -> usize {
        fs.inode_length(&self.inode)
    }

    pub fn is_dir(&self, fs: &FileSys) -> bool {
        fs.inode_is_dir(&self.inode)
    }

    /// Advances the position by `n` without touching data; the `readdir`
    /// path maintains its cursor through this.
    pub(crate) fn with_pos<R>(&self, f: impl FnOnce(&mut usize) -> R) -> R {
        f(&mut self.pos.lock())
    }
}
