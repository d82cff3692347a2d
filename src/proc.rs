//! Per-process state.
//!
//! The scheduler and context-switch machinery live outside this crate. A
//! [`Proc`] here is the storage and memory side of a process: it holds the
//! page directory, the list of pages with supplemental entries, the open
//! file table and working directory, and the memory mappings. Operations
//! take the calling process explicitly rather than reading an ambient
//! current-thread.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use arrayvec::ArrayVec;
use spin::Mutex;

use crate::file::File;
use crate::param::{NOFILE, PHYS_BASE, ROOT_DIR_SECTOR};
use crate::vm::{MmapEntry, PageDir};

pub struct FdEntry {
    pub fd: i32,
    pub file: Arc<File>,
}

pub struct Proc {
    pub tid: u32,
    pub pagedir: PageDir,
    /// Working directory, as the sector of its inode.
    pub cwd: Mutex<u32>,
    pub(crate) fds: Mutex<ArrayVec<FdEntry, NOFILE>>,
    pub(crate) mmaps: Mutex<Vec<MmapEntry>>,
    /// Pages with supplemental entries, for exit teardown.
    pub(crate) upages: Mutex<Vec<usize>>,
    /// Stack pointer captured at kernel entry; the stack-growth heuristic
    /// compares fault addresses against it.
    user_sp: AtomicUsize,
    exit_status: Mutex<Option<i32>>,
}

impl Proc {
    pub fn new(tid: u32) -> Self {
        Self {
            tid,
            pagedir: PageDir::new(),
            cwd: Mutex::new(ROOT_DIR_SECTOR),
            fds: Mutex::new(ArrayVec::new()),
            mmaps: Mutex::new(Vec::new()),
            upages: Mutex::new(Vec::new()),
            user_sp: AtomicUsize::new(PHYS_BASE),
            exit_status: Mutex::new(None),
        }
    }

    pub fn user_sp(&self) -> usize {
        self.user_sp.load(Ordering::SeqCst)
    }

    pub fn set_user_sp(&self, sp: usize) {
        self.user_sp.store(sp, Ordering::SeqCst);
    }

    pub fn cwd(&self) -> u32 {
        *self.cwd.lock()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status.lock().is_some()
    }

    pub fn exit_status(&self) -> Option<i32> {
        *self.exit_status.lock()
    }

    pub(crate) fn record_exit(&self, status: i32) {
        let mut st = self.exit_status.lock();
        if st.is_none() {
            *st = Some(status);
        }
    }

    /// The open file behind `fd`, if the process holds it.
    pub fn fd_file(&self, fd: i32) -> Option<Arc<File>> {
        self.fds
            .lock()
            .iter()
            .find(|e| e.fd == fd)
            .map(|e| e.file.clone())
    }

    pub(crate) fn fd_install(&self, fd: i32, file: Arc<File>) -> Result<(), Arc<File>> {
        let mut fds = self.fds.lock();
        if fds.is_full() {
            return Err(file);
        }
        fds.push(FdEntry { fd, file });
        Ok(())
    }

    pub(crate) fn fd_take(&self, fd: i32) -> Option<Arc<File>> {
        let mut fds = self.fds.lock();
        let idx = fds.iter().position(|e| e.fd == fd)?;
        Some(fds.swap_remove(idx).file)
    }
}
