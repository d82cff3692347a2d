//! The kernel: one value owning every subsystem singleton.
//!
//! Construction runs the init order the subsystems assume: free-map and
//! buffer cache come up with the file system mount, then the frame pool,
//! swap device, and supplemental page table. Shutdown flushes the free-map
//! and the cache.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::Mutex;

use crate::file::File;
use crate::fs::FileSys;
use crate::hal::Disk;
use crate::param::FIRST_FD;
use crate::proc::Proc;
use crate::vm::Vm;

/// Hooks to the process bootstrap living outside this crate. `exec` and
/// `wait` syscalls route here; without a host they fail.
pub trait ProcessHost: Send + Sync {
    fn exec(&self, cmdline: &[u8]) -> isize;
    fn wait(&self, pid: isize) -> isize;
}

pub struct Kernel {
    pub fs: FileSys,
    pub vm: Vm,
    next_tid: AtomicU32,
    /// File descriptors are handed out from one monotonic counter;
    /// 0/1/2 stay reserved for the console.
    next_fd: Mutex<i32>,
    next_mapid: Mutex<i32>,
    console_out: Mutex<Vec<u8>>,
    console_in: Mutex<VecDeque<u8>>,
    halted: AtomicBool,
    host: spin::Once<Arc<dyn ProcessHost>>,
}

impl Kernel {
    /// Mounts the file system on `fs_disk`, formatting it first when
    /// `format` is set. `swap_disk` backs the swap slots and `user_frames`
    /// sizes the frame pool.
    pub fn new(
        fs_disk: Arc<dyn Disk>,
        swap_disk: Arc<dyn Disk>,
        format: bool,
        user_frames: usize,
    ) -> Result<Arc<Self>, ()> {
        let fs = FileSys::mount(fs_disk, format)?;
        let vm = Vm::new(swap_disk, user_frames);
        Ok(Arc::new(Self {
            fs,
            vm,
            next_tid: AtomicU32::new(1),
            next_fd: Mutex::new(FIRST_FD),
            next_mapid: Mutex::new(1),
            console_out: Mutex::new(Vec::new()),
            console_in: Mutex::new(VecDeque::new()),
            halted: AtomicBool::new(false),
            host: spin::Once::new(),
        }))
    }

    /// Creates a process with a fresh address space, rooted at `/`.
    pub fn spawn(&self) -> Arc<Proc> {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        Arc::new(Proc::new(tid))
    }

    pub fn alloc_fd(&self) -> i32 {
        let mut next = self.next_fd.lock();
        let fd = *next;
        *next += 1;
        fd
    }

    pub fn alloc_mapid(&self) -> i32 {
        let mut next = self.next_mapid.lock();
        let id = *next;
        *next += 1;
        id
    }

    /// Releases everything the process holds. Descriptors are closed and
    /// mappings are unmapped, flushing their dirty pages; the remaining
    /// supplemental page entries free their frames and swap slots.
    /// Records `status` for a waiting parent.
    pub fn proc_exit(&self, proc: &Proc, status: i32) {
        loop {
            let fd = match proc.fds.lock().first() {
                Some(e) => e.fd,
                None => break,
            };
            if let Some(file) = proc.fd_take(fd) {
                self.close_file(file);
            }
        }

        self.vm.munmap_all(&self.fs, proc);

        loop {
            let upage = match proc.upages.lock().pop() {
                Some(u) => u,
                None => break,
            };
            if let Some(spte) = self.vm.spte_lookup(proc.tid, upage) {
                self.vm.spte_free(&spte);
            }
            proc.pagedir.clear_page(upage);
        }

        proc.record_exit(status);
    }

    /// Drops an open-file object, closing its inode handle.
    pub fn close_file(&self, file: Arc<File>) {
        self.fs.inode_close(file.inode.clone());
    }

    /// Flushes all file-system state and stops the machine.
    pub fn halt(&self) {
        self.fs.shutdown();
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    /// Console sink for fds 1 and 2.
    pub(crate) fn console_write(&self, bytes: &[u8]) {
        self.console_out.lock().extend_from_slice(bytes);
    }

    /// Console source for fd 0.
    pub(crate) fn console_read(&self, buf: &mut [u8]) -> usize {
        let mut input = self.console_in.lock();
        let mut n = 0;
        while n < buf.len() {
            match input.pop_front() {
                Some(b) => {
                    buf[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Queues bytes for fd 0 reads.
    pub fn feed_input(&self, bytes: &[u8]) {
        self.console_in.lock().extend(bytes.iter().copied());
    }

    /// Drains and returns everything written to the console so far.
    pub fn take_console_output(&self) -> Vec<u8> {
        core::mem::take(&mut *self.console_out.lock())
    }

    /// Wires in the external process bootstrap. Effective once.
    pub fn set_host(&self, host: Arc<dyn ProcessHost>) {
        let _ = self.host.call_once(|| host);
    }

    pub(crate) fn host(&self) -> Option<&Arc<dyn ProcessHost>> {
        self.host.get()
    }
}
