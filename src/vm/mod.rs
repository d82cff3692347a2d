//! Virtual memory. Five pieces:
//!   + Frames: the bounded pool of physical pages backing user memory.
//!   + Swap: page-sized slots on the swap disk.
//!   + Supplemental page table: what each user page is and where its
//!     contents currently live.
//!   + Memory-mapped files.
//!   + User-memory access: the copy and probe routines between kernel and
//!     user space.
//!
//! See [`spt`] for the state machine a user page moves through. The copy
//! routines live in this file. Every byte copied to or from user space
//! resolves through the supplemental page table, faulting pages in on
//! demand and pinning their frames for the duration of the copy so the
//! eviction scan cannot pull them out from underneath a kernel operation.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use cstr_core::CStr;
use spin::Mutex;

use crate::fs::FileSys;
use crate::hal::Disk;
use crate::param::{PGSIZE, PHYS_BASE};
use crate::proc::Proc;

pub mod frame;
pub mod mmap;
pub mod pagedir;
pub mod spt;
pub mod swap;

pub use frame::{AllocFlags, Frame, FrameTable, UserPool};
pub use mmap::MmapEntry;
pub use pagedir::{PageDir, Pte, PteFlags};
pub use spt::{FileBacking, PageState, Spte};
pub use swap::Swap;

/// Why a user-memory access failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserError {
    /// The address range is not (and cannot become) mapped, or the access
    /// violates its permissions. Fatal to the process.
    Fault,
    /// A string ran past the caller's buffer without a terminator.
    TooLong,
}

pub struct Vm {
    pool: UserPool,
    frames: FrameTable,
    swap: Swap,
    /// Supplemental page table, keyed by `(owner tid, upage)`.
    spt: Mutex<BTreeMap<(u32, usize), Arc<Spte>>>,
}

impl Vm {
    /// `user_frames` bounds the frame pool; a small pool under a large
    /// working set is how eviction gets exercised.
    pub fn new(swap_disk: Arc<dyn Disk>, user_frames: usize) -> Self {
        Self {
            pool: UserPool::new(user_frames),
            frames: FrameTable::new(),
            swap: Swap::new(swap_disk),
            spt: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn frame_pool_capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn resident_frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn free_swap_slots(&self) -> usize {
        self.swap.free_slots()
    }

    /// Copies `src` into user space at `uva`, faulting pages in and
    /// honoring page writability.
    pub fn copy_to_user(
        &self,
        fs: &FileSys,
        proc: &Proc,
        mut uva: usize,
        src: &[u8],
    ) -> Result<(), UserError> {
        let mut off = 0;
        while off < src.len() {
            if uva >= PHYS_BASE {
                return Err(UserError::Fault);
            }
            let page_ofs = uva % PGSIZE;
            let chunk = (src.len() - off).min(PGSIZE - page_ofs);

            let spte = self
                .resolve_user_page(fs, proc, uva)
                .map_err(|()| UserError::Fault)?;
            if !spte.writable {
                return Err(UserError::Fault);
            }
            let frame = self
                .pin_resident(fs, &spte)
                .map_err(|()| UserError::Fault)?;
            spte.pte().set_accessed();
            spte.pte().set_dirty();
            {
                let mut data = frame.data.lock();
                data[page_ofs..page_ofs + chunk].copy_from_slice(&src[off..off + chunk]);
            }
            frame
                .pinned
                .store(false, core::sync::atomic::Ordering::SeqCst);

            off += chunk;
            uva += chunk;
        }
        Ok(())
    }

    /// Copies user bytes at `uva` into `dst`, faulting pages in.
    pub fn copy_from_user(
        &self,
        fs: &FileSys,
        proc: &Proc,
        mut uva: usize,
        dst: &mut [u8],
    ) -> Result<(), UserError> {
        let mut off = 0;
        while off < dst.len() {
            if uva >= PHYS_BASE {
                return Err(UserError::Fault);
            }
            let page_ofs = uva % PGSIZE;
            let chunk = (dst.len() - off).min(PGSIZE - page_ofs);

            let spte = self
                .resolve_user_page(fs, proc, uva)
                .map_err(|()| UserError::Fault)?;
            let frame = self
                .pin_resident(fs, &spte)
                .map_err(|()| UserError::Fault)?;
            spte.pte().set_accessed();
            {
                let data = frame.data.lock();
                dst[off..off + chunk].copy_from_slice(&data[page_ofs..page_ofs + chunk]);
            }
            frame
                .pinned
                .store(false, core::sync::atomic::Ordering::SeqCst);

            off += chunk;
            uva += chunk;
        }
        Ok(())
    }

    /// Single-byte read probe. The fault-swallowing analogue of letting the
    /// access trap: failure reports back instead of killing anything.
    pub fn read_user_byte(&self, fs: &FileSys, proc: &Proc, uva: usize) -> Result<u8, UserError> {
        let mut byte = [0u8; 1];
        self.copy_from_user(fs, proc, uva, &mut byte)?;
        Ok(byte[0])
    }

    /// Single-byte write probe.
    pub fn write_user_byte(
        &self,
        fs: &FileSys,
        proc: &Proc,
        uva: usize,
        byte: u8,
    ) -> Result<(), UserError> {
        self.copy_to_user(fs, proc, uva, &[byte])
    }

    /// Copies the NUL-terminated string at `uva` into `buf` and returns it
    /// as a `CStr`. `TooLong` when no terminator fits in `buf`.
    pub fn copy_in_str<'a>(
        &self,
        fs: &FileSys,
        proc: &Proc,
        uva: usize,
        buf: &'a mut [u8],
    ) -> Result<&'a CStr, UserError> {
        for i in 0..buf.len() {
            let byte = self.read_user_byte(fs, proc, uva + i)?;
            buf[i] = byte;
            if byte == 0 {
                return CStr::from_bytes_with_nul(&buf[..=i]).map_err(|_| UserError::Fault);
            }
        }
        Err(UserError::TooLong)
    }
}
