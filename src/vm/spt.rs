//! Supplemental page table.
//!
//! The hardware page table only records whether a page is present. The
//! supplemental page table records where a non-present page's contents
//! live, and also owns the machinery that moves pages in and out of
//! residency.
//!
//! One [`Spte`] exists per allocated user page, keyed by `(owner tid,
//! upage)`. Its [`PageState`] is the single source of truth for where the
//! page's contents live:
//!
//! * `Resident(frame)`: in the frame, mapped by the owner's PTE.
//! * `Swapped(slot)`: in a swap slot. The PTE is clear.
//! * `LazyFile`: in the backing file at `backing.ofs`.
//! * `LazyZero`: nowhere yet. The page reads as zeros on first touch.
//!
//! An `mmap` page differs from other file-backed pages only at eviction:
//! its dirty contents go back through the file system rather than to
//! swap, so the file has caught up with memory by unmap time.

use alloc::sync::Arc;

use spin::Mutex;

use super::frame::{AllocFlags, Frame};
use super::pagedir::Pte;
use super::Vm;
use crate::fs::{FileSys, Inode};
use crate::param::{PGSIZE, PHYS_BASE, STACK_MAX, STACK_SLOP};
use crate::proc::Proc;

/// Where a file-backed page's bytes come from (and, for mmap pages, go
/// back to).
pub struct FileBacking {
    pub inode: Arc<Inode>,
    /// Byte offset of this page in the file.
    pub ofs: usize,
    /// Bytes of the page that mirror the file; the tail reads as zeros.
    pub read_bytes: usize,
}

pub enum PageState {
    Resident(Arc<Frame>),
    Swapped(u32),
    LazyFile,
    LazyZero,
}

/// Supplemental page-table entry for one user page.
pub struct Spte {
    pub tid: u32,
    pub upage: usize,
    pub writable: bool,
    /// Dirty evictions write back through the file instead of to swap.
    pub mmap: bool,
    pub backing: Option<FileBacking>,
    pub(super) pte: Arc<Pte>,
    pub(super) state: Mutex<PageState>,
}

impl Spte {
    pub fn pte(&self) -> &Pte {
        &self.pte
    }

    pub fn is_resident(&self) -> bool {
        matches!(*self.state.lock(), PageState::Resident(_))
    }

    pub fn is_swapped(&self) -> bool {
        matches!(*self.state.lock(), PageState::Swapped(_))
    }

    /// Pool index of the backing frame while resident.
    pub fn resident_frame(&self) -> Option<u32> {
        match &*self.state.lock() {
            PageState::Resident(frame) => Some(frame.index()),
            _ => None,
        }
    }

    /// Leased swap slot while swapped out.
    pub fn swap_slot(&self) -> Option<u32> {
        match *self.state.lock() {
            PageState::Swapped(slot) => Some(slot),
            _ => None,
        }
    }
}

impl Vm {
    /// Installs a supplemental page-table entry for `upage`.
    ///
    /// Lazy entries materialize on first fault: file-backed when `backing`
    /// is given, zero-filled otherwise. An eager entry gets its frame here.
    /// Fails if the page already has an entry.
    pub fn spte_allocate(
        &self,
        fs: &FileSys,
        proc: &Proc,
        upage: usize,
        writable: bool,
        lazy: bool,
        backing: Option<FileBacking>,
        mmap: bool,
    ) -> Result<Arc<Spte>, ()> {
        debug_assert_eq!(upage % PGSIZE, 0);
        if upage + PGSIZE > PHYS_BASE {
            return Err(());
        }
        let pte = proc.pagedir.lookup_page(upage, true).ok_or(())?;
        debug_assert!(!pte.is_present());

        let state = if backing.is_some() {
            PageState::LazyFile
        } else {
            PageState::LazyZero
        };
        let spte = Arc::new(Spte {
            tid: proc.tid,
            upage,
            writable,
            mmap,
            backing,
            pte,
            state: Mutex::new(state),
        });

        {
            let mut map = self.spt.lock();
            if map.contains_key(&(proc.tid, upage)) {
                return Err(());
            }
            let _ = map.insert((proc.tid, upage), spte.clone());
        }
        proc.upages.lock().push(upage);

        if !lazy {
            self.swap_in(fs, &spte)?;
        }
        Ok(spte)
    }

    /// The entry for `(tid, upage)`, if any.
    pub fn spte_lookup(&self, tid: u32, upage: usize) -> Option<Arc<Spte>> {
        self.spt.lock().get(&(tid, upage)).cloned()
    }

    /// Tears an entry down. A resident entry gives its frame back to the
    /// pool; a swapped entry releases its swap slot.
    pub fn spte_free(&self, spte: &Arc<Spte>) {
        {
            let mut st = spte.state.lock();
            match core::mem::replace(&mut *st, PageState::LazyZero) {
                PageState::Resident(frame) => {
                    spte.pte.clear();
                    self.frames.remove(&frame);
                    self.pool.put(&frame);
                }
                PageState::Swapped(slot) => self.swap.release_slot(slot),
                PageState::LazyFile | PageState::LazyZero => {}
            }
        }
        let _ = self.spt.lock().remove(&(spte.tid, spte.upage));
    }

    /// Makes `spte` resident. A fresh frame is filled from wherever the
    /// state says the contents live, then the PTE is installed and the
    /// frame joins the eviction scan. A no-op if the page is already
    /// resident.
    pub fn swap_in(&self, fs: &FileSys, spte: &Arc<Spte>) -> Result<(), ()> {
        let mut st = spte.state.lock();
        if let PageState::Resident(_) = *st {
            return Ok(());
        }

        let frame = self.frame_alloc(fs, AllocFlags::ZERO);
        *frame.owner.lock() = Some(spte.clone());
        {
            let mut data = frame.data.lock();
            let page = &mut **data;
            match &*st {
                PageState::LazyFile => {
                    let backing = spte.backing.as_ref().ok_or(())?;
                    let n = fs.inode_read_at(&backing.inode, &mut page[..backing.read_bytes], backing.ofs);
                    page[n..].fill(0);
                }
                PageState::LazyZero => {}
                PageState::Swapped(slot) => {
                    self.swap.read_page(*slot, page);
                    self.swap.release_slot(*slot);
                }
                PageState::Resident(_) => unreachable!(),
            }
        }
        spte.pte.install(frame.index(), spte.writable);
        self.frames.push(frame.clone());
        *st = PageState::Resident(frame);
        Ok(())
    }

    /// Evicts one resident page to relieve memory pressure.
    ///
    /// Victim selection is second-chance. Pinned frames are skipped, and a
    /// recently-accessed frame loses its accessed bit and rotates to the
    /// tail. Only the frame-table lock is held while selecting; the drain
    /// I/O happens with the victim already unlinked.
    ///
    /// A clean file-backed page is simply dropped, since the file still
    /// holds its bytes. A dirty mmap page is written back through the file
    /// system. Any other page takes a swap slot. Swap exhaustion is a
    /// panic.
    pub(super) fn swap_out(&self, fs: &FileSys) {
        let victim = {
            let mut list = self.frames.list.lock();
            let mut scanned = 0;
            loop {
                let frame = match list.pop_front() {
                    Some(f) => f,
                    None => panic!("swap_out: no resident frames"),
                };
                scanned += 1;
                if scanned > 2 * (list.len() + 1) {
                    panic!("swap_out: every frame pinned");
                }
                if frame.pinned.load(core::sync::atomic::Ordering::SeqCst) {
                    list.push_back(frame);
                    continue;
                }
                let owner = frame.owner.lock().clone();
                let spte = match owner {
                    Some(s) => s,
                    None => {
                        list.push_back(frame);
                        continue;
                    }
                };
                if spte.pte.is_accessed() {
                    spte.pte.clear_accessed();
                    list.push_back(frame);
                    continue;
                }
                break frame;
            }
        };

        let spte = match victim.owner.lock().clone() {
            Some(s) => s,
            None => {
                // Freed while we were unlinking it; its frame is already back
                // in the pool.
                return;
            }
        };

        // No locks are held here, so blocking on the owner's state is safe;
        // a resident page's state lock is never held across another
        // suspension point.
        let mut st = spte.state.lock();
        match &*st {
            PageState::Resident(f) if Arc::ptr_eq(f, &victim) => {}
            _ => {
                // The page was freed between unlink and here; the frame is
                // already back in the pool.
                return;
            }
        }
        if victim.pinned.load(core::sync::atomic::Ordering::SeqCst) {
            // Pinned after we selected it.
            drop(st);
            self.frames.push(victim);
            return;
        }

        let dirty = spte.pte.is_dirty();
        spte.pte.clear();

        if spte.backing.is_some() && !dirty {
            *st = PageState::LazyFile;
        } else if spte.mmap && dirty {
            let backing = spte
                .backing
                .as_ref()
                .expect("swap_out: mmap page without backing");
            {
                let data = victim.data.lock();
                let written = fs.inode_write_at(&backing.inode, &data[..backing.read_bytes], backing.ofs);
                debug_assert_eq!(written, backing.read_bytes);
            }
            *st = PageState::LazyFile;
        } else {
            let slot = match self.swap.alloc_slot() {
                Some(s) => s,
                None => panic!("swap_out: swap device full"),
            };
            {
                let data = victim.data.lock();
                self.swap.write_page(slot, &data);
            }
            *st = PageState::Swapped(slot);
        }
        drop(st);
        self.pool.put(&victim);
    }

    /// A frame, evicting until one frees up.
    pub(super) fn frame_alloc(&self, fs: &FileSys, flags: AllocFlags) -> Arc<Frame> {
        loop {
            if let Some(frame) = self.pool.try_get(flags) {
                return frame;
            }
            self.swap_out(fs);
        }
    }

    /// Page-fault entry point. `fault_addr` must be a user address with a
    /// supplemental entry, or an address within the stack-growth window
    /// below the saved user stack pointer. Anything else is fatal to the
    /// process (the caller kills it).
    pub fn handle_fault(&self, fs: &FileSys, proc: &Proc, fault_addr: usize) -> Result<(), ()> {
        let spte = self.resolve_user_page(fs, proc, fault_addr)?;
        self.swap_in(fs, &spte)
    }

    /// The entry covering `addr`, growing the stack when `addr` falls in
    /// the growth window.
    pub(super) fn resolve_user_page(
        &self,
        fs: &FileSys,
        proc: &Proc,
        addr: usize,
    ) -> Result<Arc<Spte>, ()> {
        if addr >= PHYS_BASE {
            return Err(());
        }
        let upage = addr & !(PGSIZE - 1);
        if let Some(spte) = self.spte_lookup(proc.tid, upage) {
            return Ok(spte);
        }

        let sp = proc.user_sp();
        if addr >= PHYS_BASE - STACK_MAX && addr + STACK_SLOP >= sp {
            return self.spte_allocate(fs, proc, upage, true, true, None, false);
        }
        Err(())
    }

    /// Faults the pages of `[addr, addr + len)` in and pins their frames so
    /// the range cannot be evicted while a kernel operation works on it.
    pub fn pin_range(&self, fs: &FileSys, proc: &Proc, addr: usize, len: usize) -> Result<(), ()> {
        let mut upage = addr & !(PGSIZE - 1);
        let end = addr.checked_add(len).ok_or(())?;
        while upage < end {
            let spte = self.resolve_user_page(fs, proc, upage.max(addr))?;
            let _ = self.pin_resident(fs, &spte)?;
            upage += PGSIZE;
        }
        Ok(())
    }

    /// Undoes [`Vm::pin_range`].
    pub fn unpin_range(&self, proc: &Proc, addr: usize, len: usize) {
        let mut upage = addr & !(PGSIZE - 1);
        let end = addr.saturating_add(len);
        while upage < end {
            if let Some(spte) = self.spte_lookup(proc.tid, upage) {
                if let PageState::Resident(frame) = &*spte.state.lock() {
                    frame.pinned.store(false, core::sync::atomic::Ordering::SeqCst);
                }
            }
            upage += PGSIZE;
        }
    }

    /// Brings `spte` resident and pins its frame, retrying if eviction
    /// races in between.
    pub(super) fn pin_resident(&self, fs: &FileSys, spte: &Arc<Spte>) -> Result<Arc<Frame>, ()> {
        loop {
            self.swap_in(fs, spte)?;
            let st = spte.state.lock();
            if let PageState::Resident(frame) = &*st {
                frame.pinned.store(true, core::sync::atomic::Ordering::SeqCst);
                return Ok(frame.clone());
            }
        }
    }
}
