//! Per-process page tables.
//!
//! The hardware walker is out of scope. What the memory manager actually
//! relies on is the narrow contract around page-table entries: looking one
//! up (optionally creating it), installing or clearing a frame mapping,
//! and poking the `ACCESSED`/`DIRTY` bits that eviction reads. A
//! [`PageDir`] keeps one shared atomic PTE word per mapped user page, so
//! the eviction scan can manipulate bits of another process's entries
//! without extra locking, the same way the real bit-twiddling on
//! page-table memory works.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, Ordering};

use bitflags::bitflags;
use spin::Mutex;

bitflags! {
    pub struct PteFlags: u32 {
        const PRESENT = 1;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
    }
}

/// Bits of a PTE word below the frame number.
const FLAG_BITS: u32 = 12;

/// One page-table entry: flag bits low, frame index high.
pub struct Pte(AtomicU32);

impl Pte {
    fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    pub fn flags(&self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0.load(Ordering::SeqCst))
    }

    /// Points the entry at `frame`, present and user-accessible, with the
    /// accessed/dirty bits reset.
    pub fn install(&self, frame: u32, writable: bool) {
        let mut bits = PteFlags::PRESENT | PteFlags::USER;
        if writable {
            bits |= PteFlags::WRITABLE;
        }
        self.0.store((frame << FLAG_BITS) | bits.bits(), Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }

    pub fn is_present(&self) -> bool {
        self.flags().contains(PteFlags::PRESENT)
    }

    pub fn is_writable(&self) -> bool {
        self.flags().contains(PteFlags::WRITABLE)
    }

    pub fn is_accessed(&self) -> bool {
        self.flags().contains(PteFlags::ACCESSED)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags().contains(PteFlags::DIRTY)
    }

    pub fn set_accessed(&self) {
        let _ = self.0.fetch_or(PteFlags::ACCESSED.bits(), Ordering::SeqCst);
    }

    pub fn set_dirty(&self) {
        let _ = self.0.fetch_or(PteFlags::DIRTY.bits(), Ordering::SeqCst);
    }

    pub fn clear_accessed(&self) {
        let _ = self.0.fetch_and(!PteFlags::ACCESSED.bits(), Ordering::SeqCst);
    }

    /// Frame index of a present entry.
    pub fn frame(&self) -> u32 {
        self.0.load(Ordering::SeqCst) >> FLAG_BITS
    }
}

/// A process's page directory.
pub struct PageDir {
    map: Mutex<BTreeMap<usize, Arc<Pte>>>,
}

impl PageDir {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    /// The PTE for `upage`, created empty when `create` is set.
    pub fn lookup_page(&self, upage: usize, create: bool) -> Option<Arc<Pte>> {
        let mut map = self.map.lock();
        if let Some(pte) = map.get(&upage) {
            return Some(pte.clone());
        }
        if !create {
            return None;
        }
        let pte = Arc::new(Pte::new());
        let _ = map.insert(upage, pte.clone());
        Some(pte)
    }

    /// Frame index mapped at `upage`, if present.
    pub fn get_page(&self, upage: usize) -> Option<u32> {
        let pte = self.lookup_page(upage, false)?;
        if pte.is_present() {
            Some(pte.frame())
        } else {
            None
        }
    }

    /// Drops the entry for `upage` entirely.
    pub fn clear_page(&self, upage: usize) {
        let _ = self.map.lock().remove(&upage);
    }
}

impl Default for PageDir {
    fn default() -> Self {
        Self::new()
    }
}
