//! Memory-mapped files.
//!
//! `mmap` pins nothing and copies nothing: it reopens the backing file and
//! plants one lazy file-backed page entry per page of the mapping. Pages
//! materialize through the ordinary fault path; dirty pages drain back into
//! the file at eviction and at unmap, so after `munmap` the file holds
//! everything user code stored through the mapping.

use alloc::sync::Arc;
use alloc::vec::Vec;

use super::spt::{FileBacking, PageState};
use super::Vm;
use crate::fs::{FileSys, Inode};
use crate::param::{PGSIZE, PHYS_BASE};
use crate::proc::Proc;

/// One live mapping of a file into a process's address space.
pub struct MmapEntry {
    pub mapid: i32,
    pub base: usize,
    pub pages: usize,
    /// Private reopened handle; closed at unmap.
    pub file: Arc<Inode>,
}

impl Vm {
    /// Maps `inode`'s contents at `upage`, returning `mapid`.
    ///
    /// Rejects empty files, unaligned or null `upage`, ranges crossing the
    /// top of user space, and ranges where any page already has an entry.
    pub fn mmap(
        &self,
        fs: &FileSys,
        proc: &Proc,
        inode: &Arc<Inode>,
        upage: usize,
        mapid: i32,
    ) -> Result<i32, ()> {
        let length = fs.inode_length(inode);
        if length == 0 || upage == 0 || upage % PGSIZE != 0 {
            return Err(());
        }
        let pages = (length + PGSIZE - 1) / PGSIZE;
        if upage + pages * PGSIZE > PHYS_BASE {
            return Err(());
        }
        for i in 0..pages {
            if self.spte_lookup(proc.tid, upage + i * PGSIZE).is_some() {
                return Err(());
            }
        }

        let handle = fs.inode_reopen(inode);
        let mut installed: Vec<usize> = Vec::new();
        for i in 0..pages {
            let ofs = i * PGSIZE;
            let backing = FileBacking {
                inode: handle.clone(),
                ofs,
                read_bytes: (length - ofs).min(PGSIZE),
            };
            let page = upage + ofs;
            if self
                .spte_allocate(fs, proc, page, true, true, Some(backing), true)
                .is_err()
            {
                for &u in &installed {
                    self.drop_page(proc, u);
                }
                fs.inode_close(handle);
                return Err(());
            }
            installed.push(page);
        }

        proc.mmaps.lock().push(MmapEntry {
            mapid,
            base: upage,
            pages,
            file: handle,
        });
        Ok(mapid)
    }

    /// Unmaps mapping `mapid`: flushes dirty pages back to the file, frees
    /// every page entry, and closes the reopened handle.
    pub fn munmap(&self, fs: &FileSys, proc: &Proc, mapid: i32) -> Result<(), ()> {
        let entry = {
            let mut mmaps = proc.mmaps.lock();
            let idx = mmaps.iter().position(|m| m.mapid == mapid).ok_or(())?;
            mmaps.swap_remove(idx)
        };

        for i in 0..entry.pages {
            let upage = entry.base + i * PGSIZE;
            if let Some(spte) = self.spte_lookup(proc.tid, upage) {
                self.mmap_writeback(fs, &spte);
                self.drop_page(proc, upage);
            }
        }
        fs.inode_close(entry.file);
        Ok(())
    }

    /// Unmaps every mapping the process still holds (exit path).
    pub fn munmap_all(&self, fs: &FileSys, proc: &Proc) {
        loop {
            let mapid = match proc.mmaps.lock().first() {
                Some(m) => m.mapid,
                None => break,
            };
            let _ = self.munmap(fs, proc, mapid);
        }
    }

    /// Flushes one mmap page back to its file if user code dirtied it.
    fn mmap_writeback(&self, fs: &FileSys, spte: &Arc<super::spt::Spte>) {
        // Dirty pages normally drain at eviction; a swapped mmap page can
        // only appear if that policy ever changes, so make it resident again
        // rather than lose the bytes.
        if spte.is_swapped() {
            let _ = self.swap_in(fs, spte);
        }
        if !spte.pte().is_dirty() {
            return;
        }
        let st = spte.state.lock();
        if let PageState::Resident(frame) = &*st {
            let backing = spte.backing.as_ref().expect("mmap page without backing");
            let data = frame.data.lock();
            let written = fs.inode_write_at(&backing.inode, &data[..backing.read_bytes], backing.ofs);
            debug_assert_eq!(written, backing.read_bytes);
        }
    }

    /// Frees one page entry and its page-directory slot.
    fn drop_page(&self, proc: &Proc, upage: usize) {
        if let Some(spte) = self.spte_lookup(proc.tid, upage) {
            self.spte_free(&spte);
        }
        proc.pagedir.clear_page(upage);
        proc.upages.lock().retain(|&u| u != upage);
    }
}
