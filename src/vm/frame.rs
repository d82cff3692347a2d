//! User frames.
//!
//! The machine hands the kernel a bounded pool of page-sized frames for
//! user memory; [`UserPool`] is that allocator, a free list over
//! statically-sized storage in the style of a kernel page allocator. The
//! [`FrameTable`] lists the frames currently backing resident user pages,
//! in the order the second-chance eviction scan visits them.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::AtomicBool;

use bitflags::bitflags;
use spin::Mutex;

use super::spt::Spte;
use crate::param::PGSIZE;

bitflags! {
    pub struct AllocFlags: u32 {
        /// Zero-fill the frame before handing it out.
        const ZERO = 1;
    }
}

/// A page of frame memory.
pub struct Page(Box<[u8; PGSIZE]>);

impl Page {
    fn new() -> Self {
        Self(Box::new([0; PGSIZE]))
    }
}

impl Deref for Page {
    type Target = [u8; PGSIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for Page {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// One physical user frame.
pub struct Frame {
    index: u32,
    /// The frame's bytes. Held while copying user data in or out and while
    /// eviction drains the frame to swap or a file.
    pub data: Mutex<Page>,
    /// Pinned frames are skipped by the eviction scan.
    pub pinned: AtomicBool,
    /// The page this frame currently backs.
    pub owner: Mutex<Option<Arc<Spte>>>,
}

impl Frame {
    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Fixed pool of user frames with a free-list allocator.
pub struct UserPool {
    frames: Vec<Arc<Frame>>,
    free: Mutex<Vec<u32>>,
}

impl UserPool {
    pub fn new(nframes: usize) -> Self {
        let frames = (0..nframes)
            .map(|i| {
                Arc::new(Frame {
                    index: i as u32,
                    data: Mutex::new(Page::new()),
                    pinned: AtomicBool::new(false),
                    owner: Mutex::new(None),
                })
            })
            .collect();
        Self {
            frames,
            free: Mutex::new((0..nframes as u32).rev().collect()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    /// Grabs a free frame. Returns `None` under memory pressure; the
    /// caller evicts and retries.
    pub fn try_get(&self, flags: AllocFlags) -> Option<Arc<Frame>> {
        let index = self.free.lock().pop()?;
        let frame = self.frames[index as usize].clone();
        if flags.contains(AllocFlags::ZERO) {
            frame.data.lock().fill(0);
        }
        Some(frame)
    }

    /// Returns a frame to the free list.
    pub fn put(&self, frame: &Arc<Frame>) {
        *frame.owner.lock() = None;
        frame.pinned.store(false, core::sync::atomic::Ordering::SeqCst);
        self.free.lock().push(frame.index);
    }

    /// The frame with the given pool index.
    pub fn frame(&self, index: u32) -> &Arc<Frame> {
        &self.frames[index as usize]
    }
}

/// Resident frames in eviction-scan order.
pub struct FrameTable {
    pub(super) list: Mutex<VecDeque<Arc<Frame>>>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, frame: Arc<Frame>) {
        self.list.lock().push_back(frame);
    }

    pub fn remove(&self, frame: &Arc<Frame>) {
        self.list.lock().retain(|f| !Arc::ptr_eq(f, frame));
    }

    pub fn len(&self) -> usize {
        self.list.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_is_bounded() {
        let pool = UserPool::new(2);
        let a = pool.try_get(AllocFlags::ZERO).unwrap();
        let _b = pool.try_get(AllocFlags::empty()).unwrap();
        assert!(pool.try_get(AllocFlags::empty()).is_none());

        pool.put(&a);
        assert!(pool.try_get(AllocFlags::empty()).is_some());
    }

    #[test]
    fn zero_flag_clears_recycled_frames() {
        let pool = UserPool::new(1);
        let f = pool.try_get(AllocFlags::empty()).unwrap();
        f.data.lock()[0] = 0xee;
        pool.put(&f);

        let f = pool.try_get(AllocFlags::ZERO).unwrap();
        assert_eq!(f.data.lock()[0], 0);
    }
}
