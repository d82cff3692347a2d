//! Buffer cache.
//!
//! A fixed array of sector-sized slots holding cached copies of disk sector
//! contents. Every sector read and write from the layers above goes through
//! here; besides cutting disk traffic, the per-slot locks are the
//! synchronization point for sectors shared by multiple processes.
//!
//! The cache writes back: a write dirties the slot and returns without
//! touching the disk. Dirty contents supersede the disk until [`Bcache::flush`]
//! runs (the shutdown path calls it).
//!
//! Replacement is a clock sweep. A single hand advances over the slots under
//! the cache-wide eviction lock; a slot whose accessed bit is set gets a
//! second chance, anything else is the victim. The eviction lock covers
//! victim selection only. The write-back and refill happen under the
//! victim's slot lock alone, so a concurrent reader of that sector blocks on
//! the slot lock rather than seeing bytes of the wrong sector.

use alloc::sync::Arc;

use array_macro::array;
use spin::{Mutex, MutexGuard};

use crate::hal::Disk;
use crate::param::{NBUF, SECTOR_NONE, SECTOR_SIZE};

struct Slot {
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    sector: u32,
    allocated: bool,
    accessed: bool,
    dirty: bool,
    data: [u8; SECTOR_SIZE],
}

impl Slot {
    const fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                sector: SECTOR_NONE,
                allocated: false,
                accessed: false,
                dirty: false,
                data: [0; SECTOR_SIZE],
            }),
        }
    }
}

pub struct Bcache {
    disk: Arc<dyn Disk>,
    slots: [Slot; NBUF],
    /// Eviction lock; the guarded value is the clock hand.
    hand: Mutex<usize>,
}

impl Bcache {
    pub fn new(disk: Arc<dyn Disk>) -> Self {
        Self {
            disk,
            slots: array![_ => Slot::new(); NBUF],
            hand: Mutex::new(0),
        }
    }

    /// Copies `dst.len()` bytes out of `sector` starting at byte `ofs`.
    pub fn read(&self, sector: u32, ofs: usize, dst: &mut [u8]) {
        debug_assert!(ofs + dst.len() <= SECTOR_SIZE);
        let mut slot = self.slot_for(sector);
        slot.accessed = true;
        dst.copy_from_slice(&slot.data[ofs..ofs + dst.len()]);
    }

    /// Copies `src` into `sector` at byte `ofs` and dirties the slot.
    /// Does not block on a disk write.
    pub fn write(&self, sector: u32, ofs: usize, src: &[u8]) {
        debug_assert!(ofs + src.len() <= SECTOR_SIZE);
        let mut slot = self.slot_for(sector);
        slot.accessed = true;
        slot.dirty = true;
        slot.data[ofs..ofs + src.len()].copy_from_slice(src);
    }

    /// Fills `sector` with zero bytes without reading it first.
    pub fn zero(&self, sector: u32) {
        let mut slot = self.slot_for(sector);
        slot.accessed = true;
        slot.dirty = true;
        slot.data.fill(0);
    }

    /// Writes every dirty slot to disk. Dirty data is durable only after
    /// this returns.
    pub fn flush(&self) {
        for slot in &self.slots {
            let mut slot = slot.inner.lock();
            if slot.allocated && slot.dirty {
                self.disk.write_sector(slot.sector, &slot.data);
                slot.dirty = false;
            }
        }
    }

    /// Returns the locked slot holding `sector`, loading it on a miss.
    fn slot_for(&self, sector: u32) -> MutexGuard<'_, SlotInner> {
        debug_assert_ne!(sector, SECTOR_NONE);

        // Hit path: no eviction lock.
        for slot in &self.slots {
            let slot = slot.inner.lock();
            if slot.allocated && slot.sector == sector {
                return slot;
            }
        }

        let mut hand = self.hand.lock();

        // Re-scan under the eviction lock: another thread may have installed
        // the sector after our first pass. This keeps at most one slot per
        // sector allocated.
        for slot in &self.slots {
            let slot = slot.inner.lock();
            if slot.allocated && slot.sector == sector {
                return slot;
            }
        }

        // Clock sweep for a victim.
        loop {
            let idx = *hand;
            *hand = (idx + 1) % NBUF;
            let mut slot = self.slots[idx].inner.lock();
            if slot.allocated && slot.accessed {
                slot.accessed = false;
                continue;
            }

            // Claim the slot for the new sector before dropping the eviction
            // lock; later lookups for `sector` find it here and block on the
            // slot lock until the refill below finishes.
            let old_sector = slot.sector;
            let write_back = slot.allocated && slot.dirty;
            let old_data = slot.data;
            slot.sector = sector;
            slot.allocated = true;
            slot.accessed = false;
            slot.dirty = false;
            drop(hand);

            if write_back {
                self.disk.write_sector(old_sector, &old_data);
            }
            self.disk.read_sector(sector, &mut slot.data);
            return slot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemDisk;

    fn cache(nsectors: u32) -> Bcache {
        Bcache::new(Arc::new(MemDisk::new(nsectors)))
    }

    #[test]
    fn write_is_visible_before_flush() {
        let c = cache(16);
        c.write(3, 10, b"hello");
        let mut got = [0u8; 5];
        c.read(3, 10, &mut got);
        assert_eq!(&got, b"hello");
    }

    #[test]
    fn dirty_data_reaches_disk_only_at_flush() {
        let disk = Arc::new(MemDisk::new(16));
        let c = Bcache::new(disk.clone());
        c.write(5, 0, &[0xabu8; SECTOR_SIZE]);

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read_sector(5, &mut raw);
        assert_eq!(raw, [0u8; SECTOR_SIZE]);

        c.flush();
        disk.read_sector(5, &mut raw);
        assert_eq!(raw, [0xabu8; SECTOR_SIZE]);
    }

    #[test]
    fn eviction_writes_back_and_keeps_contents() {
        let disk = Arc::new(MemDisk::new(512));
        let c = Bcache::new(disk.clone());

        // Dirty one sector, then stream enough other sectors through the
        // cache to force its slot out.
        c.write(1, 0, &[0x77u8; SECTOR_SIZE]);
        for s in 0..(NBUF as u32) * 3 {
            let mut b = [0u8; 1];
            c.read(100 + s, 0, &mut b);
        }

        let mut got = [0u8; SECTOR_SIZE];
        c.read(1, 0, &mut got);
        assert_eq!(got, [0x77u8; SECTOR_SIZE]);
    }

    #[test]
    fn no_torn_sector_under_concurrent_readers() {
        let disk = Arc::new(MemDisk::new(32));
        let c = Arc::new(Bcache::new(disk));
        c.write(7, 0, &[0u8; SECTOR_SIZE]);

        let writer = {
            let c = c.clone();
            std::thread::spawn(move || {
                for i in 0..500 {
                    let fill = if i % 2 == 0 { 0x00 } else { 0xff };
                    c.write(7, 0, &[fill; SECTOR_SIZE]);
                }
            })
        };
        let readers: Vec<_> = (0..2)
            .map(|_| {
                let c = c.clone();
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let mut buf = [0u8; SECTOR_SIZE];
                        c.read(7, 0, &mut buf);
                        let first = buf[0];
                        assert!(first == 0x00 || first == 0xff);
                        assert!(buf.iter().all(|&b| b == first), "torn sector read");
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}
