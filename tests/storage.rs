//! End-to-end storage scenarios: file growth across block-map tiers,
//! directory semantics over the syscall surface, write-deny, and
//! durability across remounts.

use std::sync::Arc;

use kernel::hal::MemDisk;
use kernel::param::{NDIRECT, ROOT_DIR_SECTOR, SECTOR_SIZE};
use kernel::syscall::*;
use kernel::Kernel;

const SPAD: usize = 0x1000_0000;
const BUF: usize = 0x2000_0000;
const PGSIZE: usize = kernel::param::PGSIZE;

fn boot(fs_sectors: u32, frames: usize) -> (Arc<Kernel>, Arc<kernel::proc::Proc>) {
    let k = Kernel::new(
        Arc::new(MemDisk::new(fs_sectors)),
        Arc::new(MemDisk::new(4096)),
        true,
        frames,
    )
    .unwrap();
    let p = k.spawn();
    (k, p)
}

fn user_str(k: &Kernel, p: &Arc<kernel::proc::Proc>, base: usize, s: &[u8]) -> u32 {
    if k.vm.spte_lookup(p.tid, base).is_none() {
        k.vm
            .spte_allocate(&k.fs, p, base, true, true, None, false)
            .unwrap();
    }
    let mut bytes = s.to_vec();
    bytes.push(0);
    k.vm.copy_to_user(&k.fs, p, base, &bytes).unwrap();
    base as u32
}

fn user_buf(k: &Kernel, p: &Arc<kernel::proc::Proc>, base: usize, pages: usize) -> u32 {
    for i in 0..pages {
        let upage = base + i * PGSIZE;
        if k.vm.spte_lookup(p.tid, upage).is_none() {
            k.vm
                .spte_allocate(&k.fs, p, upage, true, true, None, false)
                .unwrap();
        }
    }
    base as u32
}

/// Writing 130 sectors walks the file off the direct pointers and into the
/// indirect tier; every sector must read back with its own pattern and the
/// length must land exactly at the end of the last write.
#[test]
fn grow_across_tiers() {
    let (k, _p) = boot(16384, 16);
    assert!(k.fs.create(ROOT_DIR_SECTOR, b"/big", 0));
    let ino = k.fs.open(ROOT_DIR_SECTOR, b"/big").unwrap();

    let sectors = 130;
    assert!(sectors > NDIRECT, "must cross out of the direct tier");
    for i in 0..sectors {
        let fill = [(i % 256) as u8; SECTOR_SIZE];
        assert_eq!(k.fs.inode_write_at(&ino, &fill, i * SECTOR_SIZE), SECTOR_SIZE);
    }
    assert_eq!(k.fs.inode_length(&ino), sectors * SECTOR_SIZE);

    for i in (0..sectors).rev() {
        let mut back = [0u8; SECTOR_SIZE];
        assert_eq!(k.fs.inode_read_at(&ino, &mut back, i * SECTOR_SIZE), SECTOR_SIZE);
        assert!(
            back.iter().all(|&b| b == (i % 256) as u8),
            "sector {} pattern mismatch",
            i
        );
    }
    k.fs.inode_close(ino);
}

/// A write landing deep in the doubly-indirect range still reads back, and
/// the hole below it reads as zeros.
#[test]
fn doubly_indirect_range_is_reachable() {
    let (k, _p) = boot(16384, 16);
    assert!(k.fs.create(ROOT_DIR_SECTOR, b"/deep", 0));
    let ino = k.fs.open(ROOT_DIR_SECTOR, b"/deep").unwrap();

    // Past the direct and single-indirect tiers.
    let far = (NDIRECT + 5 * 126 + 40) * SECTOR_SIZE;
    assert_eq!(k.fs.inode_write_at(&ino, b"far out", far), 7);
    assert_eq!(k.fs.inode_length(&ino), far + 7);

    let mut back = [0u8; 7];
    assert_eq!(k.fs.inode_read_at(&ino, &mut back, far), 7);
    assert_eq!(&back, b"far out");

    let mut hole = [1u8; 256];
    assert_eq!(k.fs.inode_read_at(&ino, &mut hole, far / 2), 256);
    assert!(hole.iter().all(|&b| b == 0));
    k.fs.inode_close(ino);
}

/// The directory-atomicity seed scenario, straight through the syscalls.
#[test]
fn directory_atomicity() {
    let (k, p) = boot(8192, 16);
    let a = user_str(&k, &p, SPAD, b"/a");
    let ab = user_str(&k, &p, SPAD + PGSIZE, b"/a/b");
    let abc = user_str(&k, &p, SPAD + 2 * PGSIZE, b"/a/b/c");

    assert_eq!(k.syscall(&p, SYS_MKDIR, [a, 0, 0]), 1);
    assert_eq!(k.syscall(&p, SYS_MKDIR, [ab, 0, 0]), 1);
    assert_eq!(k.syscall(&p, SYS_CREATE, [abc, 10, 0]), 1);

    assert_eq!(k.syscall(&p, SYS_REMOVE, [ab, 0, 0]), 0, "non-empty dir");
    assert_eq!(k.syscall(&p, SYS_REMOVE, [abc, 0, 0]), 1);
    assert_eq!(k.syscall(&p, SYS_REMOVE, [ab, 0, 0]), 1);
    assert_eq!(k.syscall(&p, SYS_REMOVE, [a, 0, 0]), 1);
}

/// mkdir; chdir; inumber(open(".")) sees the new directory.
#[test]
fn mkdir_chdir_inumber_round_trip() {
    let (k, p) = boot(8192, 16);
    let d = user_str(&k, &p, SPAD, b"/nest");
    assert_eq!(k.syscall(&p, SYS_MKDIR, [d, 0, 0]), 1);
    assert_eq!(k.syscall(&p, SYS_CHDIR, [d, 0, 0]), 1);

    let dot = user_str(&k, &p, SPAD + PGSIZE, b".");
    let fd = k.syscall(&p, SYS_OPEN, [dot, 0, 0]);
    assert!(fd >= 3);
    let inum = k.syscall(&p, SYS_INUMBER, [fd as u32, 0, 0]);

    let abs = k.fs.open(ROOT_DIR_SECTOR, b"/nest").unwrap();
    assert_eq!(inum as u32, abs.sector);
    k.fs.inode_close(abs);
}

/// Deny-write pins an executable image: writes return 0 until the count
/// drains, then succeed again.
#[test]
fn executable_deny_write() {
    let (k, _p) = boot(8192, 16);
    assert!(k.fs.mkdir(ROOT_DIR_SECTOR, b"/bin"));
    assert!(k.fs.create(ROOT_DIR_SECTOR, b"/bin/x", 32));

    let ino = k.fs.open(ROOT_DIR_SECTOR, b"/bin/x").unwrap();
    k.fs.inode_deny_write(&ino);
    assert_eq!(k.fs.inode_write_at(&ino, b"patch", 0), 0);

    k.fs.inode_allow_write(&ino);
    assert_eq!(k.fs.inode_write_at(&ino, b"patch", 0), 5);
    k.fs.inode_close(ino);
}

/// write; flush; a fresh mount of the same disk reads the same bytes.
#[test]
fn flush_round_trip_law() {
    let disk = Arc::new(MemDisk::new(8192));
    let k = Kernel::new(disk.clone(), Arc::new(MemDisk::new(512)), true, 8).unwrap();
    assert!(k.fs.create(ROOT_DIR_SECTOR, b"/law", 0));
    let ino = k.fs.open(ROOT_DIR_SECTOR, b"/law").unwrap();
    let payload: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
    assert_eq!(k.fs.inode_write_at(&ino, &payload, 100), payload.len());
    k.fs.inode_close(ino);
    k.fs.shutdown();

    let k2 = Kernel::new(disk, Arc::new(MemDisk::new(512)), false, 8).unwrap();
    let ino = k2.fs.open(ROOT_DIR_SECTOR, b"/law").unwrap();
    let mut back = vec![0u8; payload.len()];
    assert_eq!(k2.fs.inode_read_at(&ino, &mut back, 100), payload.len());
    assert_eq!(back, payload);
    k2.fs.inode_close(ino);
}

/// Removing an open file: the name disappears at once, the data survives
/// until the last close, and the sectors come back afterwards.
#[test]
fn remove_while_open_releases_blocks_at_last_close() {
    let (k, _p) = boot(8192, 16);
    let free_at_start = k.fs.free_sector_count();
    assert!(k.fs.create(ROOT_DIR_SECTOR, b"/ghost", 5 * SECTOR_SIZE));
    let ino = k.fs.open(ROOT_DIR_SECTOR, b"/ghost").unwrap();

    assert!(k.fs.remove(ROOT_DIR_SECTOR, b"/ghost"));
    assert!(k.fs.open(ROOT_DIR_SECTOR, b"/ghost").is_none());
    assert_eq!(k.fs.inode_write_at(&ino, b"still writable", 0), 14);
    k.fs.inode_close(ino);

    assert_eq!(k.fs.free_sector_count(), free_at_start);
}

/// A buffer straddling a bad page kills the process mid-copy, not the
/// kernel.
#[test]
fn partially_mapped_buffer_is_fatal_to_the_process() {
    let (k, p) = boot(8192, 16);
    let path = user_str(&k, &p, SPAD, b"/x");
    assert_eq!(k.syscall(&p, SYS_CREATE, [path, 4096, 0]), 1);
    let fd = k.syscall(&p, SYS_OPEN, [path, 0, 0]);

    // One mapped page followed by nothing.
    let buf = user_buf(&k, &p, BUF, 1);
    let _ = k.syscall(&p, SYS_READ, [fd as u32, buf, (PGSIZE + 64) as u32]);
    assert_eq!(p.exit_status(), Some(-1));
}

/// Reads beyond EOF return 0 bytes; writes past EOF grow and zero-fill.
#[test]
fn eof_and_gap_boundaries() {
    let (k, p) = boot(8192, 16);
    let path = user_str(&k, &p, SPAD, b"/edge");
    assert_eq!(k.syscall(&p, SYS_CREATE, [path, 10, 0]), 1);
    let fd = k.syscall(&p, SYS_OPEN, [path, 0, 0]) as u32;
    let buf = user_buf(&k, &p, BUF, 1);

    assert_eq!(k.syscall(&p, SYS_SEEK, [fd, 10, 0]), 0);
    assert_eq!(k.syscall(&p, SYS_READ, [fd, buf, 4]), 0, "read at EOF");

    assert_eq!(k.syscall(&p, SYS_SEEK, [fd, 1000, 0]), 0);
    k.vm.copy_to_user(&k.fs, &p, BUF, b"zz").unwrap();
    assert_eq!(k.syscall(&p, SYS_WRITE, [fd, buf, 2]), 2);
    assert_eq!(k.syscall(&p, SYS_FILESIZE, [fd, 0, 0]), 1002);

    assert_eq!(k.syscall(&p, SYS_SEEK, [fd, 500, 0]), 0);
    assert_eq!(k.syscall(&p, SYS_READ, [fd, buf, 8]), 8);
    let mut gap = [9u8; 8];
    k.vm.copy_from_user(&k.fs, &p, BUF, &mut gap).unwrap();
    assert_eq!(gap, [0u8; 8]);
}

/// Too-long paths are an error result, not a kill; unreadable paths kill.
#[test]
fn path_length_vs_bad_pointer() {
    let (k, p) = boot(8192, 16);

    let long: Vec<u8> = std::iter::repeat(b'a').take(kernel::param::MAXPATH + 10).collect();
    let addr = user_buf(&k, &p, SPAD, 2);
    let mut with_nul = long.clone();
    with_nul.push(0);
    k.vm.copy_to_user(&k.fs, &p, SPAD, &with_nul).unwrap();
    assert_eq!(k.syscall(&p, SYS_CREATE, [addr, 0, 0]), 0);
    assert!(!p.has_exited(), "too-long path is not fatal");

    assert_eq!(k.syscall(&p, SYS_CREATE, [0x7f00_0000, 0, 0]), -1);
    assert_eq!(p.exit_status(), Some(-1));
}
