/// Size of a disk sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sentinel sector number meaning "unallocated".
pub const SECTOR_NONE: u32 = u32::MAX;

/// Size of the disk sector cache.
pub const NBUF: usize = 64;

/// Direct block pointers per inode.
pub const NDIRECT: usize = 118;

/// First-level index block pointers per inode.
pub const NINDIRECT: usize = 5;

/// Sector pointers per index block.
pub const INDEX_FANOUT: usize = 126;

/// Largest file, in sectors, the block map can address.
pub const MAXFILE: usize = NDIRECT + NINDIRECT * INDEX_FANOUT + INDEX_FANOUT * INDEX_FANOUT;

/// Sector of the free-map inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector of the root directory inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Maximum length of a single path component.
pub const NAME_MAX: usize = 14;

/// Maximum length of a full path.
pub const MAXPATH: usize = 1000;

/// Open files per process.
pub const NOFILE: usize = 32;

/// First file descriptor handed to user code; 0/1/2 are reserved.
pub const FIRST_FD: i32 = 3;

/// Size of a user page in bytes.
pub const PGSIZE: usize = 4096;

/// Sectors per user page; a swap slot spans this many sectors.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// First address above user space. User stacks grow down from here.
pub const PHYS_BASE: usize = 0xc000_0000;

/// Maximum user stack size in bytes.
pub const STACK_MAX: usize = 8 * 1024 * 1024;

/// Faults this far below the saved user stack pointer still grow the
/// stack (covers PUSH and PUSHA decrements).
pub const STACK_SLOP: usize = 32;
