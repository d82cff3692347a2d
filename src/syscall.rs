//! System calls.
//!
//! The trap glue hands this module a user stack pointer; the syscall number
//! sits at `*esp` with the argument words above it. Every word and every
//! user buffer a call touches is validated with single-byte probes before
//! use. A bad pointer anywhere terminates the process with exit status -1
//! rather than faulting in the kernel.
//!
//! User data never crosses into file-system code directly: reads and writes
//! stage through kernel buffers in bounded chunks, and the user side of
//! each copy pins its pages for the copy's duration.

use alloc::sync::Arc;
use alloc::vec;

use crate::file::File;
use crate::kernel::Kernel;
use crate::param::{MAXPATH, NAME_MAX, SECTOR_SIZE};
use crate::proc::Proc;
use crate::vm::UserError;

pub const SYS_HALT: u32 = 0;
pub const SYS_EXIT: u32 = 1;
pub const SYS_EXEC: u32 = 2;
pub const SYS_WAIT: u32 = 3;
pub const SYS_CREATE: u32 = 4;
pub const SYS_REMOVE: u32 = 5;
pub const SYS_OPEN: u32 = 6;
pub const SYS_FILESIZE: u32 = 7;
pub const SYS_READ: u32 = 8;
pub const SYS_WRITE: u32 = 9;
pub const SYS_SEEK: u32 = 10;
pub const SYS_TELL: u32 = 11;
pub const SYS_CLOSE: u32 = 12;
pub const SYS_MMAP: u32 = 13;
pub const SYS_MUNMAP: u32 = 14;
pub const SYS_CHDIR: u32 = 15;
pub const SYS_MKDIR: u32 = 16;
pub const SYS_READDIR: u32 = 17;
pub const SYS_ISDIR: u32 = 18;
pub const SYS_INUMBER: u32 = 19;

pub const STDIN_FILENO: i32 = 0;
pub const STDOUT_FILENO: i32 = 1;
pub const STDERR_FILENO: i32 = 2;

/// Stage user I/O through the kernel this many bytes at a time.
const IO_CHUNK: usize = 64 * SECTOR_SIZE;

/// The process was terminated mid-call; there is no return value.
struct Killed;

type SysResult = Result<i32, Killed>;

impl Kernel {
    /// Trap entry point: decodes the syscall frame at `esp` and dispatches.
    /// The return value goes back to user code in `eax`.
    pub fn handle_syscall(&self, proc: &Arc<Proc>, esp: usize) -> i32 {
        proc.set_user_sp(esp);
        let result = (|| {
            if esp % 4 != 0 {
                return self.kill(proc);
            }
            let num = self.fetch_word(proc, esp)?;
            let mut args = [0u32; 3];
            for (i, arg) in args.iter_mut().enumerate().take(arg_count(num)) {
                *arg = self.fetch_word(proc, esp + 4 * (i + 1))?;
            }
            self.do_syscall(proc, num, args)
        })();
        result.unwrap_or(-1)
    }

    /// Dispatches an already-decoded call. Argument words are the raw
    /// 32-bit values user code pushed.
    pub fn syscall(&self, proc: &Arc<Proc>, num: u32, args: [u32; 3]) -> i32 {
        self.do_syscall(proc, num, args).unwrap_or(-1)
    }

    fn do_syscall(&self, proc: &Arc<Proc>, num: u32, args: [u32; 3]) -> SysResult {
        match num {
            SYS_HALT => {
                self.halt();
                Ok(0)
            }
            SYS_EXIT => {
                self.proc_exit(proc, args[0] as i32);
                Err(Killed)
            }
            SYS_EXEC => self.sys_exec(proc, args[0] as usize),
            SYS_WAIT => Ok(match self.host() {
                Some(host) => host.wait(args[0] as i32 as isize) as i32,
                None => -1,
            }),
            SYS_CREATE => self.sys_create(proc, args[0] as usize, args[1] as usize),
            SYS_REMOVE => self.sys_remove(proc, args[0] as usize),
            SYS_OPEN => self.sys_open(proc, args[0] as usize),
            SYS_FILESIZE => Ok(match proc.fd_file(args[0] as i32) {
                Some(file) => file.length(&self.fs) as i32,
                None => -1,
            }),
            SYS_READ => self.sys_read(proc, args[0] as i32, args[1] as usize, args[2] as usize),
            SYS_WRITE => self.sys_write(proc, args[0] as i32, args[1] as usize, args[2] as usize),
            SYS_SEEK => Ok(match proc.fd_file(args[0] as i32) {
                Some(file) => {
                    file.seek(args[1] as usize);
                    0
                }
                None => -1,
            }),
            SYS_TELL => Ok(match proc.fd_file(args[0] as i32) {
                Some(file) => file.tell() as i32,
                None => -1,
            }),
            SYS_CLOSE => Ok(match proc.fd_take(args[0] as i32) {
                Some(file) => {
                    self.close_file(file);
                    0
                }
                None => -1,
            }),
            SYS_MMAP => self.sys_mmap(proc, args[0] as i32, args[1] as usize),
            SYS_MUNMAP => Ok(match self.vm.munmap(&self.fs, proc, args[0] as i32) {
                Ok(()) => 0,
                Err(()) => -1,
            }),
            SYS_CHDIR => self.sys_chdir(proc, args[0] as usize),
            SYS_MKDIR => self.sys_mkdir(proc, args[0] as usize),
            SYS_READDIR => self.sys_readdir(proc, args[0] as i32, args[1] as usize),
            SYS_ISDIR => Ok(match proc.fd_file(args[0] as i32) {
                Some(file) => file.is_dir(&self.fs) as i32,
                None => -1,
            }),
            SYS_INUMBER => Ok(match proc.fd_file(args[0] as i32) {
                Some(file) => file.inode.sector as i32,
                None => -1,
            }),
            _ => Ok(-1),
        }
    }

    fn sys_exec(&self, proc: &Arc<Proc>, cmdline: usize) -> SysResult {
        let mut buf = [0u8; MAXPATH + 1];
        let cmdline = match self.fetch_str(proc, cmdline, &mut buf)? {
            Some(s) => s,
            None => return Ok(-1),
        };
        Ok(match self.host() {
            Some(host) => host.exec(cmdline) as i32,
            None => -1,
        })
    }

    fn sys_create(&self, proc: &Arc<Proc>, path: usize, initial_size: usize) -> SysResult {
        let mut buf = [0u8; MAXPATH + 1];
        let path = match self.fetch_str(proc, path, &mut buf)? {
            Some(p) => p,
            None => return Ok(0),
        };
        Ok(self.fs.create(proc.cwd(), path, initial_size) as i32)
    }

    fn sys_remove(&self, proc: &Arc<Proc>, path: usize) -> SysResult {
        let mut buf = [0u8; MAXPATH + 1];
        let path = match self.fetch_str(proc, path, &mut buf)? {
            Some(p) => p,
            None => return Ok(0),
        };
        Ok(self.fs.remove(proc.cwd(), path) as i32)
    }

    fn sys_open(&self, proc: &Arc<Proc>, path: usize) -> SysResult {
        let mut buf = [0u8; MAXPATH + 1];
        let path = match self.fetch_str(proc, path, &mut buf)? {
            Some(p) => p,
            None => return Ok(-1),
        };
        let inode = match self.fs.open(proc.cwd(), path) {
            Some(ino) => ino,
            None => return Ok(-1),
        };
        let fd = self.alloc_fd();
        let file = Arc::new(File::new(inode));
        match proc.fd_install(fd, file) {
            Ok(()) => Ok(fd),
            Err(file) => {
                self.close_file(file);
                Ok(-1)
            }
        }
    }

    fn sys_read(&self, proc: &Arc<Proc>, fd: i32, buf: usize, size: usize) -> SysResult {
        if size == 0 {
            return Ok(0);
        }
        self.check_buffer(proc, buf, size, true)?;

        if fd == STDIN_FILENO {
            let mut staged = vec![0u8; size.min(IO_CHUNK)];
            let n = self.console_read(&mut staged);
            self.user_copy_out(proc, buf, &staged[..n])?;
            return Ok(n as i32);
        }
        let file = match proc.fd_file(fd) {
            Some(f) => f,
            None => return Ok(-1),
        };

        let mut total = 0;
        let mut staged = vec![0u8; size.min(IO_CHUNK)];
        while total < size {
            let want = (size - total).min(IO_CHUNK);
            let n = file.read(&self.fs, &mut staged[..want]);
            if n == 0 {
                break;
            }
            self.user_copy_out(proc, buf + total, &staged[..n])?;
            total += n;
        }
        Ok(total as i32)
    }

    fn sys_write(&self, proc: &Arc<Proc>, fd: i32, buf: usize, size: usize) -> SysResult {
        if size == 0 {
            return Ok(0);
        }
        self.check_buffer(proc, buf, size, false)?;

        if fd == STDOUT_FILENO || fd == STDERR_FILENO {
            let mut staged = vec![0u8; size.min(IO_CHUNK)];
            let mut total = 0;
            while total < size {
                let want = (size - total).min(IO_CHUNK);
                self.user_copy_in(proc, buf + total, &mut staged[..want])?;
                self.console_write(&staged[..want]);
                total += want;
            }
            return Ok(size as i32);
        }
        if fd == STDIN_FILENO {
            return Ok(-1);
        }
        let file = match proc.fd_file(fd) {
            Some(f) => f,
            None => return Ok(-1),
        };
        if file.is_dir(&self.fs) {
            return Ok(-1);
        }

        let mut total = 0;
        let mut staged = vec![0u8; size.min(IO_CHUNK)];
        while total < size {
            let want = (size - total).min(IO_CHUNK);
            self.user_copy_in(proc, buf + total, &mut staged[..want])?;
            let n = file.write(&self.fs, &staged[..want]);
            total += n;
            if n < want {
                break;
            }
        }
        Ok(total as i32)
    }

    fn sys_mmap(&self, proc: &Arc<Proc>, fd: i32, addr: usize) -> SysResult {
        if fd < 3 {
            return Ok(-1);
        }
        let file = match proc.fd_file(fd) {
            Some(f) => f,
            None => return Ok(-1),
        };
        if file.is_dir(&self.fs) {
            return Ok(-1);
        }
        let mapid = self.alloc_mapid();
        Ok(self
            .vm
            .mmap(&self.fs, proc, &file.inode, addr, mapid)
            .unwrap_or(-1))
    }

    fn sys_chdir(&self, proc: &Arc<Proc>, path: usize) -> SysResult {
        let mut buf = [0u8; MAXPATH + 1];
        let path = match self.fetch_str(proc, path, &mut buf)? {
            Some(p) => p,
            None => return Ok(0),
        };
        Ok(match self.fs.chdir(proc.cwd(), path) {
            Some(sector) => {
                *proc.cwd.lock() = sector;
                1
            }
            None => 0,
        })
    }

    fn sys_mkdir(&self, proc: &Arc<Proc>, path: usize) -> SysResult {
        let mut buf = [0u8; MAXPATH + 1];
        let path = match self.fetch_str(proc, path, &mut buf)? {
            Some(p) => p,
            None => return Ok(0),
        };
        Ok(self.fs.mkdir(proc.cwd(), path) as i32)
    }

    fn sys_readdir(&self, proc: &Arc<Proc>, fd: i32, name: usize) -> SysResult {
        self.check_buffer(proc, name, NAME_MAX + 1, true)?;
        let file = match proc.fd_file(fd) {
            Some(f) => f,
            None => return Ok(0),
        };
        if !file.is_dir(&self.fs) {
            return Ok(0);
        }

        let mut entry = [0u8; NAME_MAX + 1];
        let found = file.with_pos(|pos| self.fs.dir_readdir(&file.inode, pos, &mut entry));
        if !found {
            return Ok(0);
        }
        self.user_copy_out(proc, name, &entry)?;
        Ok(1)
    }

    /// Terminates the process for a bad user access.
    fn kill(&self, proc: &Arc<Proc>) -> SysResult {
        self.proc_exit(proc, -1);
        Err(Killed)
    }

    /// A 32-bit word from user memory; kills the process on a bad pointer.
    fn fetch_word(&self, proc: &Arc<Proc>, uva: usize) -> Result<u32, Killed> {
        let mut bytes = [0u8; 4];
        match self.vm.copy_from_user(&self.fs, proc, uva, &mut bytes) {
            Ok(()) => Ok(u32::from_le_bytes(bytes)),
            Err(_) => Err(self.kill(proc).unwrap_err()),
        }
    }

    /// A NUL-terminated user string. Bad pointers kill the process; an
    /// over-long string is the caller's error (`None`).
    fn fetch_str<'a>(
        &self,
        proc: &Arc<Proc>,
        uva: usize,
        buf: &'a mut [u8; MAXPATH + 1],
    ) -> Result<Option<&'a [u8]>, Killed> {
        match self.vm.copy_in_str(&self.fs, proc, uva, buf) {
            Ok(s) => Ok(Some(s.to_bytes())),
            Err(UserError::TooLong) => Ok(None),
            Err(UserError::Fault) => Err(self.kill(proc).unwrap_err()),
        }
    }

    /// Probes the first and last byte of a user buffer; `writable` also
    /// verifies stores are allowed.
    fn check_buffer(
        &self,
        proc: &Arc<Proc>,
        uva: usize,
        len: usize,
        writable: bool,
    ) -> Result<(), Killed> {
        let last = uva
            .checked_add(len - 1)
            .ok_or_else(|| self.kill(proc).unwrap_err())?;
        for addr in [uva, last] {
            let probe = if writable {
                self.vm
                    .read_user_byte(&self.fs, proc, addr)
                    .and_then(|b| self.vm.write_user_byte(&self.fs, proc, addr, b))
            } else {
                self.vm.read_user_byte(&self.fs, proc, addr).map(|_| ())
            };
            if probe.is_err() {
                return Err(self.kill(proc).unwrap_err());
            }
        }
        Ok(())
    }

    fn user_copy_out(&self, proc: &Arc<Proc>, uva: usize, bytes: &[u8]) -> Result<(), Killed> {
        self.vm
            .copy_to_user(&self.fs, proc, uva, bytes)
            .map_err(|_| self.kill(proc).unwrap_err())
    }

    fn user_copy_in(&self, proc: &Arc<Proc>, uva: usize, bytes: &mut [u8]) -> Result<(), Killed> {
        self.vm
            .copy_from_user(&self.fs, proc, uva, bytes)
            .map_err(|_| self.kill(proc).unwrap_err())
    }
}

/// Argument words each call reads from the user stack.
fn arg_count(num: u32) -> usize {
    match num {
        SYS_HALT => 0,
        SYS_READ | SYS_WRITE => 3,
        SYS_CREATE | SYS_SEEK | SYS_MMAP | SYS_READDIR => 2,
        _ => 1,
    }
}
