// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::limits;
use ::std::{
    cmp,
    mem::MaybeUninit,
    os::fd::RawFd,
    sync::{
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
        Arc,
        OnceLock,
        RwLock,
    },
};

//======================================================================================================================
// Static Variables
//======================================================================================================================

/// Process-wide registry of hooked file descriptors. The hook layer mirrors
/// a syscall surface of free functions, so its fd bookkeeping is a process
/// singleton with interior synchronization.
static FD_TABLE: OnceLock<FdTable> = OnceLock::new();

//======================================================================================================================
// Structures
//======================================================================================================================

/// The I/O direction a timeout applies to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    Read,
    Write,
}

/// Bookkeeping the hooked syscalls keep per file descriptor.
///
/// Sockets are unconditionally switched to non-blocking at the system level
/// on first observation; `user_nonblock` remembers what the application
/// asked for, so flag queries keep reporting what the user expects.
pub struct FdInfo {
    fd: RawFd,
    /// Is this fd a socket? Non-sockets pass through the hooks untouched.
    is_socket: bool,
    /// Did the runtime put the fd into `O_NONBLOCK`?
    sys_nonblock: bool,
    /// Did the application itself request `O_NONBLOCK`?
    user_nonblock: AtomicBool,
    /// Set by the hooked close; later calls on the fd fail with `EBADF`.
    closed: AtomicBool,
    /// Read timeout (ms); sentinel means none.
    read_timeout_ms: AtomicU64,
    /// Write timeout (ms); sentinel means none.
    write_timeout_ms: AtomicU64,
}

/// Registry of [FdInfo] entries, indexed by fd.
pub struct FdTable {
    slots: RwLock<Vec<Option<Arc<FdInfo>>>>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl FdInfo {
    /// Inspects `fd` and builds its bookkeeping entry. Sockets are flipped
    /// to system-level non-blocking here.
    fn new(fd: RawFd) -> Self {
        let mut stat: MaybeUninit<libc::stat> = MaybeUninit::uninit();
        let is_socket: bool = match unsafe { libc::fstat(fd, stat.as_mut_ptr()) } {
            0 => {
                let mode: libc::mode_t = unsafe { stat.assume_init() }.st_mode;
                (mode & libc::S_IFMT) == libc::S_IFSOCK
            },
            _ => false,
        };

        let mut sys_nonblock: bool = false;
        if is_socket {
            let flags: libc::c_int = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && (flags & libc::O_NONBLOCK) == 0 {
                unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
            }
            sys_nonblock = true;
        }

        Self {
            fd,
            is_socket,
            sys_nonblock,
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_timeout_ms: AtomicU64::new(limits::TIMEOUT_INFINITE),
            write_timeout_ms: AtomicU64::new(limits::TIMEOUT_INFINITE),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    pub fn is_sys_nonblock(&self) -> bool {
        self.sys_nonblock
    }

    pub fn is_user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    pub fn set_user_nonblock(&self, value: bool) {
        self.user_nonblock.store(value, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Timeout for `direction` in ms; the sentinel means none.
    pub fn timeout_ms(&self, direction: Direction) -> u64 {
        match direction {
            Direction::Read => self.read_timeout_ms.load(Ordering::Acquire),
            Direction::Write => self.write_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout_ms(&self, direction: Direction, timeout_ms: u64) {
        match direction {
            Direction::Read => self.read_timeout_ms.store(timeout_ms, Ordering::Release),
            Direction::Write => self.write_timeout_ms.store(timeout_ms, Ordering::Release),
        }
    }
}

impl FdTable {
    fn new() -> Self {
        let mut slots: Vec<Option<Arc<FdInfo>>> = Vec::new();
        slots.resize_with(limits::INITIAL_FD_INFOS, || None);
        Self {
            slots: RwLock::new(slots),
        }
    }

    /// Looks up the entry for `fd`, creating it when `auto_create` is set.
    /// Concurrent creations coalesce under the writer lock.
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdInfo>> {
        if fd < 0 {
            return None;
        }
        {
            let slots = self.slots.read().unwrap();
            match slots.get(fd as usize) {
                Some(Some(info)) => return Some(info.clone()),
                Some(None) | None if !auto_create => return None,
                _ => (),
            }
        }

        let mut slots = self.slots.write().unwrap();
        if slots.len() <= fd as usize {
            let new_len: usize = cmp::max((fd as usize + 1) * 3 / 2, limits::INITIAL_FD_INFOS);
            slots.resize_with(new_len, || None);
        }
        // Re-check: another creator may have filled the slot meanwhile.
        if let Some(info) = &slots[fd as usize] {
            return Some(info.clone());
        }
        let info: Arc<FdInfo> = Arc::new(FdInfo::new(fd));
        slots[fd as usize] = Some(info.clone());
        Some(info)
    }

    /// Evicts the entry for `fd`. The vector never shrinks.
    pub fn remove(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut slots = self.slots.write().unwrap();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = None;
        }
    }
}

//======================================================================================================================
// Standalone Functions
//======================================================================================================================

/// The process-wide fd registry.
pub fn fd_table() -> &'static FdTable {
    FD_TABLE.get_or_init(FdTable::new)
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================

#[cfg(test)]
mod tests {
    use super::{
        Direction,
        FdTable,
    };
    use crate::runtime::limits;
    use ::anyhow::Result;
    use ::std::{
        os::fd::RawFd,
        sync::Arc,
    };

    fn make_socket() -> RawFd {
        unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) }
    }

    #[test]
    fn test_socket_forced_nonblocking() -> Result<()> {
        let table: FdTable = FdTable::new();
        let fd: RawFd = make_socket();
        crate::ensure!(fd >= 0);

        let info = table.get(fd, true).expect("auto-create");
        crate::ensure!(info.is_socket());
        crate::ensure!(info.is_sys_nonblock());
        crate::ensure!(!info.is_user_nonblock());
        let flags: libc::c_int = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        crate::ensure!(flags & libc::O_NONBLOCK != 0);

        unsafe { libc::close(fd) };
        Ok(())
    }

    #[test]
    fn test_lookup_without_create() -> Result<()> {
        let table: FdTable = FdTable::new();
        crate::ensure!(table.get(12345, false).is_none());
        crate::ensure!(table.get(-1, true).is_none());
        Ok(())
    }

    #[test]
    fn test_growth_and_eviction() -> Result<()> {
        let table: FdTable = FdTable::new();
        let fd: RawFd = make_socket();
        crate::ensure!(fd >= 0);
        // Push the table past its initial capacity.
        let high_fd: RawFd = unsafe { libc::dup2(fd, (limits::INITIAL_FD_INFOS * 2) as RawFd) };
        crate::ensure!(high_fd >= 0);

        let info = table.get(high_fd, true).expect("auto-create after growth");
        crate::ensure_eq!(info.fd(), high_fd);
        let again = table.get(high_fd, true).expect("existing entry");
        crate::ensure!(Arc::ptr_eq(&info, &again));

        table.remove(high_fd);
        crate::ensure!(table.get(high_fd, false).is_none());

        unsafe {
            libc::close(high_fd);
            libc::close(fd);
        }
        Ok(())
    }

    #[test]
    fn test_timeout_bookkeeping() -> Result<()> {
        let table: FdTable = FdTable::new();
        let fd: RawFd = make_socket();
        crate::ensure!(fd >= 0);

        let info = table.get(fd, true).expect("auto-create");
        crate::ensure_eq!(info.timeout_ms(Direction::Read), limits::TIMEOUT_INFINITE);
        info.set_timeout_ms(Direction::Read, 250);
        info.set_timeout_ms(Direction::Write, 500);
        crate::ensure_eq!(info.timeout_ms(Direction::Read), 250);
        crate::ensure_eq!(info.timeout_ms(Direction::Write), 500);

        unsafe { libc::close(fd) };
        Ok(())
    }
}
