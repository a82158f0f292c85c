// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::{
    fd_table::Direction,
    hook,
    reactor::IoScheduler,
    runtime::{
        self,
        fail::Fail,
    },
};
use ::socket2::SockAddr;
use ::std::{
    fmt,
    mem::{
        self,
        MaybeUninit,
    },
    net::SocketAddr,
    os::fd::RawFd,
    path::Path,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Mutex,
    },
};

//======================================================================================================================
// Structures
//======================================================================================================================

/// A thin, failure-reporting wrapper around a socket fd.
///
/// Every I/O method goes through the hooked syscalls, so the API looks
/// blocking to the caller while cooperative suspension happens underneath.
/// IPv4, IPv6 and unix-domain endpoints are all carried by
/// [socket2::SockAddr].
pub struct Socket {
    fd: RawFd,
    domain: libc::c_int,
    ty: libc::c_int,
    protocol: libc::c_int,
    /// Bound local address, refreshed after bind/connect.
    local: Mutex<Option<SockAddr>>,
    /// Peer address, remembered from connect/accept.
    peer: Mutex<Option<SockAddr>>,
    connected: AtomicBool,
    closed: AtomicBool,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl Socket {
    /// Creates a socket of the given family/type/protocol through the hooked
    /// `socket`, which also registers it with the fd registry.
    pub fn new(domain: libc::c_int, ty: libc::c_int, protocol: libc::c_int) -> Result<Self, Fail> {
        let fd: RawFd = hook::socket(domain, ty, protocol);
        if fd < 0 {
            let cause: String = format!("failed to create socket (domain={:?}, type={:?})", domain, ty);
            error!("new(): {}", cause);
            return Err(Fail::last_os_error(&cause));
        }
        Ok(Self {
            fd,
            domain,
            ty,
            protocol,
            local: Mutex::new(None),
            peer: Mutex::new(None),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn tcp_v4() -> Result<Self, Fail> {
        Self::new(libc::AF_INET, libc::SOCK_STREAM, 0)
    }

    pub fn tcp_v6() -> Result<Self, Fail> {
        Self::new(libc::AF_INET6, libc::SOCK_STREAM, 0)
    }

    pub fn udp_v4() -> Result<Self, Fail> {
        Self::new(libc::AF_INET, libc::SOCK_DGRAM, 0)
    }

    pub fn udp_v6() -> Result<Self, Fail> {
        Self::new(libc::AF_INET6, libc::SOCK_DGRAM, 0)
    }

    pub fn unix_stream() -> Result<Self, Fail> {
        Self::new(libc::AF_UNIX, libc::SOCK_STREAM, 0)
    }

    /// Creates a TCP socket matching the family of `addr`.
    pub fn tcp_for(addr: &SockAddr) -> Result<Self, Fail> {
        Self::new(addr.domain().into(), libc::SOCK_STREAM, 0)
    }

    /// Wraps an fd accepted from a listener.
    fn from_accepted(fd: RawFd, template: &Socket, peer: SockAddr) -> Self {
        Self {
            fd,
            domain: template.domain,
            ty: template.ty,
            protocol: template.protocol,
            local: Mutex::new(None),
            peer: Mutex::new(Some(peer)),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn domain(&self) -> libc::c_int {
        self.domain
    }

    pub fn socket_type(&self) -> libc::c_int {
        self.ty
    }

    pub fn protocol(&self) -> libc::c_int {
        self.protocol
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Binds the socket to `addr`. Stream sockets get `SO_REUSEADDR` first.
    pub fn bind(&self, addr: &SockAddr) -> Result<(), Fail> {
        if self.ty == libc::SOCK_STREAM && self.domain != libc::AF_UNIX {
            let one: libc::c_int = 1;
            if unsafe {
                libc::setsockopt(
                    self.fd,
                    libc::SOL_SOCKET,
                    libc::SO_REUSEADDR,
                    &one as *const libc::c_int as *const libc::c_void,
                    mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            } != 0
            {
                let cause: String = format!("cannot set SO_REUSEADDR on fd {:?}", self.fd);
                error!("bind(): {}", cause);
                return Err(Fail::last_os_error(&cause));
            }
        }
        if unsafe { libc::bind(self.fd, addr.as_ptr() as *const libc::sockaddr, addr.len()) } != 0 {
            let cause: String = format!("failed to bind fd {:?} to {:?}", self.fd, addr);
            error!("bind(): {}", cause);
            return Err(Fail::last_os_error(&cause));
        }
        self.refresh_local_addr();
        Ok(())
    }

    /// Binds to an IP endpoint.
    pub fn bind_addr(&self, addr: SocketAddr) -> Result<(), Fail> {
        self.bind(&SockAddr::from(addr))
    }

    /// Binds a unix-domain socket to a filesystem path.
    pub fn bind_unix<P: AsRef<Path>>(&self, path: P) -> Result<(), Fail> {
        let addr: SockAddr = SockAddr::unix(path)?;
        self.bind(&addr)
    }

    pub fn listen(&self, backlog: libc::c_int) -> Result<(), Fail> {
        if unsafe { libc::listen(self.fd, backlog) } != 0 {
            let cause: String = format!("failed to listen on fd {:?}", self.fd);
            error!("listen(): {}", cause);
            return Err(Fail::last_os_error(&cause));
        }
        Ok(())
    }

    /// Accepts a connection; suspends the calling coroutine until one
    /// arrives (or the listener's read timeout expires).
    pub fn accept(&self) -> Result<Socket, Fail> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n: isize = hook::accept(self.fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len);
        if n < 0 {
            let cause: String = format!("failed to accept on fd {:?}", self.fd);
            return Err(Fail::last_os_error(&cause));
        }
        let peer: SockAddr = unsafe { SockAddr::new(storage.assume_init(), len) };
        trace!("accept(): fd {:?} accepted {:?} from {:?}", self.fd, n, peer);
        Ok(Socket::from_accepted(n as RawFd, self, peer))
    }

    /// Connects to `addr`. `timeout_ms` of `None` selects the fd's
    /// `SO_SNDTIMEO` bookkeeping or the configured default; an explicit zero
    /// means "do not wait" (the raw non-blocking call, as-is).
    pub fn connect(&self, addr: &SockAddr, timeout_ms: Option<u64>) -> Result<(), Fail> {
        let rc: libc::c_int = match timeout_ms {
            Some(ms) => {
                hook::connect_with_timeout(self.fd, addr.as_ptr() as *const libc::sockaddr, addr.len(), ms)
            },
            None => hook::connect(self.fd, addr.as_ptr() as *const libc::sockaddr, addr.len()),
        };
        if rc != 0 {
            let cause: String = format!("failed to connect fd {:?} to {:?}", self.fd, addr);
            return Err(Fail::last_os_error(&cause));
        }
        self.connected.store(true, Ordering::Release);
        *self.peer.lock().unwrap() = Some(addr.clone());
        self.refresh_local_addr();
        Ok(())
    }

    /// Connects to an IP endpoint.
    pub fn connect_addr(&self, addr: SocketAddr, timeout_ms: Option<u64>) -> Result<(), Fail> {
        self.connect(&SockAddr::from(addr), timeout_ms)
    }

    /// Connects a unix-domain socket to a filesystem path.
    pub fn connect_unix<P: AsRef<Path>>(&self, path: P, timeout_ms: Option<u64>) -> Result<(), Fail> {
        let addr: SockAddr = SockAddr::unix(path)?;
        self.connect(&addr, timeout_ms)
    }

    /// Receives into `buf`; forwards to the scatter-gather variant with a
    /// one-element iovec. Returns the byte count (zero at EOF).
    pub fn recv(&self, buf: &mut [u8]) -> Result<usize, Fail> {
        let iov: [libc::iovec; 1] = [libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        }];
        self.recv_iovec(&iov)
    }

    /// Scatter-gather receive. The iovec entries must point at writable
    /// memory owned by the caller (byte-array views qualify).
    pub fn recv_iovec(&self, iov: &[libc::iovec]) -> Result<usize, Fail> {
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iov.len() as _;
        let n: isize = hook::recvmsg(self.fd, &mut msg, 0);
        if n < 0 {
            let cause: String = format!("failed to receive on fd {:?}", self.fd);
            return Err(Fail::last_os_error(&cause));
        }
        Ok(n as usize)
    }

    /// Sends `buf`; forwards to the scatter-gather variant with a
    /// one-element iovec. Returns the byte count actually queued.
    pub fn send(&self, buf: &[u8]) -> Result<usize, Fail> {
        let iov: [libc::iovec; 1] = [libc::iovec {
            iov_base: buf.as_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        }];
        self.send_iovec(&iov)
    }

    /// Scatter-gather send.
    pub fn send_iovec(&self, iov: &[libc::iovec]) -> Result<usize, Fail> {
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iov.len() as _;
        let n: isize = hook::sendmsg(self.fd, &msg, 0);
        if n < 0 {
            let cause: String = format!("failed to send on fd {:?}", self.fd);
            return Err(Fail::last_os_error(&cause));
        }
        Ok(n as usize)
    }

    /// Sends every byte of `buf`, looping over short writes. EOF-style
    /// failures surface through the underlying error.
    pub fn send_all(&self, buf: &[u8]) -> Result<(), Fail> {
        let mut sent: usize = 0;
        while sent < buf.len() {
            sent += self.send(&buf[sent..])?;
        }
        Ok(())
    }

    /// Datagram send to an explicit destination.
    pub fn send_to(&self, buf: &[u8], addr: &SockAddr) -> Result<usize, Fail> {
        let n: isize = hook::sendto(self.fd, buf, 0, addr.as_ptr() as *const libc::sockaddr, addr.len());
        if n < 0 {
            let cause: String = format!("failed to send on fd {:?} to {:?}", self.fd, addr);
            return Err(Fail::last_os_error(&cause));
        }
        Ok(n as usize)
    }

    /// Datagram receive reporting the source address.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SockAddr), Fail> {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let n: isize = hook::recvfrom(
            self.fd,
            buf,
            0,
            storage.as_mut_ptr() as *mut libc::sockaddr,
            &mut len,
        );
        if n < 0 {
            let cause: String = format!("failed to receive on fd {:?}", self.fd);
            return Err(Fail::last_os_error(&cause));
        }
        let addr: SockAddr = unsafe { SockAddr::new(storage.assume_init(), len) };
        Ok((n as usize, addr))
    }

    /// Installs the per-direction read timeout consumed by the hooks.
    pub fn set_read_timeout(&self, timeout_ms: u64) {
        let _ = hook::set_timeout(self.fd, Direction::Read, timeout_ms);
    }

    /// Installs the per-direction write timeout consumed by the hooks.
    pub fn set_write_timeout(&self, timeout_ms: u64) {
        let _ = hook::set_timeout(self.fd, Direction::Write, timeout_ms);
    }

    /// The locally-bound address, when known.
    pub fn local_addr(&self) -> Option<SockAddr> {
        self.local.lock().unwrap().clone()
    }

    /// The peer address, when connected/accepted.
    pub fn peer_addr(&self) -> Option<SockAddr> {
        self.peer.lock().unwrap().clone()
    }

    /// Wakes any continuation still parked on this socket in `reactor`; used
    /// by listener teardown so accept loops observe the shutdown.
    pub fn cancel_pending(&self, reactor: &IoScheduler) -> bool {
        reactor.remove_and_fire_all(self.fd)
    }

    /// Closes the socket through the hooked close. Idempotent.
    pub fn close(&self) -> Result<(), Fail> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if hook::close(self.fd) != 0 {
            let cause: String = format!("failed to close fd {:?}", self.fd);
            warn!("close(): {}", cause);
            return Err(Fail::last_os_error(&cause));
        }
        Ok(())
    }

    /// Re-reads the kernel's view of our local address (captures the
    /// ephemeral port after binding to port zero).
    fn refresh_local_addr(&self) {
        let mut storage: MaybeUninit<libc::sockaddr_storage> = MaybeUninit::zeroed();
        let mut len: libc::socklen_t = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        if unsafe { libc::getsockname(self.fd, storage.as_mut_ptr() as *mut libc::sockaddr, &mut len) } == 0 {
            let addr: SockAddr = unsafe { SockAddr::new(storage.assume_init(), len) };
            *self.local.lock().unwrap() = Some(addr);
        } else {
            warn!(
                "refresh_local_addr(): getsockname failed on fd {:?} (errno={:?})",
                self.fd,
                runtime::errno()
            );
        }
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

impl fmt::Display for Socket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Socket[fd={}, domain={}, type={}, local={:?}, peer={:?}, connected={}]",
            self.fd,
            self.domain,
            self.ty,
            self.local.lock().unwrap().as_ref().and_then(|a| a.as_socket()),
            self.peer.lock().unwrap().as_ref().and_then(|a| a.as_socket()),
            self.is_connected(),
        )
    }
}
