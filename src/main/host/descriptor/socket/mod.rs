//! The domain-independent socket layer.
//!
//! Each `(domain, type)` pair is served by a [`SocketOps`] backend, resolved once when the socket
//! is created and kept for the socket's lifetime. The functions in this module implement the
//! socket state machine and the parts of the socket API that don't depend on the backend, and
//! dispatch the rest.

use std::collections::HashMap;
use std::io::{IoSlice, IoSliceMut};
use std::sync::Arc;

use libc::c_int;
use libos_pal::{PalStream, Platform};
use log::*;
use nix::errno::Errno;
use nix::sys::time::TimeVal;
use once_cell::sync::{Lazy, OnceCell};
use static_assertions::assert_eq_size;

use super::fs::Filesystem;
use super::handle::{Handle, HandleInfo, HandleRef};
use super::{DescriptorFlags, FileStatus};
use crate::utility::ranked_lock::{LockRank, RankedMutex, RankedMutexGuard};
use crate::utility::sockaddr::SockaddrStorage;

pub mod unix;
pub mod unix_name;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SocketState {
    New,
    Bound,
    Listening,
    Connected,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Dgram,
}

impl SocketType {
    pub fn as_raw(&self) -> c_int {
        match self {
            Self::Stream => libc::SOCK_STREAM,
            Self::Dgram => libc::SOCK_DGRAM,
        }
    }
}

impl TryFrom<c_int> for SocketType {
    type Error = SocketTypeConversionError;
    fn try_from(val: c_int) -> Result<Self, Self::Error> {
        match val {
            libc::SOCK_STREAM => Ok(Self::Stream),
            libc::SOCK_DGRAM => Ok(Self::Dgram),
            x => Err(SocketTypeConversionError(x)),
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SocketTypeConversionError(c_int);

impl std::error::Error for SocketTypeConversionError {}

impl std::fmt::Display for SocketTypeConversionError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Invalid socket type {}; only SOCK_STREAM and SOCK_DGRAM are known",
            self.0
        )
    }
}

bitflags::bitflags! {
    /// Flags to represent if a socket has been shut down for reading and/or writing. An empty set
    /// of flags implies that the socket *has not* been shut down for reading or writing.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ShutdownFlags: u8 {
        const READ = 0b00000001;
        const WRITE = 0b00000010;
    }
}

impl ShutdownFlags {
    /// The flags for a `shutdown()` `how` argument.
    pub fn from_how(how: c_int) -> Result<Self, Errno> {
        match how {
            libc::SHUT_RD => Ok(Self::READ),
            libc::SHUT_WR => Ok(Self::WRITE),
            libc::SHUT_RDWR => Ok(Self::READ | Self::WRITE),
            _ => Err(Errno::EINVAL),
        }
    }
}

/// Socket fields protected by the socket lock.
#[derive(Debug)]
pub struct SocketCommon {
    pub state: SocketState,
    pub local_addr: SockaddrStorage,
    pub remote_addr: SockaddrStorage,
    /// Reported and cleared by `SO_ERROR`.
    pub last_error: Option<Errno>,
    pub send_timeout_us: u64,
    pub receive_timeout_us: u64,
    pub was_bound: bool,
    pub shutdown: ShutdownFlags,
}

impl SocketCommon {
    fn new(state: SocketState) -> Self {
        Self {
            state,
            local_addr: SockaddrStorage::empty(),
            remote_addr: SockaddrStorage::empty(),
            last_error: None,
            send_timeout_us: 0,
            receive_timeout_us: 0,
            was_bound: false,
            shutdown: ShutdownFlags::empty(),
        }
    }
}

/// The payload of a socket handle.
pub struct SocketInfo {
    ops: &'static dyn SocketOps,
    domain: c_int,
    sock_type: SocketType,
    protocol: c_int,
    platform: Arc<dyn Platform>,
    /// Set at most once, by a successful bind, connect, or accept.
    stream: OnceCell<Box<dyn PalStream>>,
    common: RankedMutex<SocketCommon>,
    /// Data read ahead by `MSG_PEEK`. The lock also orders concurrent receives.
    peek: RankedMutex<Vec<u8>>,
}

impl SocketInfo {
    pub fn new(
        ops: &'static dyn SocketOps,
        domain: c_int,
        sock_type: SocketType,
        protocol: c_int,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self::with_state(ops, domain, sock_type, protocol, platform, SocketState::New)
    }

    fn with_state(
        ops: &'static dyn SocketOps,
        domain: c_int,
        sock_type: SocketType,
        protocol: c_int,
        platform: Arc<dyn Platform>,
        state: SocketState,
    ) -> Self {
        Self {
            ops,
            domain,
            sock_type,
            protocol,
            platform,
            stream: OnceCell::new(),
            common: RankedMutex::new(LockRank::Socket, SocketCommon::new(state)),
            peek: RankedMutex::new(LockRank::Receive, Vec::new()),
        }
    }

    /// A connected socket with the same backend, domain, type, protocol, and platform, for a
    /// connection accepted on this socket.
    pub fn new_accepted(
        &self,
        stream: Box<dyn PalStream>,
        local_addr: SockaddrStorage,
        remote_addr: SockaddrStorage,
    ) -> Self {
        let mut child = Self::with_state(
            self.ops,
            self.domain,
            self.sock_type,
            self.protocol,
            Arc::clone(&self.platform),
            SocketState::Connected,
        );
        child.install_stream(stream);
        let common = child.common.get_mut();
        common.local_addr = local_addr;
        common.remote_addr = remote_addr;
        child
    }

    pub fn ops(&self) -> &'static dyn SocketOps {
        self.ops
    }

    pub fn domain(&self) -> c_int {
        self.domain
    }

    pub fn sock_type(&self) -> SocketType {
        self.sock_type
    }

    pub fn protocol(&self) -> c_int {
        self.protocol
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// The platform stream, once the socket has one. Doesn't take the socket lock.
    pub fn stream(&self) -> Option<&dyn PalStream> {
        self.stream.get().map(|s| s.as_ref())
    }

    /// Install the platform stream. Panics if the socket already has one.
    pub fn install_stream(&self, stream: Box<dyn PalStream>) {
        if self.stream.set(stream).is_err() {
            panic!("Socket platform stream installed twice");
        }
    }

    pub fn lock(&self) -> RankedMutexGuard<'_, SocketCommon> {
        self.common.lock()
    }

    fn lock_receive(&self) -> RankedMutexGuard<'_, Vec<u8>> {
        self.peek.lock()
    }
}

impl std::fmt::Debug for SocketInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketInfo")
            .field("ops", &self.ops.name())
            .field("domain", &self.domain)
            .field("sock_type", &self.sock_type)
            .field("protocol", &self.protocol)
            .field("stream", &self.stream.get())
            .finish_non_exhaustive()
    }
}

/// The operations a socket backend provides.
///
/// `bind`, `listen`, `connect`, and `disconnect` are called with the socket lock held; the locked
/// state is passed in. The caller has already checked that the state allows the call and
/// updates the state after it succeeds.
pub trait SocketOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// Validate the type and protocol of a new socket.
    fn create(&self, sock_type: SocketType, protocol: c_int) -> Result<(), Errno>;

    fn bind(&self, handle: &Handle, common: &mut SocketCommon, addr: &[u8]) -> Result<(), Errno>;

    fn listen(
        &self,
        handle: &Handle,
        common: &mut SocketCommon,
        backlog: c_int,
    ) -> Result<(), Errno>;

    /// Wait for and accept a connection, returning the new connected socket handle. The socket
    /// lock is not held.
    fn accept(&self, handle: &Handle, nonblocking: bool) -> Result<HandleRef, Errno>;

    fn connect(
        &self,
        handle: &Handle,
        common: &mut SocketCommon,
        addr: &[u8],
    ) -> Result<(), Errno>;

    fn disconnect(&self, handle: &Handle, common: &mut SocketCommon) -> Result<(), Errno>;

    /// Options not handled at the `SOL_SOCKET` level. Returns the option length.
    fn get_option(
        &self,
        handle: &Handle,
        level: c_int,
        name: c_int,
        optval: &mut [u8],
    ) -> Result<usize, Errno>;

    fn set_option(
        &self,
        handle: &Handle,
        level: c_int,
        name: c_int,
        optval: &[u8],
    ) -> Result<(), Errno>;

    fn send(&self, handle: &Handle, bufs: &[IoSlice<'_>]) -> Result<usize, Errno>;

    fn receive(
        &self,
        handle: &Handle,
        bufs: &mut [IoSliceMut<'_>],
        nonblocking: bool,
    ) -> Result<usize, Errno>;
}

static SOCKET_OPS: Lazy<HashMap<(c_int, SocketType), &'static dyn SocketOps>> = Lazy::new(|| {
    let mut ops: HashMap<(c_int, SocketType), &'static dyn SocketOps> = HashMap::new();
    ops.insert((libc::AF_UNIX, SocketType::Stream), &unix::UNIX_SOCKET_OPS);
    // registered so that the backend reports the unsupported type itself
    ops.insert((libc::AF_UNIX, SocketType::Dgram), &unix::UNIX_SOCKET_OPS);
    ops
});

/// The backend for `(domain, sock_type)`.
pub fn lookup_ops(domain: c_int, sock_type: SocketType) -> Result<&'static dyn SocketOps, Errno> {
    if let Some(ops) = SOCKET_OPS.get(&(domain, sock_type)) {
        return Ok(*ops);
    }

    if SOCKET_OPS.keys().any(|(d, _)| *d == domain) {
        Err(Errno::ESOCKTNOSUPPORT)
    } else {
        Err(Errno::EAFNOSUPPORT)
    }
}

/// Socket handles read and write through the socket backend.
#[derive(Debug, Default)]
pub struct SocketFs;

impl Filesystem for SocketFs {
    fn name(&self) -> &str {
        "socket"
    }

    fn seekable(&self) -> bool {
        false
    }

    fn read(&self, handle: &Handle, buf: &mut [u8], _pos: &mut u64) -> Result<usize, Errno> {
        recv(handle, &mut [IoSliceMut::new(buf)], 0)
    }

    fn write(&self, handle: &Handle, buf: &[u8], _pos: &mut u64) -> Result<usize, Errno> {
        send(handle, &[IoSlice::new(buf)], 0)
    }
}

static SOCKET_FS: Lazy<Arc<dyn Filesystem>> = Lazy::new(|| Arc::new(SocketFs));

/// Build a socket handle around `info`.
pub(crate) fn new_socket_handle(info: SocketInfo, nonblocking: bool) -> HandleRef {
    let status = if nonblocking {
        FileStatus::NONBLOCK
    } else {
        FileStatus::empty()
    };
    Handle::allocate(HandleInfo::Socket(info))
        .status(status)
        .fs(Arc::clone(&SOCKET_FS))
        .build()
}

/// Split `SOCK_NONBLOCK`/`SOCK_CLOEXEC` from a type argument.
fn split_type_flags(type_and_flags: c_int) -> (c_int, bool, DescriptorFlags) {
    let nonblocking = type_and_flags & libc::SOCK_NONBLOCK != 0;
    let flags = if type_and_flags & libc::SOCK_CLOEXEC != 0 {
        DescriptorFlags::CLOEXEC
    } else {
        DescriptorFlags::empty()
    };
    let sock_type = type_and_flags & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC);
    (sock_type, nonblocking, flags)
}

/// `socket()`: create a new socket handle. Returns the handle and the flags for its descriptor.
pub fn socket(
    platform: &Arc<dyn Platform>,
    domain: c_int,
    type_and_flags: c_int,
    protocol: c_int,
) -> Result<(HandleRef, DescriptorFlags), Errno> {
    let (sock_type, nonblocking, fd_flags) = split_type_flags(type_and_flags);

    let sock_type = SocketType::try_from(sock_type).map_err(|e| {
        debug!("{}", e);
        Errno::ESOCKTNOSUPPORT
    })?;
    let ops = lookup_ops(domain, sock_type)?;
    ops.create(sock_type, protocol)?;

    let info = SocketInfo::new(ops, domain, sock_type, protocol, Arc::clone(platform));
    let handle = new_socket_handle(info, nonblocking);
    debug!("Created {} socket {:?}", ops.name(), handle);
    Ok((handle, fd_flags))
}

/// `bind()`. Only a new socket can be bound.
pub fn bind(handle: &Handle, addr: &[u8]) -> Result<(), Errno> {
    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;
    let mut common = sock.lock();

    if common.state != SocketState::New {
        debug!("Can't bind a socket in state {:?}", common.state);
        return Err(Errno::EINVAL);
    }

    sock.ops().bind(handle, &mut common, addr)?;
    common.state = SocketState::Bound;
    common.was_bound = true;
    debug!("Bound socket to {}", common.local_addr);
    Ok(())
}

/// `listen()`. The socket must be bound (or already listening).
pub fn listen(handle: &Handle, backlog: c_int) -> Result<(), Errno> {
    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;
    let mut common = sock.lock();

    if !matches!(common.state, SocketState::Bound | SocketState::Listening) {
        return Err(Errno::EINVAL);
    }

    sock.ops().listen(handle, &mut common, backlog)?;
    common.state = SocketState::Listening;
    Ok(())
}

/// `accept4()`. Returns the connected socket and the flags for its descriptor.
pub fn accept(handle: &Handle, flags: c_int) -> Result<(HandleRef, DescriptorFlags), Errno> {
    if flags & !(libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) != 0 {
        return Err(Errno::EINVAL);
    }
    let (_, nonblocking, fd_flags) = split_type_flags(flags);

    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;
    if sock.lock().state != SocketState::Listening {
        return Err(Errno::EINVAL);
    }

    // may block, so the socket lock must not be held
    let child = sock.ops().accept(handle, nonblocking).map_err(|e| {
        record_error(handle, e, true);
        e
    })?;

    // the backlog shrank
    handle.interrupt_epolls();
    debug!("Accepted connection {:?}", child);
    Ok((child, fd_flags))
}

/// `connect()`. A listening socket can't connect; the backend decides for other states.
pub fn connect(handle: &Handle, addr: &[u8]) -> Result<(), Errno> {
    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;
    let mut common = sock.lock();

    if common.state == SocketState::Listening {
        return Err(Errno::EINVAL);
    }

    sock.ops().connect(handle, &mut common, addr)?;
    common.state = SocketState::Connected;
    debug!("Connected socket to {}", common.remote_addr);
    Ok(())
}

pub fn disconnect(handle: &Handle) -> Result<(), Errno> {
    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;
    let mut common = sock.lock();
    sock.ops().disconnect(handle, &mut common)
}

fn family_only(domain: c_int) -> SockaddrStorage {
    let family = domain as libc::sa_family_t;
    SockaddrStorage::from_bytes(&family.to_ne_bytes()).unwrap_or_default()
}

/// `getsockname()`. An unbound socket reports an address holding only its family.
pub fn getsockname(handle: &Handle) -> Result<SockaddrStorage, Errno> {
    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;
    let common = sock.lock();
    if common.local_addr.is_empty() {
        Ok(family_only(sock.domain()))
    } else {
        Ok(common.local_addr)
    }
}

/// `getpeername()`.
pub fn getpeername(handle: &Handle) -> Result<SockaddrStorage, Errno> {
    let common = handle.as_socket().ok_or(Errno::ENOTSOCK)?.lock();
    if common.state != SocketState::Connected {
        return Err(Errno::ENOTCONN);
    }
    Ok(common.remote_addr)
}

/// Copy an option value, truncating it to the caller's buffer as Linux does.
fn write_optval(optval: &mut [u8], value: &[u8]) -> usize {
    let len = std::cmp::min(optval.len(), value.len());
    optval[..len].copy_from_slice(&value[..len]);
    len
}

const TIME_T_LEN: usize = std::mem::size_of::<libc::time_t>();
const TIMEVAL_LEN: usize = TIME_T_LEN + std::mem::size_of::<libc::suseconds_t>();
assert_eq_size!(libc::timeval, [u8; TIMEVAL_LEN]);

fn timeval_from_us(us: u64) -> TimeVal {
    TimeVal::new(
        (us / 1_000_000) as libc::time_t,
        (us % 1_000_000) as libc::suseconds_t,
    )
}

/// The `struct timeval` layout an application reads: seconds then microseconds, native endian.
fn timeval_bytes(tv: &TimeVal) -> [u8; TIMEVAL_LEN] {
    let mut bytes = [0u8; TIMEVAL_LEN];
    bytes[..TIME_T_LEN].copy_from_slice(&tv.tv_sec().to_ne_bytes());
    bytes[TIME_T_LEN..].copy_from_slice(&tv.tv_usec().to_ne_bytes());
    bytes
}

fn timeval_to_us(optval: &[u8]) -> Result<u64, Errno> {
    let optval = optval.get(..TIMEVAL_LEN).ok_or(Errno::EINVAL)?;
    let (sec, usec) = optval.split_at(TIME_T_LEN);
    let sec = libc::time_t::from_ne_bytes(sec.try_into().map_err(|_| Errno::EINVAL)?);
    let usec = libc::suseconds_t::from_ne_bytes(usec.try_into().map_err(|_| Errno::EINVAL)?);

    if !(0..1_000_000).contains(&usec) {
        return Err(Errno::EDOM);
    }
    // a negative timeout means no timeout
    if sec < 0 {
        return Ok(0);
    }

    Ok((sec as u64)
        .saturating_mul(1_000_000)
        .saturating_add(usec as u64))
}

/// `getsockopt()`. Returns the option length.
pub fn get_option(
    handle: &Handle,
    level: c_int,
    name: c_int,
    optval: &mut [u8],
) -> Result<usize, Errno> {
    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;

    if level == libc::SOL_SOCKET {
        let int_value = |val: c_int, optval: &mut [u8]| write_optval(optval, &val.to_ne_bytes());
        match name {
            libc::SO_TYPE => return Ok(int_value(sock.sock_type().as_raw(), optval)),
            libc::SO_DOMAIN => return Ok(int_value(sock.domain(), optval)),
            libc::SO_PROTOCOL => return Ok(int_value(sock.protocol(), optval)),
            libc::SO_ACCEPTCONN => {
                let listening = sock.lock().state == SocketState::Listening;
                return Ok(int_value(listening.into(), optval));
            }
            libc::SO_ERROR => {
                let err = sock.lock().last_error.take().map_or(0, |e| e as c_int);
                return Ok(int_value(err, optval));
            }
            libc::SO_RCVTIMEO => {
                let tv = timeval_from_us(sock.lock().receive_timeout_us);
                return Ok(write_optval(optval, &timeval_bytes(&tv)));
            }
            libc::SO_SNDTIMEO => {
                let tv = timeval_from_us(sock.lock().send_timeout_us);
                return Ok(write_optval(optval, &timeval_bytes(&tv)));
            }
            _ => {}
        }
    }

    sock.ops().get_option(handle, level, name, optval)
}

/// `setsockopt()`.
pub fn set_option(handle: &Handle, level: c_int, name: c_int, optval: &[u8]) -> Result<(), Errno> {
    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;

    if level == libc::SOL_SOCKET {
        match name {
            libc::SO_RCVTIMEO => {
                sock.lock().receive_timeout_us = timeval_to_us(optval)?;
                return Ok(());
            }
            libc::SO_SNDTIMEO => {
                sock.lock().send_timeout_us = timeval_to_us(optval)?;
                return Ok(());
            }
            libc::SO_TYPE
            | libc::SO_DOMAIN
            | libc::SO_PROTOCOL
            | libc::SO_ACCEPTCONN
            | libc::SO_ERROR => return Err(Errno::ENOPROTOOPT),
            _ => {}
        }
    }

    sock.ops().set_option(handle, level, name, optval)
}

/// Note the outcome of a failed transfer: a would-block owes an edge-triggered notification once
/// the socket becomes ready, and other failures are kept for `SO_ERROR`.
fn record_error(handle: &Handle, err: Errno, input: bool) {
    match err {
        Errno::EAGAIN => handle.set_needs_et_poll(input, !input),
        Errno::EINTR => {}
        err => handle.socket().lock().last_error = Some(err),
    }
}

/// `sendmsg()`.
pub fn send(handle: &Handle, bufs: &[IoSlice<'_>], flags: c_int) -> Result<usize, Errno> {
    if flags & libc::MSG_OOB != 0 {
        return Err(Errno::EOPNOTSUPP);
    }

    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;
    if sock.lock().shutdown.contains(ShutdownFlags::WRITE) {
        return Err(Errno::EPIPE);
    }

    sock.ops().send(handle, bufs).map_err(|e| {
        record_error(handle, e, false);
        e
    })
}

/// `recvmsg()`. Supports `MSG_PEEK` and `MSG_DONTWAIT`.
pub fn recv(handle: &Handle, bufs: &mut [IoSliceMut<'_>], flags: c_int) -> Result<usize, Errno> {
    if flags & libc::MSG_OOB != 0 {
        return Err(Errno::EOPNOTSUPP);
    }
    let peek = flags & libc::MSG_PEEK != 0;
    let nonblocking = flags & libc::MSG_DONTWAIT != 0;

    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;
    if sock.lock().shutdown.contains(ShutdownFlags::READ) {
        return Ok(0);
    }

    let total = iov_len(bufs);
    if total == 0 {
        return Ok(0);
    }

    let mut peeked = sock.lock_receive();

    if !peeked.is_empty() {
        let n = scatter(&peeked, bufs);
        if !peek {
            peeked.drain(..n);
        }
        return Ok(n);
    }

    let rv = if peek {
        // read ahead, keeping the data for the next receive
        peeked.try_reserve(total).map_err(|_| Errno::ENOMEM)?;
        peeked.resize(total, 0);
        match sock
            .ops()
            .receive(handle, &mut [IoSliceMut::new(&mut peeked[..])], nonblocking)
        {
            Ok(n) => {
                peeked.truncate(n);
                Ok(scatter(&peeked, bufs))
            }
            Err(e) => {
                peeked.clear();
                Err(e)
            }
        }
    } else {
        sock.ops().receive(handle, bufs, nonblocking)
    };

    rv.map_err(|e| {
        record_error(handle, e, true);
        e
    })
}

/// `shutdown()`. Only a connected socket can be shut down.
pub fn shutdown(handle: &Handle, how: c_int) -> Result<(), Errno> {
    let how = ShutdownFlags::from_how(how)?;
    let sock = handle.as_socket().ok_or(Errno::ENOTSOCK)?;

    {
        let mut common = sock.lock();
        if common.state != SocketState::Connected {
            return Err(Errno::ENOTCONN);
        }
        common.shutdown.insert(how);
    }

    handle.interrupt_epolls();
    Ok(())
}

/// Total length of a buffer list.
pub fn iov_len<B: std::ops::Deref<Target = [u8]>>(bufs: &[B]) -> usize {
    bufs.iter().fold(0usize, |acc, b| acc.saturating_add(b.len()))
}

/// Copy `src` across `bufs` in order, returning how many bytes were copied.
pub fn scatter(src: &[u8], bufs: &mut [IoSliceMut<'_>]) -> usize {
    let mut copied = 0;
    for buf in bufs.iter_mut() {
        if copied == src.len() {
            break;
        }
        let n = std::cmp::min(buf.len(), src.len() - copied);
        buf[..n].copy_from_slice(&src[copied..][..n]);
        copied += n;
    }
    copied
}

#[cfg(test)]
mod tests {
    use super::*;
    use libos_pal::loopback::LoopbackPal;

    fn platform() -> Arc<dyn Platform> {
        Arc::new(LoopbackPal::default())
    }

    fn unix_addr(sun_path: &[u8]) -> Vec<u8> {
        let mut addr = (libc::AF_UNIX as libc::sa_family_t).to_ne_bytes().to_vec();
        addr.extend_from_slice(sun_path);
        addr
    }

    fn int_option(handle: &Handle, name: c_int) -> c_int {
        let mut buf = [0u8; 4];
        assert_eq!(get_option(handle, libc::SOL_SOCKET, name, &mut buf), Ok(4));
        c_int::from_ne_bytes(buf)
    }

    #[test]
    fn test_socket_type_conversion() {
        assert_eq!(SocketType::try_from(libc::SOCK_STREAM).unwrap(), SocketType::Stream);
        assert_eq!(SocketType::try_from(libc::SOCK_DGRAM).unwrap(), SocketType::Dgram);
        assert!(SocketType::try_from(libc::SOCK_SEQPACKET).is_err());
        assert_eq!(SocketType::Dgram.as_raw(), libc::SOCK_DGRAM);
    }

    #[test]
    fn test_shutdown_how() {
        assert_eq!(ShutdownFlags::from_how(libc::SHUT_RD), Ok(ShutdownFlags::READ));
        assert_eq!(
            ShutdownFlags::from_how(libc::SHUT_RDWR),
            Ok(ShutdownFlags::READ | ShutdownFlags::WRITE)
        );
        assert_eq!(ShutdownFlags::from_how(7), Err(Errno::EINVAL));
    }

    #[test]
    fn test_socket_errors() {
        let pal = platform();
        assert_eq!(
            socket(&pal, libc::AF_INET, libc::SOCK_STREAM, 0).unwrap_err(),
            Errno::EAFNOSUPPORT
        );
        assert_eq!(
            socket(&pal, libc::AF_UNIX, libc::SOCK_RAW, 0).unwrap_err(),
            Errno::ESOCKTNOSUPPORT
        );
        assert_eq!(
            socket(&pal, libc::AF_UNIX, libc::SOCK_DGRAM, 0).unwrap_err(),
            Errno::EPROTONOSUPPORT
        );
        assert_eq!(
            socket(&pal, libc::AF_UNIX, libc::SOCK_STREAM, 6).unwrap_err(),
            Errno::EPROTONOSUPPORT
        );
    }

    #[test]
    fn test_socket_flags() {
        let pal = platform();
        let (handle, flags) = socket(
            &pal,
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
        .unwrap();
        assert_eq!(flags, DescriptorFlags::CLOEXEC);
        assert!(handle.is_nonblocking());
        assert!(handle.socket().stream().is_none());
        assert_eq!(handle.socket().lock().state, SocketState::New);
        assert_eq!(handle.fs().unwrap().name(), "socket");
    }

    #[test]
    fn test_state_checks() {
        let pal = platform();
        let (handle, _) = socket(&pal, libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();

        assert_eq!(listen(&handle, 5), Err(Errno::EINVAL));
        assert_eq!(accept(&handle, 0).unwrap_err(), Errno::EINVAL);
        assert_eq!(getpeername(&handle), Err(Errno::ENOTCONN));
        assert_eq!(shutdown(&handle, libc::SHUT_RDWR), Err(Errno::ENOTCONN));

        bind(&handle, &unix_addr(b"\0state")).unwrap();
        assert_eq!(bind(&handle, &unix_addr(b"\0state2")), Err(Errno::EINVAL));
        listen(&handle, 5).unwrap();
        listen(&handle, 10).unwrap();
        assert_eq!(connect(&handle, &unix_addr(b"\0state")), Err(Errno::EINVAL));
        assert_eq!(
            accept(&handle, libc::O_APPEND).unwrap_err(),
            Errno::EINVAL
        );
    }

    #[test]
    fn test_getsockname_unbound() {
        let pal = platform();
        let (handle, _) = socket(&pal, libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();
        let addr = getsockname(&handle).unwrap();
        assert_eq!(addr, SockaddrStorage::unix_unnamed());
    }

    #[test]
    fn test_not_a_socket() {
        let file = Handle::allocate(HandleInfo::Dev).build();
        let addr = unix_addr(b"/tmp/notsock");
        let mut buf = [0u8; 8];

        assert_eq!(bind(&file, &addr), Err(Errno::ENOTSOCK));
        assert_eq!(listen(&file, 1), Err(Errno::ENOTSOCK));
        assert_eq!(accept(&file, 0).map(|_| ()), Err(Errno::ENOTSOCK));
        assert_eq!(connect(&file, &addr), Err(Errno::ENOTSOCK));
        assert_eq!(disconnect(&file), Err(Errno::ENOTSOCK));
        assert_eq!(getsockname(&file), Err(Errno::ENOTSOCK));
        assert_eq!(getpeername(&file), Err(Errno::ENOTSOCK));
        assert_eq!(
            get_option(&file, libc::SOL_SOCKET, libc::SO_TYPE, &mut buf),
            Err(Errno::ENOTSOCK)
        );
        assert_eq!(
            set_option(&file, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &buf),
            Err(Errno::ENOTSOCK)
        );
        assert_eq!(send(&file, &[IoSlice::new(b"x")], 0), Err(Errno::ENOTSOCK));
        assert_eq!(
            recv(&file, &mut [IoSliceMut::new(&mut buf)], 0),
            Err(Errno::ENOTSOCK)
        );
        assert_eq!(shutdown(&file, libc::SHUT_RDWR), Err(Errno::ENOTSOCK));
    }

    #[test]
    fn test_sol_socket_options() {
        let pal = platform();
        let (handle, _) = socket(&pal, libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();

        assert_eq!(int_option(&handle, libc::SO_TYPE), libc::SOCK_STREAM);
        assert_eq!(int_option(&handle, libc::SO_DOMAIN), libc::AF_UNIX);
        assert_eq!(int_option(&handle, libc::SO_PROTOCOL), 0);
        assert_eq!(int_option(&handle, libc::SO_ACCEPTCONN), 0);

        handle.socket().lock().last_error = Some(Errno::ECONNRESET);
        assert_eq!(int_option(&handle, libc::SO_ERROR), Errno::ECONNRESET as c_int);
        assert_eq!(int_option(&handle, libc::SO_ERROR), 0);

        bind(&handle, &unix_addr(b"\0opts")).unwrap();
        listen(&handle, 1).unwrap();
        assert_eq!(int_option(&handle, libc::SO_ACCEPTCONN), 1);

        // unknown options go to the backend
        let mut buf = [0u8; 4];
        assert_eq!(
            get_option(&handle, libc::SOL_SOCKET, libc::SO_RCVBUF, &mut buf),
            Err(Errno::ENOPROTOOPT)
        );
        assert_eq!(
            set_option(&handle, libc::SOL_SOCKET, libc::SO_TYPE, &buf),
            Err(Errno::ENOPROTOOPT)
        );
    }

    #[test]
    fn test_timeouts() {
        let pal = platform();
        let (handle, _) = socket(&pal, libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap();

        let tv = TimeVal::new(2, 500_000);
        set_option(&handle, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &timeval_bytes(&tv)).unwrap();
        assert_eq!(handle.socket().lock().receive_timeout_us, 2_500_000);
        assert_eq!(handle.socket().lock().send_timeout_us, 0);

        let mut out = [0u8; std::mem::size_of::<libc::timeval>()];
        let len = get_option(&handle, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &mut out).unwrap();
        assert_eq!(len, out.len());
        assert_eq!(out, timeval_bytes(&tv));

        let bad = TimeVal::new(1, 1_000_000);
        assert_eq!(
            set_option(&handle, libc::SOL_SOCKET, libc::SO_SNDTIMEO, &timeval_bytes(&bad)),
            Err(Errno::EDOM)
        );
        assert_eq!(
            set_option(&handle, libc::SOL_SOCKET, libc::SO_SNDTIMEO, &[0u8; 3]),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn test_timeval_layout() {
        // the encoding must match what the C library writes for a `struct timeval`
        let raw = libc::timeval {
            tv_sec: 7,
            tv_usec: 250,
        };
        let mut expected = Vec::new();
        expected.extend_from_slice(&raw.tv_sec.to_ne_bytes());
        expected.extend_from_slice(&raw.tv_usec.to_ne_bytes());

        let encoded = timeval_bytes(&TimeVal::from(raw));
        assert_eq!(&encoded[..], &expected[..]);
        assert_eq!(timeval_to_us(&encoded), Ok(7_000_250));

        // negative seconds disable the timeout
        assert_eq!(timeval_to_us(&timeval_bytes(&TimeVal::new(-1, 0))), Ok(0));
        // trailing bytes are ignored
        let mut long = encoded.to_vec();
        long.push(0xff);
        assert_eq!(timeval_to_us(&long), Ok(7_000_250));
    }

    #[test]
    fn test_scatter() {
        let mut a = [0u8; 2];
        let mut b = [0u8; 3];
        let mut bufs = [IoSliceMut::new(&mut a), IoSliceMut::new(&mut b)];
        assert_eq!(iov_len(&bufs), 5);
        assert_eq!(scatter(b"abcd", &mut bufs), 4);
        assert_eq!(&a, b"ab");
        assert_eq!(&b, b"cd\0");

        let mut c = [0u8; 1];
        assert_eq!(scatter(b"xyz", &mut [IoSliceMut::new(&mut c)]), 1);
        assert_eq!(&c, b"x");
    }
}
