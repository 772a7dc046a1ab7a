//! UNIX domain stream sockets on top of the platform's named pipes.
//!
//! A bound socket opens the server side of the pipe named after its address
//! ([`unix_name::unaddr_to_sockname`]) and a connecting socket opens the client side of the same
//! name. Datagram sockets are not supported.

use std::io::{IoSlice, IoSliceMut};

use libc::c_int;
use libos_pal::{Access, CreateMode, PalError, ShareFlags, StreamOptions};
use log::*;
use nix::errno::Errno;

use super::unix_name::{fixup_sockaddr_un_path, unaddr_to_sockname};
use super::{iov_len, new_socket_handle, scatter, SocketCommon, SocketOps, SocketState, SocketType};
use crate::host::descriptor::handle::{Handle, HandleRef};
use crate::host::descriptor::FileStatus;
use crate::host::platform::pal_to_unix_errno;
use crate::utility::sockaddr::{SockaddrStorage, SOCKADDR_UN_LEN};

pub static UNIX_SOCKET_OPS: UnixSocketOps = UnixSocketOps;

pub struct UnixSocketOps;

fn stream_options(nonblocking: bool) -> StreamOptions {
    if nonblocking {
        StreamOptions::NONBLOCK
    } else {
        StreamOptions::empty()
    }
}

/// The address recorded for a successful bind or connect: the caller's address clamped to a
/// `sockaddr_un` and normalized.
fn recorded_addr(addr: &[u8]) -> SockaddrStorage {
    let addr = &addr[..std::cmp::min(addr.len(), SOCKADDR_UN_LEN)];
    let mut addr = SockaddrStorage::from_bytes(addr).unwrap_or_default();
    fixup_sockaddr_un_path(&mut addr);
    addr
}

impl SocketOps for UnixSocketOps {
    fn name(&self) -> &'static str {
        "unix"
    }

    fn create(&self, sock_type: SocketType, protocol: c_int) -> Result<(), Errno> {
        if sock_type == SocketType::Dgram {
            warn!("Datagram UNIX sockets are not supported");
            return Err(Errno::EPROTONOSUPPORT);
        }

        if protocol != 0 {
            debug!("Unsupported UNIX socket protocol {}", protocol);
            return Err(Errno::EPROTONOSUPPORT);
        }

        Ok(())
    }

    fn bind(&self, handle: &Handle, common: &mut SocketCommon, addr: &[u8]) -> Result<(), Errno> {
        let name = unaddr_to_sockname(addr)?;
        let sock = handle.socket();

        {
            // hold the handle lock so the nonblocking flag can't change until the stream is in
            // place
            let inner = handle.lock();
            let nonblocking = inner.status.contains(FileStatus::NONBLOCK);

            let stream = sock
                .platform()
                .stream_open(
                    &name.server_uri(),
                    Access::ReadWrite,
                    ShareFlags::empty(),
                    CreateMode::Always,
                    stream_options(nonblocking),
                )
                .map_err(|e| match e {
                    PalError::StreamExist => Errno::EADDRINUSE,
                    e => pal_to_unix_errno(e),
                })?;

            sock.install_stream(stream);
        }

        common.local_addr = recorded_addr(addr);
        handle.interrupt_epolls();
        Ok(())
    }

    fn listen(
        &self,
        handle: &Handle,
        common: &mut SocketCommon,
        _backlog: c_int,
    ) -> Result<(), Errno> {
        if handle.socket().sock_type() != SocketType::Stream {
            return Err(Errno::EOPNOTSUPP);
        }

        match common.state {
            SocketState::Bound | SocketState::Listening => Ok(()),
            state => {
                debug_panic!("Listen reached the UNIX backend in state {:?}", state);
                Err(Errno::EINVAL)
            }
        }
    }

    fn accept(&self, handle: &Handle, nonblocking: bool) -> Result<HandleRef, Errno> {
        let sock = handle.socket();
        let listener = sock.stream().ok_or(Errno::EINVAL)?;

        let stream = listener
            .wait_for_client(stream_options(nonblocking))
            .map_err(pal_to_unix_errno)?;

        let local_addr = sock.lock().local_addr;
        // the peer's bound path is not known
        let child = sock.new_accepted(stream, local_addr, SockaddrStorage::unix_unnamed());

        Ok(new_socket_handle(child, nonblocking))
    }

    fn connect(
        &self,
        handle: &Handle,
        common: &mut SocketCommon,
        addr: &[u8],
    ) -> Result<(), Errno> {
        if common.state != SocketState::New {
            warn!("Does not support connect on already bound UNIX socket");
            return Err(Errno::EINVAL);
        }

        let name = unaddr_to_sockname(addr)?;
        let sock = handle.socket();

        {
            let inner = handle.lock();
            let nonblocking = inner.status.contains(FileStatus::NONBLOCK);

            let stream = sock
                .platform()
                .stream_open(
                    &name.client_uri(),
                    Access::ReadWrite,
                    ShareFlags::empty(),
                    CreateMode::Ignored,
                    stream_options(nonblocking),
                )
                .map_err(|e| match e {
                    PalError::ConnFailed => Errno::ENOENT,
                    e => pal_to_unix_errno(e),
                })?;

            sock.install_stream(stream);
        }

        common.remote_addr = recorded_addr(addr);
        if !common.was_bound {
            common.local_addr = SockaddrStorage::unix_unnamed();
        }

        handle.interrupt_epolls();
        Ok(())
    }

    fn disconnect(&self, _handle: &Handle, _common: &mut SocketCommon) -> Result<(), Errno> {
        Err(Errno::EINVAL)
    }

    fn get_option(
        &self,
        _handle: &Handle,
        _level: c_int,
        _name: c_int,
        _optval: &mut [u8],
    ) -> Result<usize, Errno> {
        Err(Errno::ENOPROTOOPT)
    }

    fn set_option(
        &self,
        _handle: &Handle,
        _level: c_int,
        _name: c_int,
        _optval: &[u8],
    ) -> Result<(), Errno> {
        Err(Errno::ENOPROTOOPT)
    }

    fn send(&self, handle: &Handle, bufs: &[IoSlice<'_>]) -> Result<usize, Errno> {
        let sock = handle.socket();
        if sock.sock_type() == SocketType::Dgram {
            panic!("Datagram send on a UNIX socket");
        }

        let stream = sock.stream().ok_or(Errno::ENOTCONN)?;

        let total = iov_len(bufs);
        if total == 0 {
            return Ok(0);
        }

        let map_err = |e| match e {
            PalError::TooLong => Errno::EMSGSIZE,
            e => pal_to_unix_errno(e),
        };

        if let [buf] = bufs {
            return stream.write(buf).map_err(map_err);
        }

        let mut gathered = Vec::new();
        gathered.try_reserve_exact(total).map_err(|_| Errno::ENOMEM)?;
        for buf in bufs {
            gathered.extend_from_slice(buf);
        }
        stream.write(&gathered).map_err(map_err)
    }

    fn receive(
        &self,
        handle: &Handle,
        bufs: &mut [IoSliceMut<'_>],
        nonblocking: bool,
    ) -> Result<usize, Errno> {
        let sock = handle.socket();
        if sock.sock_type() == SocketType::Dgram {
            panic!("Datagram receive on a UNIX socket");
        }

        let stream = sock.stream().ok_or(Errno::ENOTCONN)?;

        if nonblocking && !handle.is_nonblocking() {
            debug!("Nonblocking receive on a blocking UNIX socket is not supported");
            return Err(Errno::EINVAL);
        }

        if let [buf] = bufs {
            return stream.read(buf).map_err(pal_to_unix_errno);
        }

        let total = iov_len(bufs);
        if total == 0 {
            return Ok(0);
        }

        let mut tmp = Vec::new();
        tmp.try_reserve_exact(total).map_err(|_| Errno::ENOMEM)?;
        tmp.resize(total, 0);

        let n = stream.read(&mut tmp).map_err(pal_to_unix_errno)?;
        Ok(scatter(&tmp[..n], bufs))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::host::descriptor::socket;
    use libos_pal::loopback::LoopbackPal;
    use libos_pal::Platform;

    fn unix_addr(sun_path: &[u8]) -> Vec<u8> {
        let mut addr = (libc::AF_UNIX as libc::sa_family_t).to_ne_bytes().to_vec();
        addr.extend_from_slice(sun_path);
        addr
    }

    fn new_socket(pal: &Arc<dyn Platform>) -> HandleRef {
        socket::socket(pal, libc::AF_UNIX, libc::SOCK_STREAM, 0).unwrap().0
    }

    #[test]
    fn test_bind_records_normalized_address() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = new_socket(&pal);

        socket::bind(&sock, &unix_addr(b"/tmp/sock\0garbage")).unwrap();
        assert_eq!(
            socket::getsockname(&sock).unwrap().as_bytes(),
            unix_addr(b"/tmp/sock\0").as_slice()
        );
        assert!(sock.socket().stream().is_some());
        assert!(sock.socket().lock().was_bound);
    }

    #[test]
    fn test_bind_errors_leave_socket_new() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = new_socket(&pal);

        assert_eq!(socket::bind(&sock, &unix_addr(b"")), Err(Errno::EINVAL));
        let mut inet = unix_addr(b"/x");
        inet[..2].copy_from_slice(&(libc::AF_INET as libc::sa_family_t).to_ne_bytes());
        assert_eq!(socket::bind(&sock, &inet), Err(Errno::EAFNOSUPPORT));

        assert_eq!(sock.socket().lock().state, SocketState::New);
        assert!(sock.socket().stream().is_none());
    }

    #[test]
    fn test_bind_nonblocking_listener() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let (sock, _) = socket::socket(
            &pal,
            libc::AF_UNIX,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
            0,
        )
        .unwrap();

        socket::bind(&sock, &unix_addr(b"\0nb")).unwrap();
        assert!(sock.socket().stream().unwrap().is_nonblocking());
        socket::listen(&sock, 1).unwrap();
        assert_eq!(socket::accept(&sock, 0).unwrap_err(), Errno::EAGAIN);
        // would-block is not an error to report
        assert_eq!(sock.socket().lock().last_error, None);
        assert_eq!(sock.take_needs_et_poll(), (true, false));
    }

    #[test]
    fn test_connect_without_listener() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = new_socket(&pal);

        assert_eq!(
            socket::connect(&sock, &unix_addr(b"/nobody")),
            Err(Errno::ENOENT)
        );
        assert_eq!(sock.socket().lock().state, SocketState::New);
    }

    #[test]
    fn test_connect_after_bind_has_no_side_effect() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let server = new_socket(&pal);
        socket::bind(&server, &unix_addr(b"\0srv")).unwrap();
        socket::listen(&server, 1).unwrap();

        let client = new_socket(&pal);
        socket::bind(&client, &unix_addr(b"\0cli")).unwrap();
        let before = socket::getsockname(&client);

        assert_eq!(
            socket::connect(&client, &unix_addr(b"\0srv")),
            Err(Errno::EINVAL)
        );
        assert_eq!(socket::getsockname(&client), before);
        assert_eq!(client.socket().lock().state, SocketState::Bound);
        assert!(client.socket().lock().remote_addr.is_empty());
    }

    #[test]
    fn test_unsupported_operations() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = new_socket(&pal);

        assert_eq!(socket::disconnect(&sock), Err(Errno::EINVAL));
        let mut buf = [0u8; 4];
        assert_eq!(
            socket::get_option(&sock, libc::SOL_TCP, libc::TCP_NODELAY, &mut buf),
            Err(Errno::ENOPROTOOPT)
        );
        assert_eq!(
            socket::set_option(&sock, libc::SOL_SOCKET, libc::SO_REUSEADDR, &buf),
            Err(Errno::ENOPROTOOPT)
        );
    }

    #[test]
    fn test_transfer_without_stream() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = new_socket(&pal);

        assert_eq!(
            socket::send(&sock, &[IoSlice::new(b"x")], 0),
            Err(Errno::ENOTCONN)
        );
        let mut buf = [0u8; 1];
        assert_eq!(
            socket::recv(&sock, &mut [IoSliceMut::new(&mut buf)], 0),
            Err(Errno::ENOTCONN)
        );
        assert_eq!(sock.socket().lock().last_error, Some(Errno::ENOTCONN));
    }

    #[test]
    fn test_listen_on_bound_stream() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = new_socket(&pal);
        socket::bind(&sock, &unix_addr(b"\0listen")).unwrap();

        let mut common = sock.socket().lock();
        assert_eq!(UNIX_SOCKET_OPS.listen(&sock, &mut common, 0), Ok(()));
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Listen reached the UNIX backend")]
    fn test_listen_on_new_socket_panics_in_debug() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = new_socket(&pal);

        let mut common = sock.socket().lock();
        let _ = UNIX_SOCKET_OPS.listen(&sock, &mut common, 0);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_listen_on_new_socket_fails_in_release() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = new_socket(&pal);

        let mut common = sock.socket().lock();
        assert_eq!(
            UNIX_SOCKET_OPS.listen(&sock, &mut common, 0),
            Err(Errno::EINVAL)
        );
    }

    fn datagram_socket(pal: &Arc<dyn Platform>) -> HandleRef {
        let info = socket::SocketInfo::new(
            &UNIX_SOCKET_OPS,
            libc::AF_UNIX,
            SocketType::Dgram,
            0,
            Arc::clone(pal),
        );
        socket::new_socket_handle(info, false)
    }

    #[test]
    #[should_panic(expected = "Datagram send on a UNIX socket")]
    fn test_datagram_send_panics() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = datagram_socket(&pal);

        let _ = UNIX_SOCKET_OPS.send(&sock, &[IoSlice::new(b"x")]);
    }

    #[test]
    #[should_panic(expected = "Datagram receive on a UNIX socket")]
    fn test_datagram_receive_panics() {
        let pal: Arc<dyn Platform> = Arc::new(LoopbackPal::default());
        let sock = datagram_socket(&pal);

        let mut buf = [0u8; 1];
        let _ = UNIX_SOCKET_OPS.receive(&sock, &mut [IoSliceMut::new(&mut buf)], false);
    }
}
