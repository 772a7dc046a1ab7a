//! Naming of UNIX sockets on the platform.
//!
//! A socket address is turned into a fixed-length printable name by hashing the path (or the
//! abstract name) with SHA-256 and hex-encoding the digest. Any process that knows the same
//! logical address computes the same name, which is how a connecting socket finds the stream
//! its peer bound.

use libos_pal::{URI_PREFIX_PIPE, URI_PREFIX_PIPE_SRV};
use nix::errno::Errno;
use sha2::{Digest, Sha256};

use crate::utility::sockaddr::{sun_path_offset, SockaddrStorage, SOCKADDR_UN_LEN};

/// Length of a socket name: a hex-encoded 32-byte digest.
pub const SOCKET_NAME_LEN: usize = 64;

/// The platform-visible name of a UNIX socket address.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SocketName(String);

impl SocketName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The stream URI a listening socket opens.
    pub fn server_uri(&self) -> String {
        format!("{URI_PREFIX_PIPE_SRV}{}", self.0)
    }

    /// The stream URI a connecting socket opens.
    pub fn client_uri(&self) -> String {
        format!("{URI_PREFIX_PIPE}{}", self.0)
    }
}

impl std::fmt::Display for SocketName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the name of a `sockaddr_un`. Bytes beyond a `sockaddr_un` are ignored.
///
/// A pathname address is hashed up to its first nul. An abstract address is hashed in full,
/// including the leading nul.
pub fn unaddr_to_sockname(addr: &[u8]) -> Result<SocketName, Errno> {
    let addr = &addr[..std::cmp::min(addr.len(), SOCKADDR_UN_LEN)];
    let offset = sun_path_offset();

    // need the family and at least one byte of the path
    if addr.len() < offset + 1 {
        return Err(Errno::EINVAL);
    }

    let family = libc::sa_family_t::from_ne_bytes([addr[0], addr[1]]);
    if i32::from(family) != libc::AF_UNIX {
        return Err(Errno::EAFNOSUPPORT);
    }

    let path = &addr[offset..];
    let key = if path[0] == 0 {
        path
    } else {
        let end = path.iter().position(|x| *x == 0).unwrap_or(path.len());
        &path[..end]
    };

    let name = hex::encode(Sha256::digest(key));
    debug_assert_eq!(name.len(), SOCKET_NAME_LEN);
    Ok(SocketName(name))
}

/// Normalize a pathname address so that its length covers the path and one nul, with every byte
/// after it zero. Abstract and unnamed addresses are left as they are.
pub fn fixup_sockaddr_un_path(addr: &mut SockaddrStorage) {
    let offset = sun_path_offset();
    let bytes = addr.as_bytes();

    if bytes.len() <= offset || bytes[offset] == 0 {
        return;
    }

    let path = &bytes[offset..];
    let pathlen = path.iter().position(|x| *x == 0).unwrap_or(path.len());
    addr.set_len(offset + pathlen + 1);
}
