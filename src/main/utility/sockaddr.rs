use std::ffi::CStr;

use nix::sys::socket::AddressFamily;
use static_assertions::{assert_eq_size, const_assert};

const STORAGE_LEN: usize = std::mem::size_of::<libc::sockaddr_storage>();

/// Size of a full `sockaddr_un`.
pub const SOCKADDR_UN_LEN: usize = std::mem::size_of::<libc::sockaddr_un>();

assert_eq_size!(libc::sa_family_t, u16);
const_assert!(SOCKADDR_UN_LEN <= STORAGE_LEN);

/// Offset of `sun_path` within a `sockaddr_un`.
pub fn sun_path_offset() -> usize {
    memoffset::offset_of!(libc::sockaddr_un, sun_path)
}

/// A socket address of any family, stored as the bytes the application supplied. Bytes past the
/// address length are always zero.
#[derive(Clone, Copy)]
pub struct SockaddrStorage {
    bytes: [u8; STORAGE_LEN],
    len: usize,
}

impl SockaddrStorage {
    /// Copy an address. Returns `None` if it's longer than a `sockaddr_storage`.
    pub fn from_bytes(addr: &[u8]) -> Option<Self> {
        if addr.len() > STORAGE_LEN {
            return None;
        }

        let mut bytes = [0u8; STORAGE_LEN];
        bytes[..addr.len()].copy_from_slice(addr);

        Some(Self {
            bytes,
            len: addr.len(),
        })
    }

    /// An address of length zero, used for addresses that were never assigned.
    pub const fn empty() -> Self {
        Self {
            bytes: [0u8; STORAGE_LEN],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The raw family field, or `None` if the address is too short to hold one.
    pub fn raw_family(&self) -> Option<libc::sa_family_t> {
        if self.len < std::mem::size_of::<libc::sa_family_t>() {
            return None;
        }
        Some(libc::sa_family_t::from_ne_bytes([self.bytes[0], self.bytes[1]]))
    }

    /// Get the socket protocol family. Will return `None` if the socket address length is too
    /// short, or if the family value does not correspond to a valid/known family.
    pub fn family(&self) -> Option<AddressFamily> {
        AddressFamily::from_i32(self.raw_family()?.into())
    }

    pub fn as_unix(&self) -> Option<SockaddrUnix<'_>> {
        SockaddrUnix::new(self.as_bytes())
    }

    /// Change the address length. Shortening zeroes the dropped bytes and growing exposes zero
    /// bytes. The length is capped at the size of a `sockaddr_storage`.
    pub fn set_len(&mut self, len: usize) {
        let len = std::cmp::min(len, STORAGE_LEN);
        if len < self.len {
            self.bytes[len..].fill(0);
        }
        self.len = len;
    }

    /// A pathname unix socket address. Will return `None` if the path is empty or is too large.
    pub fn unix_path(path: &CStr) -> Option<Self> {
        let path = path.to_bytes();

        if path.is_empty() {
            // you cannot have a pathname unix socket address with no path
            return None;
        }

        let offset = sun_path_offset();

        // pathname unix sockets should be nul terminated, so leave room for the nul
        if offset + path.len() >= SOCKADDR_UN_LEN {
            return None;
        }

        let mut addr = Self::unix_unnamed();
        addr.bytes[offset..][..path.len()].copy_from_slice(path);
        addr.len = offset + path.len() + 1;
        Some(addr)
    }

    /// An abstract unix socket address. The name does not include the required nul byte at
    /// `sun_path[0]`. Will return `None` if the name is too large.
    pub fn unix_abstract(name: &[u8]) -> Option<Self> {
        let offset = sun_path_offset();

        if offset + 1 + name.len() > SOCKADDR_UN_LEN {
            return None;
        }

        let mut addr = Self::unix_unnamed();
        addr.bytes[offset + 1..][..name.len()].copy_from_slice(name);
        addr.len = offset + 1 + name.len();
        Some(addr)
    }

    /// A unix socket address holding only the family.
    pub fn unix_unnamed() -> Self {
        let family = libc::AF_UNIX as libc::sa_family_t;
        let mut addr = Self::empty();
        addr.bytes[..2].copy_from_slice(&family.to_ne_bytes());
        addr.len = sun_path_offset();
        addr
    }
}

impl Default for SockaddrStorage {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for SockaddrStorage {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for SockaddrStorage {}

impl std::fmt::Debug for SockaddrStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(addr) = self.as_unix() {
            return write!(f, "{addr:?}");
        }
        f.debug_struct("SockaddrStorage")
            .field("family", &self.raw_family())
            .field("len", &self.len)
            .finish()
    }
}

impl std::fmt::Display for SockaddrStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_unix() {
            Some(addr) => write!(f, "{addr}"),
            None if self.is_empty() => write!(f, "(none)"),
            None => write!(f, "sockaddr {{ family: {:?} }}", self.raw_family()),
        }
    }
}

/// A borrowed unix socket address.
#[derive(Clone, Copy)]
pub struct SockaddrUnix<'a> {
    addr: &'a [u8],
}

impl<'a> SockaddrUnix<'a> {
    /// Will return `None` if the length is too short, too long, or if the family is not
    /// `AF_UNIX`.
    pub fn new(addr: &'a [u8]) -> Option<Self> {
        if addr.len() < sun_path_offset() || addr.len() > SOCKADDR_UN_LEN {
            return None;
        }

        let family = libc::sa_family_t::from_ne_bytes([addr[0], addr[1]]);
        if i32::from(family) != libc::AF_UNIX {
            return None;
        }

        Some(Self { addr })
    }

    /// If the socket address represents a pathname address, returns the C string representing the
    /// filesystem path.
    pub fn as_path(&self) -> Option<&'a CStr> {
        let path = self.sun_path();

        // if the address length is too short, or it's an abstract named address
        if path.is_empty() || path[0] == 0 {
            return None;
        }

        // bytes after the nul are ignored, and a path filling all of `sun_path` has no nul
        match CStr::from_bytes_until_nul(path) {
            Ok(path) => Some(path),
            Err(_) => None,
        }
    }

    /// If the socket address represents an abstract address, returns the name without the nul
    /// byte at `sun_path[0]`.
    pub fn as_abstract(&self) -> Option<&'a [u8]> {
        let name = self.sun_path();

        if name.is_empty() || name[0] != 0 {
            return None;
        }

        Some(&name[1..])
    }

    /// Unnamed addresses hold only the family.
    pub fn is_unnamed(&self) -> bool {
        self.addr.len() == sun_path_offset()
    }

    /// The valid bytes of `sun_path`.
    pub fn sun_path(&self) -> &'a [u8] {
        &self.addr[sun_path_offset()..]
    }
}

impl std::fmt::Debug for SockaddrUnix<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SockaddrUnix")
            .field("sun_path", &self.sun_path())
            .finish()
    }
}

impl std::fmt::Display for SockaddrUnix<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(path) = self.as_path() {
            f.debug_struct("sockaddr_un").field("path", &path).finish()
        } else if let Some(name) = self.as_abstract() {
            let name: String = name
                .iter()
                .flat_map(|x| std::ascii::escape_default(*x))
                .map(char::from)
                .collect();
            f.debug_struct("sockaddr_un")
                .field("abstract", &name)
                .finish()
        } else if self.is_unnamed() {
            write!(f, "sockaddr_un {{ unnamed }}")
        } else {
            f.debug_struct("sockaddr_un")
                .field("sun_path", &self.sun_path())
                .finish()
        }
    }
}
