//! Handles, the open-file objects of the emulated OS, and the per-process descriptor tables that
//! refer to them.

use nix::errno::Errno;
use nix::fcntl::OFlag;

pub mod descriptor_table;
pub mod epoll;
pub mod fs;
pub mod handle;
pub mod socket;

pub use handle::{acquire, release, Handle, HandleBuilder, HandleInfo, HandleRef, HandleType};

bitflags::bitflags! {
    /// These are flags that can potentially be changed by the application (analagous to the
    /// Linux `filp->f_flags` status flags). File access mode flags (ex: `O_RDWR`) are stored in
    /// [`FileMode`], and file creation flags (ex: `O_CREAT`) are not stored anywhere. Many of
    /// these can be represented in different ways, for example: `O_NONBLOCK`, `SOCK_NONBLOCK`,
    /// `EFD_NONBLOCK`, and not all have the same value.
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct FileStatus: libc::c_int {
        const NONBLOCK = libc::O_NONBLOCK;
        const APPEND = libc::O_APPEND;
        const ASYNC = libc::O_ASYNC;
        const DIRECT = libc::O_DIRECT;
        const NOATIME = libc::O_NOATIME;
    }
}

impl FileStatus {
    pub fn as_o_flags(&self) -> OFlag {
        OFlag::from_bits_truncate(self.bits())
    }

    /// Returns a tuple of the `FileStatus` and any remaining flags.
    pub fn from_o_flags(flags: OFlag) -> (Self, OFlag) {
        let status = Self::from_bits_truncate(flags.bits());
        let remaining = OFlag::from_bits_retain(flags.bits() & !status.bits());
        (status, remaining)
    }
}

bitflags::bitflags! {
    /// How the handle was opened (analagous to the Linux `filp->f_mode`). Fixed for the life of
    /// the handle.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FileMode: u32 {
        const READ = 0b00000001;
        const WRITE = 0b00000010;
    }
}

impl FileMode {
    pub fn as_o_flags(&self) -> OFlag {
        // https://www.gnu.org/software/libc/manual/html_node/Access-Modes.html
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => OFlag::O_RDWR,
            (true, false) => OFlag::O_RDONLY,
            (false, true) => OFlag::O_WRONLY,
            // a linux-specific flag
            (false, false) => OFlag::O_PATH,
        }
    }

    /// Returns a tuple of the `FileMode` and any remaining flags, or `EINVAL` if the flags
    /// aren't valid (for example specifying both `O_RDWR` and `O_WRONLY`).
    pub fn from_o_flags(flags: OFlag) -> Result<(Self, OFlag), Errno> {
        // the O_PATH flag is not contained within the access mode mask
        let mode = flags & (OFlag::O_ACCMODE | OFlag::O_PATH);
        let remaining = flags - (OFlag::O_ACCMODE | OFlag::O_PATH);

        let mode = match mode {
            OFlag::O_RDONLY => FileMode::READ,
            OFlag::O_WRONLY => FileMode::WRITE,
            OFlag::O_RDWR => FileMode::READ | FileMode::WRITE,
            OFlag::O_PATH => FileMode::empty(),
            _ => return Err(Errno::EINVAL),
        };

        Ok((mode, remaining))
    }
}

bitflags::bitflags! {
    // Linux only supports a single descriptor flag:
    // https://www.gnu.org/software/libc/manual/html_node/Descriptor-Flags.html
    #[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
    pub struct DescriptorFlags: libc::c_int {
        const CLOEXEC = libc::FD_CLOEXEC;
    }
}

impl DescriptorFlags {
    pub fn as_o_flags(&self) -> OFlag {
        let mut flags = OFlag::empty();
        if self.contains(Self::CLOEXEC) {
            flags.insert(OFlag::O_CLOEXEC);
        }
        flags
    }

    /// Returns a tuple of the `DescriptorFlags` and any remaining flags.
    pub fn from_o_flags(flags: OFlag) -> (Self, OFlag) {
        let mut remaining = flags;
        let mut flags = Self::empty();

        if remaining.contains(OFlag::O_CLOEXEC) {
            remaining.remove(OFlag::O_CLOEXEC);
            flags.insert(Self::CLOEXEC);
        }

        (flags, remaining)
    }
}

/// A descriptor table entry: a reference to a handle and the descriptor's own flags.
#[derive(Clone, Debug)]
pub struct Descriptor {
    handle: HandleRef,
    flags: DescriptorFlags,
}

impl Descriptor {
    /// Takes ownership of the caller's reference to `handle`.
    pub fn new(handle: HandleRef, flags: DescriptorFlags) -> Self {
        Self { handle, flags }
    }

    pub fn handle(&self) -> &HandleRef {
        &self.handle
    }

    pub fn into_handle(self) -> HandleRef {
        self.handle
    }

    pub fn flags(&self) -> DescriptorFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: DescriptorFlags) {
        self.flags = flags;
    }

    /// Duplicate the descriptor, with both descriptors pointing to the same handle. In Linux,
    /// the descriptor flags aren't typically copied to the new descriptor, so we explicitly
    /// require a flags value to avoid confusion.
    pub fn dup(&self, flags: DescriptorFlags) -> Self {
        Self {
            handle: acquire(&self.handle),
            flags,
        }
    }
}
