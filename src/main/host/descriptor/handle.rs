use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use libos_pal::PalStream;
use log::*;
use nix::errno::Errno;
use nix::fcntl::OFlag;

use super::epoll::{EpollInstance, EpollInterrupt, EpollItem};
use super::fs::{Dentry, Filesystem, Inode, InodeData};
use super::socket::SocketInfo;
use super::{FileMode, FileStatus};
use crate::host::platform::pal_to_unix_errno;
use crate::utility::ranked_lock::{LockRank, RankedMutex, RankedMutexGuard};

/// A counted reference to a handle. Cloning takes a reference and dropping releases it; the
/// handle is torn down when the last reference goes away.
pub type HandleRef = Arc<Handle>;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum HandleType {
    /// A file on the host filesystem.
    Chroot,
    /// An encrypted file on the host filesystem.
    ChrootEncrypted,
    Dev,
    /// A file whose contents live in memory.
    Str,
    Pseudo,
    Tmpfs,
    Synthetic,
    Pipe,
    Socket,
    Epoll,
    EventFd,
}

/// Type-specific state of a handle.
pub enum HandleInfo {
    Chroot,
    ChrootEncrypted,
    Dev,
    Str(StrInfo),
    Pseudo,
    Tmpfs,
    Synthetic,
    Pipe(PipeInfo),
    Socket(SocketInfo),
    Epoll(Arc<EpollInstance>),
    EventFd(EventFdInfo),
}

impl HandleInfo {
    pub fn handle_type(&self) -> HandleType {
        match self {
            Self::Chroot => HandleType::Chroot,
            Self::ChrootEncrypted => HandleType::ChrootEncrypted,
            Self::Dev => HandleType::Dev,
            Self::Str(_) => HandleType::Str,
            Self::Pseudo => HandleType::Pseudo,
            Self::Tmpfs => HandleType::Tmpfs,
            Self::Synthetic => HandleType::Synthetic,
            Self::Pipe(_) => HandleType::Pipe,
            Self::Socket(_) => HandleType::Socket,
            Self::Epoll(_) => HandleType::Epoll,
            Self::EventFd(_) => HandleType::EventFd,
        }
    }
}

/// Contents of an in-memory file.
#[derive(Debug)]
pub struct StrInfo {
    data: RankedMutex<Vec<u8>>,
}

impl StrInfo {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: RankedMutex::new(LockRank::Payload, data),
        }
    }

    pub fn lock(&self) -> RankedMutexGuard<'_, Vec<u8>> {
        self.data.lock()
    }
}

#[derive(Debug)]
pub struct PipeInfo {
    name: String,
    /// False for a FIFO that has been created but not yet opened.
    ready_for_ops: AtomicBool,
}

impl PipeInfo {
    pub fn new(name: impl Into<String>, ready_for_ops: bool) -> Self {
        Self {
            name: name.into(),
            ready_for_ops: AtomicBool::new(ready_for_ops),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_ready(&self) -> bool {
        self.ready_for_ops.load(Ordering::Acquire)
    }

    pub fn mark_ready(&self) {
        self.ready_for_ops.store(true, Ordering::Release);
    }
}

#[derive(Debug)]
pub struct EventFdInfo {
    semaphore: bool,
}

impl EventFdInfo {
    pub fn new(semaphore: bool) -> Self {
        Self { semaphore }
    }

    pub fn is_semaphore(&self) -> bool {
        self.semaphore
    }
}

/// Fields of a handle protected by the handle lock.
pub(crate) struct HandleInner {
    pub status: FileStatus,
    /// Every epoll instance watching this handle.
    pub epoll_items: Vec<EpollItem>,
    /// An edge-triggered read-ready notification is still owed.
    pub needs_et_poll_in: bool,
    /// An edge-triggered write-ready notification is still owed.
    pub needs_et_poll_out: bool,
}

/// An open file, pipe, socket, epoll instance, or event notifier.
///
/// Fields other than the status flags, position, and epoll links never change after the handle
/// is built and are read without locking.
pub struct Handle {
    info: HandleInfo,
    mode: FileMode,
    fs: Option<Arc<dyn Filesystem>>,
    dentry: Option<Arc<Dentry>>,
    /// Cached from `dentry` when the handle is built.
    inode: Option<Arc<Inode>>,
    uri: Option<String>,
    /// The platform stream of non-socket handles. Sockets keep theirs in [`SocketInfo`].
    stream: Option<Box<dyn PalStream>>,
    pos: RankedMutex<u64>,
    inner: RankedMutex<HandleInner>,
}

/// Builds a [`Handle`]. Returned by [`Handle::allocate`].
pub struct HandleBuilder {
    info: HandleInfo,
    mode: FileMode,
    status: FileStatus,
    fs: Option<Arc<dyn Filesystem>>,
    dentry: Option<Arc<Dentry>>,
    uri: Option<String>,
    stream: Option<Box<dyn PalStream>>,
}

impl HandleBuilder {
    pub fn mode(mut self, mode: FileMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn status(mut self, status: FileStatus) -> Self {
        self.status = status;
        self
    }

    /// Set the mode and status from `open()`-style flags. Flags that are neither are ignored.
    pub fn open_flags(self, flags: OFlag) -> Result<Self, Errno> {
        let (mode, remaining) = FileMode::from_o_flags(flags)?;
        let (status, _) = FileStatus::from_o_flags(remaining);
        Ok(self.mode(mode).status(status))
    }

    pub fn fs(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    pub fn dentry(mut self, dentry: Arc<Dentry>) -> Self {
        self.dentry = Some(dentry);
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    pub fn stream(mut self, stream: Box<dyn PalStream>) -> Self {
        self.stream = Some(stream);
        self
    }

    /// Returns the only reference to the new handle.
    pub fn build(self) -> HandleRef {
        let inode = self.dentry.as_ref().and_then(|d| d.inode().cloned());
        let handle = Handle {
            info: self.info,
            mode: self.mode,
            fs: self.fs,
            dentry: self.dentry,
            inode,
            uri: self.uri,
            stream: self.stream,
            pos: RankedMutex::new(LockRank::Position, 0),
            inner: RankedMutex::new(
                LockRank::Handle,
                HandleInner {
                    status: self.status,
                    epoll_items: Vec::new(),
                    needs_et_poll_in: false,
                    needs_et_poll_out: false,
                },
            ),
        };
        trace!("Allocated {:?} handle", handle.handle_type());
        Arc::new(handle)
    }
}

impl Handle {
    /// Start building a handle with the given type-specific state. The handle defaults to
    /// read-write access and empty status flags.
    pub fn allocate(info: HandleInfo) -> HandleBuilder {
        HandleBuilder {
            info,
            mode: FileMode::READ | FileMode::WRITE,
            status: FileStatus::empty(),
            fs: None,
            dentry: None,
            uri: None,
            stream: None,
        }
    }

    pub fn handle_type(&self) -> HandleType {
        self.info.handle_type()
    }

    pub fn info(&self) -> &HandleInfo {
        &self.info
    }

    pub fn mode(&self) -> FileMode {
        self.mode
    }

    pub fn fs(&self) -> Option<&Arc<dyn Filesystem>> {
        self.fs.as_ref()
    }

    pub fn dentry(&self) -> Option<&Arc<Dentry>> {
        self.dentry.as_ref()
    }

    pub fn inode(&self) -> Option<&Arc<Inode>> {
        self.inode.as_ref()
    }

    pub fn uri(&self) -> Option<&str> {
        self.uri.as_deref()
    }

    pub fn as_socket(&self) -> Option<&SocketInfo> {
        match &self.info {
            HandleInfo::Socket(x) => Some(x),
            _ => None,
        }
    }

    /// The socket state of a socket handle. Panics for any other type of handle.
    pub fn socket(&self) -> &SocketInfo {
        match &self.info {
            HandleInfo::Socket(x) => x,
            _ => panic!("Expected a socket handle, found {:?}", self.handle_type()),
        }
    }

    pub fn as_epoll(&self) -> Option<&Arc<EpollInstance>> {
        match &self.info {
            HandleInfo::Epoll(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&StrInfo> {
        match &self.info {
            HandleInfo::Str(x) => Some(x),
            _ => None,
        }
    }

    pub fn as_pipe(&self) -> Option<&PipeInfo> {
        match &self.info {
            HandleInfo::Pipe(x) => Some(x),
            _ => None,
        }
    }

    /// The platform stream backing this handle, if one is open.
    pub fn platform_stream(&self) -> Option<&dyn PalStream> {
        match &self.info {
            HandleInfo::Socket(sock) => sock.stream(),
            _ => self.stream.as_deref(),
        }
    }

    pub(crate) fn lock(&self) -> RankedMutexGuard<'_, HandleInner> {
        self.inner.lock()
    }

    /// Lock the file position. Must be taken before the inode and handle locks, and only by
    /// operations that use and update the position (not by `pread`-style calls).
    pub fn lock_pos(&self) -> RankedMutexGuard<'_, u64> {
        self.pos.lock()
    }

    /// Lock the inode (if any) and then the handle.
    pub(crate) fn lock_inode_and_handle(
        &self,
    ) -> (
        Option<RankedMutexGuard<'_, InodeData>>,
        RankedMutexGuard<'_, HandleInner>,
    ) {
        let inode = self.inode.as_ref().map(|inode| inode.lock());
        let handle = self.inner.lock();
        (inode, handle)
    }

    pub fn status(&self) -> FileStatus {
        self.lock().status
    }

    pub fn is_nonblocking(&self) -> bool {
        self.status().contains(FileStatus::NONBLOCK)
    }

    /// The `open()`-style flags, including the access mode.
    pub fn open_flags(&self) -> OFlag {
        self.mode.as_o_flags() | self.status().as_o_flags()
    }

    /// Set or clear `O_NONBLOCK`. If a platform stream is already open, its mode is changed first
    /// and the flag is left untouched if that fails.
    pub fn set_nonblocking(&self, on: bool) -> Result<(), Errno> {
        let mut inner = self.lock();

        if inner.status.contains(FileStatus::NONBLOCK) == on {
            return Ok(());
        }

        if let Some(stream) = self.platform_stream() {
            stream.set_nonblocking(on).map_err(|e| {
                debug!("Could not change the nonblocking mode of {:?}: {}", stream, e);
                pal_to_unix_errno(e)
            })?;
        }

        inner.status.set(FileStatus::NONBLOCK, on);
        Ok(())
    }

    pub(crate) fn remove_epoll_item(&self, item_id: u64) -> Option<EpollItem> {
        let mut inner = self.lock();
        let idx = inner.epoll_items.iter().position(|x| x.id() == item_id)?;
        Some(inner.epoll_items.remove(idx))
    }

    pub fn epoll_items_count(&self) -> usize {
        self.lock().epoll_items.len()
    }

    /// Record which edge-triggered notifications are owed.
    pub fn set_needs_et_poll(&self, input: bool, output: bool) {
        let mut inner = self.lock();
        inner.needs_et_poll_in |= input;
        inner.needs_et_poll_out |= output;
    }

    /// Take the owed edge-triggered notifications as `(read, write)`, clearing them.
    pub fn take_needs_et_poll(&self) -> (bool, bool) {
        let mut inner = self.lock();
        let owed = (inner.needs_et_poll_in, inner.needs_et_poll_out);
        inner.needs_et_poll_in = false;
        inner.needs_et_poll_out = false;
        owed
    }

    /// Wake the waiters of every epoll instance watching this handle.
    pub fn interrupt_epolls(&self) {
        // the last reference to an epoll instance may be one we upgrade here, and dropping it
        // takes handle locks, so only drop them after our lock is released
        let mut instances: Vec<Arc<dyn EpollInterrupt>> = Vec::new();

        let inner = self.lock();
        for item in &inner.epoll_items {
            if let Some(epoll) = item.epoll() {
                epoll.notify_waiters(self);
                instances.push(epoll);
            }
        }
        drop(inner);
    }
}

impl std::fmt::Debug for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("type", &self.handle_type())
            .field("mode", &self.mode)
            .field("uri", &self.uri)
            .finish_non_exhaustive()
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        trace!("Destroying {:?} handle", self.handle_type());

        for item in std::mem::take(&mut self.inner.get_mut().epoll_items) {
            if let Some(epoll) = item.epoll() {
                epoll.handle_destroyed(item.id());
            }
        }

        // the platform stream, filesystem, and inode references are released as the fields drop
    }
}

/// Take another reference to `handle`.
pub fn acquire(handle: &HandleRef) -> HandleRef {
    Arc::clone(handle)
}

/// Release a reference, tearing the handle down if it was the last one.
pub fn release(handle: HandleRef) {
    if let Some(handle) = Arc::into_inner(handle) {
        trace!("Released last reference to {:?}", handle);
    }
}
