//! The filesystem side of a handle: the backend that serves its reads and writes, and the
//! dentry/inode it was opened through.

use std::sync::Arc;

use nix::errno::Errno;

use super::handle::Handle;
use super::{FileMode, FileStatus};
use crate::utility::ranked_lock::{LockRank, RankedMutex, RankedMutexGuard};

/// A filesystem backend. The position argument is the handle's file position (or the explicit
/// offset of a `pread`-style call) and is advanced by the number of bytes transferred.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &str;

    /// Whether handles of this filesystem have a meaningful file position.
    fn seekable(&self) -> bool {
        true
    }

    fn read(&self, _handle: &Handle, _buf: &mut [u8], _pos: &mut u64) -> Result<usize, Errno> {
        Err(Errno::EINVAL)
    }

    fn write(&self, _handle: &Handle, _buf: &[u8], _pos: &mut u64) -> Result<usize, Errno> {
        Err(Errno::EINVAL)
    }
}

#[derive(Debug, Default)]
pub struct InodeData {
    pub size: u64,
}

#[derive(Debug)]
pub struct Inode {
    ino: u64,
    data: RankedMutex<InodeData>,
}

impl Inode {
    pub fn new(ino: u64) -> Self {
        Self {
            ino,
            data: RankedMutex::with_default(LockRank::Inode),
        }
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Ranks above the handle lock: take this one first when both are needed.
    pub fn lock(&self) -> RankedMutexGuard<'_, InodeData> {
        self.data.lock()
    }
}

#[derive(Debug)]
pub struct Dentry {
    name: String,
    inode: Option<Arc<Inode>>,
}

impl Dentry {
    pub fn new(name: impl Into<String>, inode: Option<Arc<Inode>>) -> Self {
        Self {
            name: name.into(),
            inode,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn inode(&self) -> Option<&Arc<Inode>> {
        self.inode.as_ref()
    }
}

fn fs_for(handle: &Handle, needed: FileMode) -> Result<&Arc<dyn Filesystem>, Errno> {
    if !handle.mode().contains(needed) {
        return Err(Errno::EBADF);
    }
    handle.fs().ok_or(Errno::EBADF)
}

/// `read()`: read at the handle's position and advance it.
pub fn do_handle_read(handle: &Handle, buf: &mut [u8]) -> Result<usize, Errno> {
    let fs = fs_for(handle, FileMode::READ)?;
    if !fs.seekable() {
        return fs.read(handle, buf, &mut 0);
    }
    let mut pos = handle.lock_pos();
    fs.read(handle, buf, &mut *pos)
}

/// `write()`: write at the handle's position and advance it.
pub fn do_handle_write(handle: &Handle, buf: &[u8]) -> Result<usize, Errno> {
    let fs = fs_for(handle, FileMode::WRITE)?;
    if !fs.seekable() {
        return fs.write(handle, buf, &mut 0);
    }
    let mut pos = handle.lock_pos();
    fs.write(handle, buf, &mut *pos)
}

/// `pread()`: read at `offset` without using or taking the handle's position.
pub fn do_handle_pread(handle: &Handle, buf: &mut [u8], offset: u64) -> Result<usize, Errno> {
    let fs = fs_for(handle, FileMode::READ)?;
    if !fs.seekable() {
        return Err(Errno::ESPIPE);
    }
    fs.read(handle, buf, &mut { offset })
}

/// `pwrite()`: write at `offset` without using or taking the handle's position.
pub fn do_handle_pwrite(handle: &Handle, buf: &[u8], offset: u64) -> Result<usize, Errno> {
    let fs = fs_for(handle, FileMode::WRITE)?;
    if !fs.seekable() {
        return Err(Errno::ESPIPE);
    }
    fs.write(handle, buf, &mut { offset })
}

/// Files whose contents are a byte buffer held by the handle itself.
#[derive(Debug, Default)]
pub struct StrFs;

impl Filesystem for StrFs {
    fn name(&self) -> &str {
        "str"
    }

    fn read(&self, handle: &Handle, buf: &mut [u8], pos: &mut u64) -> Result<usize, Errno> {
        let info = handle.as_str().ok_or(Errno::EINVAL)?;
        let data = info.lock();

        let start = usize::try_from(*pos).unwrap_or(usize::MAX).min(data.len());
        let n = std::cmp::min(buf.len(), data.len() - start);
        buf[..n].copy_from_slice(&data[start..][..n]);
        *pos += n as u64;
        Ok(n)
    }

    fn write(&self, handle: &Handle, buf: &[u8], pos: &mut u64) -> Result<usize, Errno> {
        let info = handle.as_str().ok_or(Errno::EINVAL)?;

        let (mut inode, inner) = handle.lock_inode_and_handle();
        let append = inner.status.contains(FileStatus::APPEND);

        let mut data = info.lock();
        if append {
            *pos = data.len() as u64;
        }
        let start = usize::try_from(*pos).map_err(|_| Errno::EFBIG)?;
        let end = start.checked_add(buf.len()).ok_or(Errno::EFBIG)?;
        let cur_len = data.len();
        if end > cur_len {
            data.try_reserve(end - cur_len).map_err(|_| Errno::ENOMEM)?;
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);

        if let Some(inode) = inode.as_mut() {
            inode.size = data.len() as u64;
        }

        *pos += buf.len() as u64;
        Ok(buf.len())
    }
}
