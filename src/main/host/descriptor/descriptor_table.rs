use std::ops::ControlFlow;
use std::sync::Arc;

use log::*;
use nix::errno::Errno;

use super::{release, Descriptor, DescriptorFlags, HandleRef};
use crate::core::configuration::DescriptorOptions;
use crate::utility::ranked_lock::{LockRank, RankedMutex};

/// Where [`DescriptorTable::install`] places a new descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FdPolicy {
    /// The lowest unused descriptor.
    Lowest,
    /// Exactly this descriptor, replacing any handle already there (`dup2()`).
    Exact(u32),
    /// The lowest unused descriptor greater than or equal to this one (`F_DUPFD`).
    AtLeast(u32),
}

struct TableInner {
    map: Vec<Option<Descriptor>>,
    /// One past the highest descriptor in use.
    fd_top: u32,
    max_fds: u32,
}

impl TableInner {
    fn lowest_free(&self, floor: u32) -> u32 {
        (floor..self.fd_top)
            .find(|fd| self.map[*fd as usize].is_none())
            .unwrap_or(std::cmp::max(floor, self.fd_top))
    }

    /// Grow the backing array geometrically so that `fd` is a valid index.
    fn ensure_slot(&mut self, fd: u32) -> Result<(), Errno> {
        let fd = fd as usize;
        if fd < self.map.len() {
            return Ok(());
        }

        let new_len = std::cmp::max(fd + 1, self.map.len() * 2).min(self.max_fds as usize);
        self.map
            .try_reserve_exact(new_len - self.map.len())
            .map_err(|_| Errno::ENOMEM)?;
        trace!("Growing descriptor table from {} to {}", self.map.len(), new_len);
        self.map.resize_with(new_len, || None);
        Ok(())
    }

    // Call after clearing a slot, to lower `fd_top` past any unused tail.
    fn trim_tail(&mut self) {
        while self.fd_top > 0 && self.map[self.fd_top as usize - 1].is_none() {
            self.fd_top -= 1;
        }
    }

    fn take(&mut self, fd: u32) -> Option<Descriptor> {
        let desc = self.map.get_mut(fd as usize)?.take()?;
        self.trim_tail();
        Some(desc)
    }
}

/// Table of descriptors, shared by the threads of a process.
pub struct DescriptorTable {
    inner: RankedMutex<TableInner>,
}

impl DescriptorTable {
    pub fn new() -> Arc<Self> {
        Self::with_options(&DescriptorOptions::default())
    }

    pub fn with_options(options: &DescriptorOptions) -> Arc<Self> {
        let max_fds = std::cmp::max(options.max_fds, 1);
        let initial = std::cmp::min(options.initial_size, max_fds) as usize;
        Arc::new(Self::from_inner(TableInner {
            map: (0..initial).map(|_| None).collect(),
            fd_top: 0,
            max_fds,
        }))
    }

    fn from_inner(inner: TableInner) -> Self {
        Self {
            inner: RankedMutex::new(LockRank::DescriptorTable, inner),
        }
    }

    /// Get a new reference to the handle at `fd`, and the descriptor's flags. The table lock is
    /// only held while the reference is taken.
    pub fn get(&self, fd: u32) -> Result<(HandleRef, DescriptorFlags), Errno> {
        let inner = self.inner.lock();
        let desc = inner
            .map
            .get(fd as usize)
            .and_then(Option::as_ref)
            .ok_or(Errno::EBADF)?;
        Ok((Arc::clone(desc.handle()), desc.flags()))
    }

    /// Install `handle`, taking ownership of the caller's reference, and return its descriptor.
    ///
    /// Fails with `EMFILE` if no descriptor below the table limit is free, or with `EBADF` if
    /// an exact descriptor at or beyond the limit is requested. A handle replaced by
    /// [`FdPolicy::Exact`] is released.
    pub fn install(
        &self,
        handle: HandleRef,
        flags: DescriptorFlags,
        policy: FdPolicy,
    ) -> Result<u32, Errno> {
        let replaced;
        let fd;
        {
            let mut inner = self.inner.lock();

            fd = match policy {
                FdPolicy::Lowest => inner.lowest_free(0),
                FdPolicy::AtLeast(floor) => inner.lowest_free(floor),
                FdPolicy::Exact(fd) => {
                    if fd >= inner.max_fds {
                        return Err(Errno::EBADF);
                    }
                    fd
                }
            };
            if fd >= inner.max_fds {
                return Err(Errno::EMFILE);
            }

            inner.ensure_slot(fd)?;
            replaced = inner.map[fd as usize].replace(Descriptor::new(handle, flags));
            inner.fd_top = std::cmp::max(inner.fd_top, fd + 1);
        }

        match replaced {
            Some(prev) => {
                trace!("Replaced descriptor {}", fd);
                release(prev.into_handle());
            }
            None => trace!("Installed descriptor {}", fd),
        }

        Ok(fd)
    }

    /// Remove the descriptor at `fd`. The caller becomes the owner of the handle reference.
    pub fn detach(&self, fd: u32) -> Result<Descriptor, Errno> {
        let desc = self.inner.lock().take(fd).ok_or(Errno::EBADF)?;
        trace!("Detached descriptor {}", fd);
        Ok(desc)
    }

    /// Change the flags of the descriptor at `fd`.
    pub fn set_flags(&self, fd: u32, flags: DescriptorFlags) -> Result<(), Errno> {
        let mut inner = self.inner.lock();
        let desc = inner
            .map
            .get_mut(fd as usize)
            .and_then(Option::as_mut)
            .ok_or(Errno::EBADF)?;
        desc.set_flags(flags);
        Ok(())
    }

    /// Remove every close-on-exec descriptor, returning them in ascending order.
    pub fn detach_cloexec(&self) -> Vec<(u32, Descriptor)> {
        let mut inner = self.inner.lock();

        let fds: Vec<u32> = inner
            .map
            .iter()
            .enumerate()
            .filter(|(_, d)| matches!(d, Some(d) if d.flags().contains(DescriptorFlags::CLOEXEC)))
            .map(|(fd, _)| fd as u32)
            .collect();

        let detached: Vec<_> = fds
            .into_iter()
            .filter_map(|fd| Some((fd, inner.take(fd)?)))
            .collect();
        trace!("Detached {} close-on-exec descriptors", detached.len());
        detached
    }

    /// A new table with the same capacity and entries, each holding a new reference to its
    /// handle. The tables are independent afterwards.
    pub fn duplicate(&self) -> Result<Arc<Self>, Errno> {
        let inner = self.inner.lock();

        let mut map = Vec::new();
        map.try_reserve_exact(inner.map.len())
            .map_err(|_| Errno::ENOMEM)?;
        map.extend(
            inner
                .map
                .iter()
                .map(|d| d.as_ref().map(|d| d.dup(d.flags()))),
        );

        trace!("Duplicated descriptor table with top {}", inner.fd_top);
        Ok(Arc::new(Self::from_inner(TableInner {
            map,
            fd_top: inner.fd_top,
            max_fds: inner.max_fds,
        })))
    }

    /// Visit every descriptor in ascending order until `f` breaks. The visit works on a snapshot,
    /// so `f` may use the table.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(u32, &Descriptor) -> ControlFlow<()>,
    {
        let snapshot: Vec<(u32, Descriptor)> = {
            let inner = self.inner.lock();
            inner
                .map
                .iter()
                .enumerate()
                .filter_map(|(fd, d)| Some((fd as u32, d.clone()?)))
                .collect()
        };

        for (fd, desc) in &snapshot {
            if f(*fd, desc).is_break() {
                break;
            }
        }
    }

    /// One past the highest descriptor in use.
    pub fn fd_top(&self) -> u32 {
        self.inner.lock().fd_top
    }

    /// Size of the backing array.
    pub fn capacity(&self) -> usize {
        self.inner.lock().map.len()
    }

    /// Number of descriptors in use.
    pub fn count(&self) -> usize {
        self.inner.lock().map.iter().flatten().count()
    }
}

impl std::fmt::Debug for DescriptorTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("DescriptorTable")
            .field("fd_top", &inner.fd_top)
            .field("capacity", &inner.map.len())
            .field("max_fds", &inner.max_fds)
            .finish()
    }
}

impl Drop for DescriptorTable {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        for desc in inner.map.drain(..).flatten() {
            release(desc.into_handle());
        }
    }
}
