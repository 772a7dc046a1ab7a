//! The link between handles and the epoll instances watching them.
//!
//! A watched handle keeps one [`EpollItem`] per epoll instance. Whenever the handle's readiness
//! may have changed it calls [`Handle::interrupt_epolls`], which reaches each instance through
//! the [`EpollInterrupt`] hook. The handle never needs to know what kind of instance is on the
//! other side.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use crossbeam::channel::{Receiver, Sender, TrySendError};
use log::*;
use nix::errno::Errno;

use super::handle::{Handle, HandleRef};
use crate::utility::ranked_lock::{LockRank, RankedMutex};

/// Notifications an epoll instance receives from the handles it watches.
pub trait EpollInterrupt: Send + Sync {
    /// The readiness of `handle` may have changed; wake waiters so they re-evaluate it. Called
    /// with the handle's lock held, so implementations must not take handle or socket locks.
    fn notify_waiters(&self, handle: &Handle);

    /// The handle watched through item `item_id` is being destroyed.
    fn handle_destroyed(&self, item_id: u64);
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct EpollEvents: u32 {
        const EPOLLIN = libc::EPOLLIN as u32;
        const EPOLLPRI = libc::EPOLLPRI as u32;
        const EPOLLOUT = libc::EPOLLOUT as u32;
        const EPOLLERR = libc::EPOLLERR as u32;
        const EPOLLHUP = libc::EPOLLHUP as u32;
        const EPOLLRDHUP = libc::EPOLLRDHUP as u32;
        const EPOLLONESHOT = libc::EPOLLONESHOT as u32;
        const EPOLLET = libc::EPOLLET as u32;
    }
}

static NEXT_ITEM_ID: AtomicU64 = AtomicU64::new(0);

/// A watched handle's reference to one epoll instance.
pub struct EpollItem {
    id: u64,
    epoll: Weak<dyn EpollInterrupt>,
    events: EpollEvents,
    data: u64,
}

impl EpollItem {
    pub fn new(epoll: Weak<dyn EpollInterrupt>, events: EpollEvents, data: u64) -> Self {
        Self {
            id: NEXT_ITEM_ID.fetch_add(1, Ordering::Relaxed),
            epoll,
            events,
            data,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn events(&self) -> EpollEvents {
        self.events
    }

    pub fn data(&self) -> u64 {
        self.data
    }

    /// The epoll instance, unless it has already been destroyed.
    pub fn epoll(&self) -> Option<Arc<dyn EpollInterrupt>> {
        self.epoll.upgrade()
    }

    fn belongs_to(&self, epoll: &Weak<dyn EpollInterrupt>) -> bool {
        self.epoll.ptr_eq(epoll)
    }
}

struct WatchedItem {
    id: u64,
    handle: Weak<Handle>,
    events: EpollEvents,
    data: u64,
}

#[derive(Default)]
struct EpollState {
    items: Vec<WatchedItem>,
    waiters: Vec<Sender<()>>,
    /// Where the next scan over `items` starts, so that a busy item can't starve the rest.
    last_returned_index: usize,
}

/// The state of an epoll handle: what it watches and who is waiting on it.
pub struct EpollInstance {
    state: RankedMutex<EpollState>,
}

impl EpollInstance {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: RankedMutex::with_default(LockRank::Epoll),
        })
    }

    /// Register a waiter. The receiver gets a message each time a watched handle interrupts
    /// this instance; pending messages coalesce.
    pub fn register_waiter(&self) -> Receiver<()> {
        let (sender, receiver) = crossbeam::channel::bounded(1);
        self.state.lock().waiters.push(sender);
        receiver
    }

    pub fn items_count(&self) -> usize {
        self.state.lock().items.len()
    }

    /// The live watched handles with their events and user data, starting after the item
    /// returned last time.
    pub fn watched(&self) -> Vec<(HandleRef, EpollEvents, u64)> {
        let mut state = self.state.lock();
        let len = state.items.len();
        if len == 0 {
            return Vec::new();
        }

        let start = state.last_returned_index % len;
        let watched = state.items[start..]
            .iter()
            .chain(state.items[..start].iter())
            .filter_map(|item| Some((item.handle.upgrade()?, item.events, item.data)))
            .collect();
        state.last_returned_index = (start + 1) % len;
        watched
    }
}

impl EpollInterrupt for EpollInstance {
    fn notify_waiters(&self, handle: &Handle) {
        let mut state = self.state.lock();
        trace!(
            "Waking {} epoll waiters for {:?}",
            state.waiters.len(),
            handle.handle_type()
        );
        // a full channel already has a wakeup pending
        state
            .waiters
            .retain(|waiter| !matches!(waiter.try_send(()), Err(TrySendError::Disconnected(_))));
    }

    fn handle_destroyed(&self, item_id: u64) {
        self.state.lock().items.retain(|item| item.id != item_id);
    }
}

impl Drop for EpollInstance {
    fn drop(&mut self) {
        for item in std::mem::take(&mut self.state.get_mut().items) {
            if let Some(handle) = item.handle.upgrade() {
                handle.remove_epoll_item(item.id);
            }
        }
    }
}

/// Start watching `target` with the epoll handle `epoll`.
pub fn epoll_add(
    epoll: &HandleRef,
    target: &HandleRef,
    events: EpollEvents,
    data: u64,
) -> Result<(), Errno> {
    let instance = epoll.as_epoll().ok_or(Errno::EINVAL)?;
    if Arc::ptr_eq(epoll, target) {
        return Err(Errno::EINVAL);
    }

    let instance: Arc<dyn EpollInterrupt> = Arc::clone(instance) as Arc<dyn EpollInterrupt>;
    let weak = Arc::downgrade(&instance);

    let mut inner = target.lock();
    if inner.epoll_items.iter().any(|item| item.belongs_to(&weak)) {
        return Err(Errno::EEXIST);
    }

    let item = EpollItem::new(weak, events, data);
    // handle lock, then epoll lock
    if let Some(instance) = epoll.as_epoll() {
        instance.state.lock().items.push(WatchedItem {
            id: item.id(),
            handle: Arc::downgrade(target),
            events,
            data,
        });
    }
    inner.epoll_items.push(item);
    Ok(())
}

/// Stop watching `target` with the epoll handle `epoll`.
pub fn epoll_del(epoll: &HandleRef, target: &HandleRef) -> Result<(), Errno> {
    let instance = epoll.as_epoll().ok_or(Errno::EINVAL)?;
    let weak = Arc::downgrade(&(Arc::clone(instance) as Arc<dyn EpollInterrupt>));

    let item = {
        let mut inner = target.lock();
        let idx = inner
            .epoll_items
            .iter()
            .position(|item| item.belongs_to(&weak))
            .ok_or(Errno::ENOENT)?;
        inner.epoll_items.remove(idx)
    };

    instance.handle_destroyed(item.id());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::descriptor::handle::HandleInfo;
    use std::time::Duration;

    fn epoll_handle() -> HandleRef {
        Handle::allocate(HandleInfo::Epoll(EpollInstance::new())).build()
    }

    #[test]
    fn test_add_and_interrupt() {
        let epoll = epoll_handle();
        let target = Handle::allocate(HandleInfo::Dev).build();
        let waiter = epoll.as_epoll().unwrap().register_waiter();

        epoll_add(&epoll, &target, EpollEvents::EPOLLIN, 42).unwrap();
        assert_eq!(target.epoll_items_count(), 1);
        assert_eq!(epoll.as_epoll().unwrap().items_count(), 1);

        assert!(waiter.try_recv().is_err());
        target.interrupt_epolls();
        target.interrupt_epolls();
        // wakeups coalesce
        assert!(waiter.recv_timeout(Duration::from_secs(5)).is_ok());
        assert!(waiter.try_recv().is_err());

        let watched = epoll.as_epoll().unwrap().watched();
        assert_eq!(watched.len(), 1);
        assert!(Arc::ptr_eq(&watched[0].0, &target));
        assert_eq!(watched[0].1, EpollEvents::EPOLLIN);
        assert_eq!(watched[0].2, 42);
    }

    #[test]
    fn test_add_errors() {
        let epoll = epoll_handle();
        let target = Handle::allocate(HandleInfo::Dev).build();

        assert_eq!(
            epoll_add(&target, &epoll, EpollEvents::EPOLLIN, 0),
            Err(Errno::EINVAL)
        );
        assert_eq!(
            epoll_add(&epoll, &epoll, EpollEvents::EPOLLIN, 0),
            Err(Errno::EINVAL)
        );
        epoll_add(&epoll, &target, EpollEvents::EPOLLIN, 0).unwrap();
        assert_eq!(
            epoll_add(&epoll, &target, EpollEvents::EPOLLOUT, 0),
            Err(Errno::EEXIST)
        );
    }

    #[test]
    fn test_del() {
        let epoll = epoll_handle();
        let target = Handle::allocate(HandleInfo::Dev).build();

        assert_eq!(epoll_del(&epoll, &target), Err(Errno::ENOENT));
        epoll_add(&epoll, &target, EpollEvents::EPOLLIN, 0).unwrap();
        epoll_del(&epoll, &target).unwrap();
        assert_eq!(target.epoll_items_count(), 0);
        assert_eq!(epoll.as_epoll().unwrap().items_count(), 0);
    }

    #[test]
    fn test_destroyed_target_is_forgotten() {
        let epoll = epoll_handle();
        let target = Handle::allocate(HandleInfo::Dev).build();
        epoll_add(&epoll, &target, EpollEvents::EPOLLIN, 0).unwrap();

        drop(target);
        assert_eq!(epoll.as_epoll().unwrap().items_count(), 0);
    }

    #[test]
    fn test_destroyed_epoll_is_unlinked() {
        let epoll = epoll_handle();
        let target = Handle::allocate(HandleInfo::Dev).build();
        epoll_add(&epoll, &target, EpollEvents::EPOLLIN, 0).unwrap();

        drop(epoll);
        assert_eq!(target.epoll_items_count(), 0);
        // nothing left to notify
        target.interrupt_epolls();
    }

    #[test]
    fn test_watched_rotates() {
        let epoll = epoll_handle();
        let a = Handle::allocate(HandleInfo::Dev).build();
        let b = Handle::allocate(HandleInfo::Dev).build();
        epoll_add(&epoll, &a, EpollEvents::EPOLLIN, 1).unwrap();
        epoll_add(&epoll, &b, EpollEvents::EPOLLIN, 2).unwrap();

        let instance = epoll.as_epoll().unwrap();
        let first: Vec<u64> = instance.watched().iter().map(|x| x.2).collect();
        let second: Vec<u64> = instance.watched().iter().map(|x| x.2).collect();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(second, vec![2, 1]);
    }
}
