//! Mutexes tagged with their position in the lock hierarchy.
//!
//! Every lock in the handle subsystem has a [`LockRank`]. A thread may only acquire a lock whose
//! rank is strictly greater than the rank of every lock it already holds. Debug builds track the
//! ranks held by each thread and panic on a violation, so an ordering bug shows up on the first
//! run that exercises the bad path rather than as a rare deadlock. Release builds do no tracking.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock ranks, from outermost to innermost.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LockRank {
    /// A descriptor table's entry array.
    DescriptorTable,
    /// A handle's file position.
    Position,
    /// A socket's receive lock (peek buffer).
    Receive,
    /// A socket's state and addresses.
    Socket,
    /// An inode.
    Inode,
    /// A handle's mutable fields.
    Handle,
    /// Type-specific handle payload, such as the contents of an in-memory file.
    Payload,
    /// An epoll instance's item and waiter lists.
    Epoll,
}

#[cfg(debug_assertions)]
thread_local! {
    static HELD: std::cell::RefCell<Vec<LockRank>> = const { std::cell::RefCell::new(Vec::new()) };
}

#[cfg(debug_assertions)]
fn push_rank(rank: LockRank) {
    let violation = HELD
        .try_with(|held| {
            let mut held = held.borrow_mut();
            let innermost = held.iter().max().copied();
            match innermost {
                Some(innermost) if innermost >= rank => Some(innermost),
                _ => {
                    held.push(rank);
                    None
                }
            }
        })
        .ok()
        .flatten();

    if let Some(innermost) = violation {
        panic!("Lock order violation: acquiring {rank:?} while holding {innermost:?}");
    }
}

#[cfg(debug_assertions)]
fn pop_rank(rank: LockRank) {
    // guards may be dropped in any order
    let _ = HELD.try_with(|held| {
        let mut held = held.borrow_mut();
        if let Some(idx) = held.iter().rposition(|x| *x == rank) {
            held.remove(idx);
        }
    });
}

#[cfg(not(debug_assertions))]
fn push_rank(_rank: LockRank) {}

#[cfg(not(debug_assertions))]
fn pop_rank(_rank: LockRank) {}

/// Ranks held by the current thread, outermost first. Always empty in release builds.
pub fn held_ranks() -> Vec<LockRank> {
    #[cfg(debug_assertions)]
    {
        HELD.try_with(|held| held.borrow().clone())
            .unwrap_or_default()
    }
    #[cfg(not(debug_assertions))]
    {
        Vec::new()
    }
}

pub struct RankedMutex<T> {
    rank: LockRank,
    inner: Mutex<T>,
}

impl<T> RankedMutex<T> {
    pub const fn new(rank: LockRank, val: T) -> Self {
        Self {
            rank,
            inner: Mutex::new(val),
        }
    }

    pub fn rank(&self) -> LockRank {
        self.rank
    }

    /// Acquire the lock. Panics in debug builds if the current thread holds a lock of equal or
    /// higher rank.
    pub fn lock(&self) -> RankedMutexGuard<'_, T> {
        push_rank(self.rank);
        // a panic while holding one of these locks already fails the operation that panicked;
        // the protected data is still structurally valid
        let guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        RankedMutexGuard {
            guard,
            rank: self.rank,
        }
    }

    /// Exclusive access without locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn into_inner(self) -> T {
        self.inner
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Default> RankedMutex<T> {
    pub fn with_default(rank: LockRank) -> Self {
        Self::new(rank, T::default())
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RankedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("RankedMutex");
        s.field("rank", &self.rank);
        match self.inner.try_lock() {
            Ok(guard) => s.field("data", &&*guard),
            Err(_) => s.field("data", &"<locked>"),
        };
        s.finish()
    }
}

pub struct RankedMutexGuard<'a, T> {
    guard: MutexGuard<'a, T>,
    rank: LockRank,
}

impl<T> Deref for RankedMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for RankedMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for RankedMutexGuard<'_, T> {
    fn drop(&mut self) {
        pop_rank(self.rank);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_order() {
        let pos = RankedMutex::new(LockRank::Position, 0u64);
        let handle = RankedMutex::new(LockRank::Handle, 1u32);
        let epoll = RankedMutex::new(LockRank::Epoll, ());

        let mut p = pos.lock();
        let h = handle.lock();
        let _e = epoll.lock();
        *p += u64::from(*h);
        assert_eq!(*p, 1);

        #[cfg(debug_assertions)]
        assert_eq!(
            held_ranks(),
            vec![LockRank::Position, LockRank::Handle, LockRank::Epoll]
        );
    }

    #[test]
    fn test_release_out_of_order() {
        let inode = RankedMutex::new(LockRank::Inode, ());
        let handle = RankedMutex::new(LockRank::Handle, ());

        let i = inode.lock();
        let h = handle.lock();
        drop(i);
        drop(h);
        assert!(held_ranks().is_empty());

        // both released, so any order works again
        let _h = handle.lock();
    }

    #[test]
    fn test_per_thread() {
        let handle = RankedMutex::new(LockRank::Handle, 0);
        let _guard = handle.lock();

        let other = std::thread::spawn(|| {
            let inode = RankedMutex::new(LockRank::Inode, ());
            // this thread holds nothing, so a lower rank is fine here
            let _i = inode.lock();
            held_ranks().len()
        });

        #[cfg(debug_assertions)]
        assert_eq!(other.join().unwrap(), 1);
        #[cfg(not(debug_assertions))]
        assert_eq!(other.join().unwrap(), 0);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock order violation")]
    fn test_handle_then_inode() {
        let inode = RankedMutex::new(LockRank::Inode, ());
        let handle = RankedMutex::new(LockRank::Handle, ());

        let _h = handle.lock();
        let _i = inode.lock();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "Lock order violation")]
    fn test_same_rank_twice() {
        let a = RankedMutex::new(LockRank::Handle, ());
        let b = RankedMutex::new(LockRank::Handle, ());

        let _a = a.lock();
        let _b = b.lock();
    }

    #[test]
    fn test_get_mut_does_not_track() {
        let mut m = RankedMutex::new(LockRank::Handle, 5);
        *m.get_mut() += 1;
        assert!(held_ranks().is_empty());
        assert_eq!(m.into_inner(), 6);
    }
}
