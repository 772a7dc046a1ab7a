// defines macros, so must be included first
#[macro_use]
pub mod macros;

pub mod ranked_lock;
pub mod sockaddr;

/// A trait we can use as a compile-time check to make sure that an object is Send.
pub trait IsSend: Send {}

/// A trait we can use as a compile-time check to make sure that an object is Sync.
pub trait IsSync: Sync {}
