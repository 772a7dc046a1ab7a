//! The platform byte-stream interface used by the library OS.
//!
//! A platform exposes named streams. A stream is opened by URI; the URI prefix selects the kind
//! of stream (for example [`URI_PREFIX_PIPE_SRV`] opens the listening side of a named pipe and
//! [`URI_PREFIX_PIPE`] connects to it). Streams are closed by dropping them.
//!
//! [`loopback::LoopbackPal`] implements the named-pipe subset of this interface inside the
//! current process.

use std::fmt::Debug;

mod errors;
pub mod loopback;

pub use errors::PalError;

/// URI prefix for the listening (server) side of a named pipe.
pub const URI_PREFIX_PIPE_SRV: &str = "pipe.srv:";

/// URI prefix for the connecting (client) side of a named pipe.
pub const URI_PREFIX_PIPE: &str = "pipe:";

/// Access mode requested when opening a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

bitflags::bitflags! {
    /// Permission bits applied to streams the platform creates.
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct ShareFlags: u32 {
        const OWNER_R = 0o400;
        const OWNER_W = 0o200;
        const OWNER_X = 0o100;
        const GROUP_R = 0o040;
        const GROUP_W = 0o020;
        const GROUP_X = 0o010;
        const OTHER_R = 0o004;
        const OTHER_W = 0o002;
        const OTHER_X = 0o001;
    }
}

/// Creation policy used when opening a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CreateMode {
    /// Fail if the stream does not exist.
    Never,
    /// Create the stream if it does not exist.
    Try,
    /// Create the stream, failing if it already exists.
    Always,
    /// The stream kind decides; used for pipes.
    Ignored,
}

bitflags::bitflags! {
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct StreamOptions: u32 {
        const NONBLOCK = 1 << 0;
        const CLOEXEC = 1 << 1;
    }
}

/// An open platform stream.
///
/// Operations that do not apply to a given kind of stream keep the default implementation,
/// which reports the matching platform error.
pub trait PalStream: Send + Sync + Debug {
    /// Read into `buf`. Returns 0 at end of stream.
    fn read(&self, _buf: &mut [u8]) -> Result<usize, PalError> {
        Err(PalError::NotConnection)
    }

    /// Write from `buf`, returning how many bytes were accepted.
    fn write(&self, _buf: &[u8]) -> Result<usize, PalError> {
        Err(PalError::NotConnection)
    }

    /// Wait for a client on a listening stream and return the server end of the new connection.
    /// `options` apply to the returned stream; whether the wait itself blocks is decided by this
    /// stream's own nonblocking mode.
    fn wait_for_client(&self, _options: StreamOptions) -> Result<Box<dyn PalStream>, PalError> {
        Err(PalError::NotServer)
    }

    /// Switch the stream between blocking and nonblocking mode.
    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), PalError>;

    fn is_nonblocking(&self) -> bool;
}

/// A platform that can open named streams.
pub trait Platform: Send + Sync {
    fn stream_open(
        &self,
        uri: &str,
        access: Access,
        share: ShareFlags,
        create: CreateMode,
        options: StreamOptions,
    ) -> Result<Box<dyn PalStream>, PalError>;
}
