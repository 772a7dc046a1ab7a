//! Named pipes implemented inside the current process.
//!
//! A listening stream registers its name in a registry shared by every clone of the
//! [`LoopbackPal`]. Connecting creates a pair of bounded byte channels and queues the server end
//! on the listener's backlog, where [`PalStream::wait_for_client`] picks it up.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use log::*;

use crate::{
    Access, CreateMode, PalError, PalStream, Platform, ShareFlags, StreamOptions, URI_PREFIX_PIPE,
    URI_PREFIX_PIPE_SRV,
};

/// Bytes buffered in each direction of a connection before writers block.
pub const CHANNEL_CAPACITY: usize = 64 * 1024;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wait<'a, T>(cond: &Condvar, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
    cond.wait(guard).unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Registry {
    listeners: Mutex<HashMap<String, Weak<Backlog>>>,
}

/// An in-process platform. Clones share the same namespace of pipe names.
#[derive(Clone, Default)]
pub struct LoopbackPal {
    registry: Arc<Registry>,
}

impl LoopbackPal {
    pub fn new() -> Self {
        Self::default()
    }

    fn listen(
        &self,
        name: &str,
        create: CreateMode,
        options: StreamOptions,
    ) -> Result<Box<dyn PalStream>, PalError> {
        if create == CreateMode::Never {
            return Err(PalError::StreamNotExist);
        }

        let mut listeners = lock(&self.registry.listeners);
        if listeners
            .get(name)
            .map(|backlog| backlog.strong_count() > 0)
            .unwrap_or(false)
        {
            return Err(PalError::StreamExist);
        }

        let backlog = Arc::new(Backlog::default());
        listeners.insert(name.to_string(), Arc::downgrade(&backlog));
        trace!("Listening on pipe '{}'", name);

        Ok(Box::new(ListeningStream {
            name: name.to_string(),
            backlog,
            registry: Arc::clone(&self.registry),
            nonblocking: AtomicBool::new(options.contains(StreamOptions::NONBLOCK)),
        }))
    }

    fn connect(&self, name: &str, options: StreamOptions) -> Result<Box<dyn PalStream>, PalError> {
        let backlog = lock(&self.registry.listeners)
            .get(name)
            .and_then(Weak::upgrade)
            .ok_or(PalError::ConnFailed)?;

        let to_server = Arc::new(Channel::default());
        let to_client = Arc::new(Channel::default());

        let server_end = PipeEnd {
            rx: Arc::clone(&to_server),
            tx: Arc::clone(&to_client),
            nonblocking: AtomicBool::new(false),
        };
        let client_end = PipeEnd {
            rx: to_client,
            tx: to_server,
            nonblocking: AtomicBool::new(options.contains(StreamOptions::NONBLOCK)),
        };

        lock(&backlog.pending).push_back(server_end);
        backlog.cond.notify_one();
        trace!("Connected to pipe '{}'", name);

        Ok(Box::new(client_end))
    }
}

impl Platform for LoopbackPal {
    fn stream_open(
        &self,
        uri: &str,
        _access: Access,
        _share: ShareFlags,
        create: CreateMode,
        options: StreamOptions,
    ) -> Result<Box<dyn PalStream>, PalError> {
        if let Some(name) = uri.strip_prefix(URI_PREFIX_PIPE_SRV) {
            self.listen(name, create, options)
        } else if let Some(name) = uri.strip_prefix(URI_PREFIX_PIPE) {
            self.connect(name, options)
        } else {
            debug!("Unsupported stream uri '{}'", uri);
            Err(PalError::NotSupported)
        }
    }
}

#[derive(Default)]
struct Backlog {
    pending: Mutex<VecDeque<PipeEnd>>,
    cond: Condvar,
}

#[derive(Debug)]
struct ListeningStream {
    name: String,
    backlog: Arc<Backlog>,
    registry: Arc<Registry>,
    nonblocking: AtomicBool,
}

impl PalStream for ListeningStream {
    fn wait_for_client(&self, options: StreamOptions) -> Result<Box<dyn PalStream>, PalError> {
        let mut pending = lock(&self.backlog.pending);
        loop {
            if let Some(end) = pending.pop_front() {
                end.nonblocking
                    .store(options.contains(StreamOptions::NONBLOCK), Ordering::Relaxed);
                return Ok(Box::new(end));
            }
            if self.is_nonblocking() {
                return Err(PalError::TryAgain);
            }
            pending = wait(&self.backlog.cond, pending);
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), PalError> {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
        Ok(())
    }

    fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Relaxed)
    }
}

impl Drop for ListeningStream {
    fn drop(&mut self) {
        let mut listeners = lock(&self.registry.listeners);
        let ours = Arc::downgrade(&self.backlog);
        if listeners
            .get(&self.name)
            .map(|backlog| backlog.ptr_eq(&ours))
            .unwrap_or(false)
        {
            listeners.remove(&self.name);
            trace!("Released pipe name '{}'", self.name);
        }
    }
}

impl std::fmt::Debug for Backlog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backlog")
            .field("pending", &lock(&self.pending).len())
            .finish()
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("listeners", &lock(&self.listeners).len())
            .finish()
    }
}

/// One direction of a connection.
#[derive(Debug)]
struct Channel {
    state: Mutex<ChannelState>,
    cond: Condvar,
}

#[derive(Debug)]
struct ChannelState {
    data: VecDeque<u8>,
    writer_open: bool,
    reader_open: bool,
}

impl Default for Channel {
    fn default() -> Self {
        Self {
            state: Mutex::new(ChannelState {
                data: VecDeque::new(),
                writer_open: true,
                reader_open: true,
            }),
            cond: Condvar::new(),
        }
    }
}

#[derive(Debug)]
struct PipeEnd {
    rx: Arc<Channel>,
    tx: Arc<Channel>,
    nonblocking: AtomicBool,
}

impl PalStream for PipeEnd {
    fn read(&self, buf: &mut [u8]) -> Result<usize, PalError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = lock(&self.rx.state);
        loop {
            if !state.data.is_empty() {
                let n = std::cmp::min(buf.len(), state.data.len());
                for (dst, byte) in buf.iter_mut().zip(state.data.drain(..n)) {
                    *dst = byte;
                }
                self.rx.cond.notify_all();
                return Ok(n);
            }
            if !state.writer_open {
                return Ok(0);
            }
            if self.is_nonblocking() {
                return Err(PalError::TryAgain);
            }
            state = wait(&self.rx.cond, state);
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize, PalError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut state = lock(&self.tx.state);
        loop {
            if !state.reader_open {
                return Err(PalError::ConnFailedPipe);
            }
            let space = CHANNEL_CAPACITY - state.data.len();
            if space > 0 {
                let n = std::cmp::min(space, buf.len());
                state.data.extend(&buf[..n]);
                self.tx.cond.notify_all();
                return Ok(n);
            }
            if self.is_nonblocking() {
                return Err(PalError::TryAgain);
            }
            state = wait(&self.tx.cond, state);
        }
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<(), PalError> {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
        Ok(())
    }

    fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Relaxed)
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        lock(&self.rx.state).reader_open = false;
        self.rx.cond.notify_all();
        lock(&self.tx.state).writer_open = false;
        self.tx.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(pal: &LoopbackPal, uri: &str, options: StreamOptions) -> Result<Box<dyn PalStream>, PalError> {
        pal.stream_open(
            uri,
            Access::ReadWrite,
            ShareFlags::empty(),
            CreateMode::Ignored,
            options,
        )
    }

    #[test]
    fn test_name_in_use() {
        let pal = LoopbackPal::new();
        let _srv = open(&pal, "pipe.srv:abc", StreamOptions::empty()).unwrap();
        assert_eq!(
            open(&pal, "pipe.srv:abc", StreamOptions::empty()).unwrap_err(),
            PalError::StreamExist
        );
    }

    #[test]
    fn test_name_released_on_drop() {
        let pal = LoopbackPal::new();
        let srv = open(&pal, "pipe.srv:abc", StreamOptions::empty()).unwrap();
        drop(srv);
        assert_eq!(
            open(&pal, "pipe:abc", StreamOptions::empty()).unwrap_err(),
            PalError::ConnFailed
        );
        open(&pal, "pipe.srv:abc", StreamOptions::empty()).unwrap();
    }

    #[test]
    fn test_connect_without_listener() {
        let pal = LoopbackPal::new();
        assert_eq!(
            open(&pal, "pipe:nobody", StreamOptions::empty()).unwrap_err(),
            PalError::ConnFailed
        );
    }

    #[test]
    fn test_unknown_prefix() {
        let pal = LoopbackPal::new();
        assert_eq!(
            open(&pal, "file:/etc/passwd", StreamOptions::empty()).unwrap_err(),
            PalError::NotSupported
        );
    }

    #[test]
    fn test_transfer_both_directions() {
        let pal = LoopbackPal::new();
        let srv = open(&pal, "pipe.srv:x", StreamOptions::empty()).unwrap();
        let client = open(&pal, "pipe:x", StreamOptions::empty()).unwrap();
        let server = srv.wait_for_client(StreamOptions::empty()).unwrap();

        assert_eq!(client.write(b"hello").unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");

        assert_eq!(server.write(b"world!").unwrap(), 6);
        assert_eq!(client.read(&mut buf[..3]).unwrap(), 3);
        assert_eq!(&buf[..3], b"wor");
        assert_eq!(client.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"ld!");
    }

    #[test]
    fn test_nonblocking_accept_and_read() {
        let pal = LoopbackPal::new();
        let srv = open(&pal, "pipe.srv:x", StreamOptions::NONBLOCK).unwrap();
        assert_eq!(
            srv.wait_for_client(StreamOptions::empty()).unwrap_err(),
            PalError::TryAgain
        );

        let client = open(&pal, "pipe:x", StreamOptions::NONBLOCK).unwrap();
        let server = srv.wait_for_client(StreamOptions::NONBLOCK).unwrap();
        assert!(server.is_nonblocking());

        let mut buf = [0u8; 4];
        assert_eq!(server.read(&mut buf).unwrap_err(), PalError::TryAgain);
        assert_eq!(client.read(&mut buf).unwrap_err(), PalError::TryAgain);
    }

    #[test]
    fn test_eof_and_broken_pipe() {
        let pal = LoopbackPal::new();
        let srv = open(&pal, "pipe.srv:x", StreamOptions::empty()).unwrap();
        let client = open(&pal, "pipe:x", StreamOptions::empty()).unwrap();
        let server = srv.wait_for_client(StreamOptions::empty()).unwrap();

        client.write(b"ab").unwrap();
        drop(client);

        let mut buf = [0u8; 4];
        assert_eq!(server.read(&mut buf).unwrap(), 2);
        assert_eq!(server.read(&mut buf).unwrap(), 0);
        assert_eq!(server.write(b"x").unwrap_err(), PalError::ConnFailedPipe);
    }

    #[test]
    fn test_nonblocking_write_full() {
        let pal = LoopbackPal::new();
        let srv = open(&pal, "pipe.srv:x", StreamOptions::empty()).unwrap();
        let client = open(&pal, "pipe:x", StreamOptions::NONBLOCK).unwrap();
        let _server = srv.wait_for_client(StreamOptions::empty()).unwrap();

        let data = vec![7u8; CHANNEL_CAPACITY + 10];
        assert_eq!(client.write(&data).unwrap(), CHANNEL_CAPACITY);
        assert_eq!(client.write(&data).unwrap_err(), PalError::TryAgain);
    }

    #[test]
    fn test_blocking_accept_wakes() {
        let pal = LoopbackPal::new();
        let srv = open(&pal, "pipe.srv:x", StreamOptions::empty()).unwrap();

        let connector = {
            let pal = pal.clone();
            std::thread::spawn(move || {
                let client = open(&pal, "pipe:x", StreamOptions::empty()).unwrap();
                client.write(b"ping").unwrap();
                client
            })
        };

        let server = srv.wait_for_client(StreamOptions::empty()).unwrap();
        let mut buf = [0u8; 4];
        let mut read = 0;
        while read < buf.len() {
            read += server.read(&mut buf[read..]).unwrap();
        }
        assert_eq!(&buf, b"ping");
        connector.join().unwrap();
    }
}
