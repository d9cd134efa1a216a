//! I/O backend adapter (§4.2, §6, C2): a thin wrapper over `mio::Poll` that
//! presents the minimal register/modify/deregister/wait interface the spec
//! asks for, classifying the errors epoll/kqueue can raise into the
//! `BackendError` taxonomy from §7 instead of leaking raw `io::Error`s with
//! platform-specific errno checks scattered through the reactor.

use std::io;
use std::time::{Duration, Instant};

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::error::BackendError;

pub struct Backend {
    poll: Poll,
    events: Events,
}

impl Backend {
    pub fn new(events_capacity: usize) -> Result<Backend, BackendError> {
        let poll = Poll::new()?;
        Ok(Backend {
            poll,
            events: Events::with_capacity(events_capacity),
        })
    }

    /// A clonable handle used to register a `mio::Waker` or hand sources to
    /// other constructors that want to register before the reactor owns
    /// them.
    pub fn registry(&self) -> &Registry {
        self.poll.registry()
    }

    pub fn register<S: Source>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), BackendError> {
        self.poll
            .registry()
            .register(source, token, interest)
            .map_err(classify)
    }

    pub fn reregister<S: Source>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), BackendError> {
        self.poll
            .registry()
            .reregister(source, token, interest)
            .map_err(classify)
    }

    pub fn deregister<S: Source>(&self, source: &mut S) -> Result<(), BackendError> {
        self.poll.registry().deregister(source).map_err(classify)
    }

    /// Blocks for up to `timeout`, returning the ready set. `timeout` is
    /// always bounded (§4.2: "-1 is NOT used"); the reactor loop computes it
    /// every iteration from the timer wheel and the idle ceiling.
    ///
    /// A stray signal can make the underlying `epoll_wait`/`kevent` return
    /// `EINTR`, which mio surfaces as `io::ErrorKind::Interrupted` rather
    /// than retrying itself. §4.2/§7 classify that as transient and require
    /// it be retried internally, not treated as a fatal backend error, so
    /// this loops with the remaining timeout until it gets a real result.
    pub fn wait(&mut self, timeout: Duration) -> Result<&Events, BackendError> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.poll.poll(&mut self.events, Some(remaining)) {
                Ok(()) => return Ok(&self.events),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(BackendError::Io(err)),
            }
        }
    }
}

/// Classifies a raw `io::Error` from the registry into the §7 taxonomy.
/// `EEXIST`/`ENOENT` from `epoll_ctl` surface through `mio` as plain
/// `io::Error`s with the matching raw OS error code; everything else is an
/// opaque `BackendError::Io`.
fn classify(err: std::io::Error) -> BackendError {
    #[cfg(unix)]
    {
        match err.raw_os_error() {
            Some(code) if code == libc::EEXIST => return BackendError::AlreadyRegistered,
            Some(code) if code == libc::ENOENT => return BackendError::NotRegistered,
            _ => {}
        }
    }
    BackendError::Io(err)
}
