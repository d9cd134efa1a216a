//! Error taxonomy for the reactor (see spec §7).
//!
//! Mirrors the shape of the teacher's historical `MioErrorKind` (eof /
//! would-block / sys-error) generalized to the categories this crate's
//! reactor loop actually needs to distinguish.

use std::io;
use thiserror::Error;

/// Errors surfaced by the I/O backend adapter (§4.2).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("fd already registered with this backend")]
    AlreadyRegistered,
    #[error("fd not registered with this backend")]
    NotRegistered,
    #[error("backend I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Errors that abort the process before the reactor can even start (§7
/// `FatalSetup`): bind/listen failures, backend creation failure.
#[derive(Debug, Error)]
pub enum FatalSetupError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to create I/O backend: {0}")]
    Backend(#[from] BackendError),
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] io::Error),
}

/// Per-connection error classification used by the echo handler (§4.12,
/// §7). `TransientIO` never escapes the dispatch loop; it is handled
/// internally as "no work yet".
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("transient I/O condition")]
    TransientIo,
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl ConnectionError {
    /// Classifies a raw I/O error the way §7 asks: `WouldBlock`/`Interrupted`
    /// are transient, everything else is a hard backend error.
    pub fn classify(err: io::Error) -> ConnectionError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => ConnectionError::TransientIo,
            _ => ConnectionError::Backend(BackendError::Io(err)),
        }
    }
}

/// Outcome of classifying an `accept()` failure (§7 `ResourceExhaustion`):
/// distinct from [`ConnectionError`] because `EMFILE`/`ENFILE` are only
/// meaningful on the accept path, not on an already-registered connection.
#[derive(Debug, Error)]
pub enum AcceptError {
    #[error("no more connections pending")]
    TransientIo,
    #[error("file descriptor table exhausted: {0}")]
    ResourceExhaustion(io::Error),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl AcceptError {
    /// `EMFILE`/`ENFILE` break the accept loop without aborting the process
    /// (§7: "admission control is out of scope"); everything else not
    /// transient is logged as a hard backend error by the caller.
    pub fn classify(err: io::Error) -> AcceptError {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => AcceptError::TransientIo,
            _ => {
                #[cfg(unix)]
                {
                    if matches!(err.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                        return AcceptError::ResourceExhaustion(err);
                    }
                }
                AcceptError::Backend(BackendError::Io(err))
            }
        }
    }
}
