//! Signal handling (§4.15, C16): SIGINT/SIGTERM wired into the master
//! reactor as a pollable event source, registered on the same backend as
//! every other event source instead of a separate signal thread.

use mio::{Interest, Token};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook_mio::v0_8::Signals;

use crate::backend::Backend;
use crate::error::FatalSetupError;

/// Reserved token for the master's signal event source (§4.15). Distinct
/// from [`crate::reactor::SIGNAL_TOKEN`] only in that this module owns the
/// `Signals` source itself; the reactor re-exports the token constant for
/// its `io_hook` dispatch.
pub struct SignalSource {
    signals: Signals,
}

impl SignalSource {
    /// Creates the signal source and registers it with `backend` for
    /// readable interest under `token`.
    pub fn register(backend: &Backend, token: Token) -> Result<SignalSource, FatalSetupError> {
        let mut signals = Signals::new([SIGINT, SIGTERM]).map_err(FatalSetupError::Signal)?;
        backend
            .register(&mut signals, token, Interest::READABLE)
            .map_err(FatalSetupError::Backend)?;
        Ok(SignalSource { signals })
    }

    /// Drains pending signal numbers. Called from the master's `io_hook`
    /// whenever `token` becomes readable; returns `true` if a termination
    /// signal (SIGINT/SIGTERM) was observed, meaning the master should
    /// begin graceful shutdown.
    pub fn poll_shutdown_requested(&mut self) -> bool {
        let mut requested = false;
        for signal in self.signals.pending() {
            match signal {
                SIGINT | SIGTERM => {
                    tracing::info!(signal, "shutdown signal received");
                    requested = true;
                }
                other => tracing::debug!(signal = other, "ignoring unhandled signal"),
            }
        }
        requested
    }
}
