//! The reactor (cycle) and its loop body (§4.9, §3, C9 + C12).

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::TcpStream;
use mio::{Token, Waker};

use crate::backend::Backend;
use crate::connection::ConnHandle;
use crate::error::BackendError;
use crate::handoff::HandoffQueue;
use crate::posted::PostedQueue;
use crate::timer_wheel::TimerWheel;

/// Reserved token for the reactor's own wake-up `mio::Waker` (§4.8). No
/// connection will ever be registered under this token.
pub const WAKE_TOKEN: Token = Token(0);

/// Reserved token for the master's listening socket (§4.11). Chosen from
/// the top of the token space so it never collides with
/// [`Reactor::next_token`]'s incrementing connection tokens.
pub const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// Reserved token for the master's signal event source (§4.15).
pub const SIGNAL_TOKEN: Token = Token(usize::MAX - 2);

/// A hook for non-connection event sources (the listener, the signal fd)
/// that the generic `Connection`-keyed dispatch table doesn't model.
/// Returns `true` if it handled `token`, `false` to let dispatch fall back
/// to the connection table (which will simply find nothing and log, since
/// tokens never collide in practice).
pub type IoHook = Box<dyn FnMut(&Reactor, Token, bool, bool, bool) -> bool>;

/// Idle ceiling used when no timer is armed, and as the hard cap on any
/// computed wait even when a timer *is* armed (§4.9). Kept at 10ms to match
/// the distilled spec's constant.
pub const IDLE_CEILING_MS: u64 = 10;

/// Which termination predicate the loop body uses (§4.9).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum LoopMode {
    /// Terminates once no connections, timers, or posted events remain.
    /// Used by bounded tasks and by a workerless master.
    ExitWhenIdle,
    /// Terminates only when `stop` is set. Used by pool workers.
    Perpetual,
}

pub struct Reactor {
    pub name: String,
    pub clock: crate::clock::Clock,
    pub backend: RefCell<Backend>,
    pub timers: RefCell<TimerWheel>,
    pub posted: RefCell<PostedQueue>,
    pub connections: Cell<usize>,
    stop: Arc<AtomicBool>,
    handoff: Arc<HandoffQueue<TcpStream>>,
    waker: Arc<Waker>,
    table: RefCell<HashMap<Token, ConnHandle>>,
    next_token: Cell<usize>,
    io_hook: RefCell<Option<IoHook>>,
}

/// `Send + Sync` handle used to request a worker's shutdown from another
/// thread (§4.10 graceful shutdown), since `Reactor` itself is moved onto
/// its owning thread and cannot be reached from outside once running.
#[derive(Clone)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }
}

impl Reactor {
    pub fn new(name: impl Into<String>, events_capacity: usize) -> Result<Reactor, BackendError> {
        let backend = Backend::new(events_capacity)?;
        let waker = Arc::new(Waker::new(backend.registry(), WAKE_TOKEN)?);
        Ok(Reactor {
            name: name.into(),
            clock: crate::clock::Clock::new(),
            backend: RefCell::new(backend),
            timers: RefCell::new(TimerWheel::new()),
            posted: RefCell::new(PostedQueue::new()),
            connections: Cell::new(0),
            stop: Arc::new(AtomicBool::new(false)),
            handoff: Arc::new(HandoffQueue::new(waker.clone())),
            waker,
            table: RefCell::new(HashMap::new()),
            next_token: Cell::new(1),
            io_hook: RefCell::new(None),
        })
    }

    /// Installs the hook used to dispatch readiness for non-connection
    /// sources (the listener, the signal fd). The master installs this once
    /// after binding; workers never need one.
    pub fn set_io_hook(&self, hook: impl FnMut(&Reactor, Token, bool, bool, bool) -> bool + 'static) {
        *self.io_hook.borrow_mut() = Some(Box::new(hook));
    }

    /// A clonable handle to this reactor's wake primitive, for callers that
    /// need to register their own `Evented` wake source against the same
    /// `Poll` (e.g. signal handling, §4.15, reuses the listener's token
    /// space instead of the waker's).
    pub fn waker(&self) -> Arc<Waker> {
        self.waker.clone()
    }

    /// A clonable dispatch handle for this reactor's hand-off queue (§4.8).
    /// Callers (the worker pool) grab this *before* moving the `Reactor`
    /// itself into its owning thread, since `HandoffQueue` is `Send + Sync`
    /// even though `Reactor` as a whole is not.
    pub fn handoff(&self) -> Arc<HandoffQueue<TcpStream>> {
        self.handoff.clone()
    }

    /// A clonable handle usable to request this reactor's shutdown from
    /// another thread (§4.10). See [`StopHandle`].
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            flag: self.stop.clone(),
            waker: self.waker.clone(),
        }
    }

    pub fn next_token(&self) -> Token {
        let id = self.next_token.get();
        self.next_token.set(id + 1);
        Token(id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.get()
    }

    pub fn insert_connection(&self, conn: ConnHandle) {
        self.table.borrow_mut().insert(conn.token, conn);
    }

    pub fn remove_connection(&self, token: Token) -> Option<ConnHandle> {
        self.table.borrow_mut().remove(&token)
    }

    /// Requests this reactor's own loop to stop after the current
    /// iteration. Equivalent to calling [`StopHandle::request_stop`] on a
    /// handle obtained from this same reactor.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Runs the loop described in §4.9 until its termination predicate
    /// fires.
    pub fn run(&self, mode: LoopMode) {
        tracing::debug!(reactor = %self.name, ?mode, "reactor loop begin");
        loop {
            self.clock.cache_update();
            let timeout = Duration::from_millis(self.next_timeout_ms());

            let ready = match self.poll_ready(timeout) {
                Ok(ready) => ready,
                Err(err) => {
                    tracing::error!(reactor = %self.name, error = %err, "backend wait failed");
                    break;
                }
            };
            for (token, readable, writable, errored) in ready {
                self.dispatch(token, readable, writable, errored);
            }

            self.clock.cache_update();
            self.expire_timers();
            self.handoff.drain_into(&mut self.posted.borrow_mut());
            self.posted.borrow_mut().drain(self);

            match mode {
                LoopMode::ExitWhenIdle => {
                    if self.connections.get() == 0
                        && self.posted.borrow().is_empty()
                        && self.timers.borrow().is_empty()
                    {
                        break;
                    }
                }
                LoopMode::Perpetual => {
                    if self.stop.load(Ordering::Acquire) {
                        break;
                    }
                }
            }
        }
        tracing::debug!(reactor = %self.name, "reactor loop end");
    }

    fn next_timeout_ms(&self) -> u64 {
        let now = self.clock.cached_now_ms();
        let bound = match self.timers.borrow().find_min() {
            Some(expiry) => expiry.saturating_sub(now),
            None => IDLE_CEILING_MS,
        };
        bound.min(IDLE_CEILING_MS)
    }

    /// Blocks in `backend.wait`, then immediately copies out the
    /// readiness tuples into an owned `Vec` so the `RefCell` borrow of
    /// `backend` is released before `dispatch` runs (a handler may need to
    /// register/reregister/deregister, which also borrows `backend`).
    fn poll_ready(
        &self,
        timeout: Duration,
    ) -> Result<Vec<(Token, bool, bool, bool)>, BackendError> {
        let mut backend = self.backend.borrow_mut();
        let events = backend.wait(timeout)?;
        Ok(events
            .iter()
            .map(|e| (e.token(), e.is_readable(), e.is_writable(), e.is_error()))
            .collect())
    }

    fn expire_timers(&self) {
        let now = self.clock.cached_now_ms();
        let due = self.timers.borrow_mut().expire(now);
        for event in due {
            event.borrow().fire(self);
        }
    }

    fn dispatch(&self, token: Token, readable: bool, writable: bool, errored: bool) {
        if token == WAKE_TOKEN {
            return;
        }
        {
            let mut hook = self.io_hook.borrow_mut();
            if let Some(hook) = hook.as_mut() {
                if hook(self, token, readable, writable, errored) {
                    return;
                }
            }
        }
        let conn = match self.table.borrow().get(&token).cloned() {
            Some(conn) => conn,
            None => {
                tracing::trace!(reactor = %self.name, ?token, "readiness for unknown token, ignoring");
                return;
            }
        };
        if errored {
            if let Some(event) = conn.error.borrow().clone() {
                event.borrow().fire(self);
                return;
            }
        }
        if readable {
            if let Some(event) = conn.read.borrow().clone() {
                event.borrow().fire(self);
            }
        }
        if writable {
            if let Some(event) = conn.write.borrow().clone() {
                event.borrow().fire(self);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// S2: three timers armed for 30/10/20 ms at t=0 fire in ascending
    /// expiry order, not insertion order.
    #[test]
    fn timer_ordering_fires_ascending_by_expiry() {
        let reactor = Reactor::new("test-timer-order", 16).expect("reactor");
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let now = reactor.clock.now_ms();

        for (label, delay) in [("thirty", 30), ("ten", 10), ("twenty", 20)] {
            let order = order.clone();
            let ev = event::create(label, Box::new(move |_: &Reactor| order.borrow_mut().push(label)));
            reactor.timers.borrow_mut().insert(ev, now + delay);
        }

        reactor.run(LoopMode::ExitWhenIdle);

        assert_eq!(*order.borrow(), vec!["ten", "twenty", "thirty"]);
    }

    /// S4: posting A, B, then having A's handler post C, yields A, B, C in
    /// the same drain pass.
    #[test]
    fn posted_fifo_with_in_drain_repost() {
        let reactor = Reactor::new("test-posted-fifo", 16).expect("reactor");
        let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

        let order_c = order.clone();
        let c = event::create("C", Box::new(move |_: &Reactor| order_c.borrow_mut().push("C")));

        let order_a = order.clone();
        let a = event::create(
            "A",
            Box::new(move |r: &Reactor| {
                order_a.borrow_mut().push("A");
                r.posted.borrow_mut().post(c.clone());
            }),
        );

        let order_b = order.clone();
        let b = event::create("B", Box::new(move |_: &Reactor| order_b.borrow_mut().push("B")));

        reactor.posted.borrow_mut().post(a);
        reactor.posted.borrow_mut().post(b);
        reactor.posted.borrow_mut().drain(&reactor);

        assert_eq!(*order.borrow(), vec!["A", "B", "C"]);
    }

    /// S5: an exit-when-idle reactor with no listener and no events exits
    /// within one iteration.
    #[test]
    fn idle_reactor_exits_immediately() {
        let reactor = Reactor::new("test-idle", 16).expect("reactor");
        reactor.run(LoopMode::ExitWhenIdle);
        assert_eq!(reactor.connection_count(), 0);
        assert!(reactor.posted.borrow().is_empty());
        assert!(reactor.timers.borrow().is_empty());
    }
}
