//! Connection object (§3, §4.6, C6).

use std::cell::{Cell, RefCell};
use std::net::Shutdown;
use std::rc::Rc;

use mio::net::TcpStream;
use mio::{Interest, Token};

use crate::error::BackendError;
use crate::event::Event;
use crate::reactor::Reactor;

pub struct Connection {
    pub stream: RefCell<TcpStream>,
    pub token: Token,
    pub read: RefCell<Option<Event>>,
    pub write: RefCell<Option<Event>>,
    pub error: RefCell<Option<Event>>,
    registered: Cell<bool>,
}

pub type ConnHandle = Rc<Connection>;

pub fn create(stream: TcpStream, token: Token) -> ConnHandle {
    Rc::new(Connection {
        stream: RefCell::new(stream),
        token,
        read: RefCell::new(None),
        write: RefCell::new(None),
        error: RefCell::new(None),
        registered: Cell::new(false),
    })
}

impl Connection {
    pub fn is_registered(&self) -> bool {
        self.registered.get()
    }

    fn interest(&self) -> Interest {
        if self.write.borrow().is_some() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Registers the connection's fd with the reactor's backend for
    /// readable interest, plus writable if a `write` event slot is
    /// installed, and increments the reactor's connection counter (§4.6).
    pub fn register(self: &Rc<Self>, reactor: &Reactor) -> Result<(), BackendError> {
        debug_assert!(!self.registered.get(), "connection already registered");
        reactor
            .backend
            .borrow()
            .register(&mut *self.stream.borrow_mut(), self.token, self.interest())?;
        self.registered.set(true);
        reactor.connections.set(reactor.connections.get() + 1);
        Ok(())
    }

    /// Updates the backend registration to reflect whether a `write` event
    /// is currently installed (e.g. after arming/disarming write interest in
    /// the echo handler, §4.12).
    pub fn reregister(&self, reactor: &Reactor) -> Result<(), BackendError> {
        debug_assert!(self.registered.get(), "reregister on unregistered connection");
        reactor
            .backend
            .borrow()
            .reregister(&mut *self.stream.borrow_mut(), self.token, self.interest())
    }

    /// Reverse of `register`; decrements the reactor's connection counter.
    pub fn deregister(&self, reactor: &Reactor) -> Result<(), BackendError> {
        if !self.registered.get() {
            return Ok(());
        }
        reactor
            .backend
            .borrow()
            .deregister(&mut *self.stream.borrow_mut())?;
        self.registered.set(false);
        reactor.connections.set(reactor.connections.get() - 1);
        Ok(())
    }

    /// Schedules deregistration and socket teardown via the close-via-timer
    /// pattern (§4.6, §9 "Close-via-timer pattern"): arms a 1 ms timer
    /// whose handler shuts the socket down and drops the connection's last
    /// strong reference, instead of tearing it down inline from inside a
    /// read/write/error handler that may still be on the dispatcher's
    /// current readiness batch.
    pub fn schedule_close(self: &Rc<Self>, reactor: &Reactor) {
        let conn = self.clone();
        let handler = move |reactor: &Reactor| {
            close_now(&conn, reactor);
        };
        let event = crate::event::create("close-timer", Box::new(handler));
        reactor.timers.borrow_mut().insert(event, reactor.clock.cached_now_ms() + 1);
    }
}

fn close_now(conn: &ConnHandle, reactor: &Reactor) {
    if let Err(err) = conn.deregister(reactor) {
        tracing::warn!(error = %err, "deregister failed while closing connection, re-arming");
        conn.schedule_close(reactor);
        return;
    }
    let _ = conn.stream.borrow().shutdown(Shutdown::Both);
    for slot in [&conn.read, &conn.write, &conn.error] {
        if let Some(event) = slot.borrow_mut().take() {
            if event.borrow().is_posted() {
                reactor.posted.borrow_mut().cancel_post(&event);
            }
            if event.borrow().is_timer_set() {
                reactor.timers.borrow_mut().remove(&event);
            }
        }
    }
    reactor.remove_connection(conn.token);
    tracing::debug!(token = ?conn.token, "connection closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    /// Spins up a loopback listener and returns one connected pair as
    /// `mio::net::TcpStream`s, the accepted side already non-blocking.
    fn connected_pair() -> (TcpStream, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("local_addr");
        let client = std::net::TcpStream::connect(addr).expect("connect");
        let (accepted, _peer) = listener.accept().expect("accept");
        accepted.set_nonblocking(true).expect("nonblocking");
        (TcpStream::from_std(accepted), client)
    }

    /// register then deregister leaves the backend state equivalent to
    /// never registered, and the reactor's connection counter returns to 0.
    #[test]
    fn register_then_deregister_is_idempotent_on_counter() {
        let reactor = Reactor::new("test-conn", 16).expect("reactor");
        let (stream, _client) = connected_pair();
        let token = reactor.next_token();
        let conn = create(stream, token);

        conn.register(&reactor).expect("register");
        assert!(conn.is_registered());
        assert_eq!(reactor.connection_count(), 1);

        conn.deregister(&reactor).expect("deregister");
        assert!(!conn.is_registered());
        assert_eq!(reactor.connection_count(), 0);

        // A second deregister is a no-op, not an error.
        conn.deregister(&reactor).expect("deregister again");
        assert_eq!(reactor.connection_count(), 0);
    }

    #[test]
    fn schedule_close_arms_a_one_ms_timer() {
        let reactor = Reactor::new("test-close", 16).expect("reactor");
        let (stream, _client) = connected_pair();
        let token = reactor.next_token();
        let conn = create(stream, token);
        conn.register(&reactor).expect("register");

        conn.schedule_close(&reactor);
        assert_eq!(reactor.timers.borrow().len(), 1);

        reactor.run(crate::reactor::LoopMode::ExitWhenIdle);
        assert_eq!(reactor.connection_count(), 0);
    }
}
