//! Default application-level connection handler (§4.12, C17): echoes bytes
//! back to the peer. This is the minimal collaborator the distilled spec
//! treats as external; a runnable CLI needs some default behavior, so this
//! plays the role the original source's accept-path handler plays, wired
//! through the same read/write/error event slots every connection has.

use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::rc::Rc;

use mio::net::TcpStream;

use crate::connection::{self, ConnHandle};
use crate::error::ConnectionError;
use crate::reactor::Reactor;

const BUFFER_SIZE: usize = 4096;

type Pending = Rc<RefCell<Vec<u8>>>;

/// Installed as the [`crate::worker_pool::InstallHook`] for the default
/// binary: wraps `stream` in a [`crate::connection::Connection`], installs
/// the read/error event slots, and registers it with `reactor`'s backend.
/// The write slot is left empty (read-only interest) until there is
/// something to flush (§4.12).
pub fn install(reactor: &Reactor, stream: TcpStream) {
    let token = reactor.next_token();
    let conn = connection::create(stream, token);
    install_handlers(&conn);
    if let Err(err) = conn.register(reactor) {
        tracing::warn!(?token, error = %err, "failed to register accepted connection");
        return;
    }
    reactor.insert_connection(conn);
    tracing::debug!(?token, "connection accepted");
}

fn install_handlers(conn: &ConnHandle) {
    let pending: Pending = Rc::new(RefCell::new(Vec::new()));

    let read_conn = conn.clone();
    let read_pending = pending.clone();
    let read_event = crate::event::create(
        "echo-read",
        Box::new(move |reactor: &Reactor| on_readable(reactor, &read_conn, &read_pending)),
    );
    *conn.read.borrow_mut() = Some(read_event);

    let error_conn = conn.clone();
    let error_event = crate::event::create(
        "echo-error",
        Box::new(move |reactor: &Reactor| on_error(reactor, &error_conn)),
    );
    *conn.error.borrow_mut() = Some(error_event);
}

fn on_readable(reactor: &Reactor, conn: &ConnHandle, pending: &Pending) {
    let mut buf = [0u8; BUFFER_SIZE];
    loop {
        let read = conn.stream.borrow_mut().read(&mut buf);
        match read {
            Ok(0) => {
                tracing::debug!(token = ?conn.token, "peer closed");
                conn.schedule_close(reactor);
                return;
            }
            Ok(n) => pending.borrow_mut().extend_from_slice(&buf[..n]),
            Err(err) => match ConnectionError::classify(err) {
                ConnectionError::TransientIo => break,
                other => {
                    tracing::warn!(token = ?conn.token, error = %other, "read failed");
                    conn.schedule_close(reactor);
                    return;
                }
            },
        }
    }
    if !pending.borrow().is_empty() {
        flush_pending(reactor, conn, pending);
    }
}

fn on_writable(reactor: &Reactor, conn: &ConnHandle, pending: &Pending) {
    if pending.borrow().is_empty() {
        disarm_write(reactor, conn);
        return;
    }
    flush_pending(reactor, conn, pending);
}

fn on_error(reactor: &Reactor, conn: &ConnHandle) {
    tracing::warn!(token = ?conn.token, "connection error notified by backend");
    conn.schedule_close(reactor);
}

/// Writes as much of `pending` as the socket accepts right now, then arms
/// the write event for the remainder on a partial write, or disarms it
/// (back to read-only interest) once everything has been flushed (§4.12).
fn flush_pending(reactor: &Reactor, conn: &ConnHandle, pending: &Pending) {
    let wrote_all = {
        let mut buf = pending.borrow_mut();
        let written = {
            let mut stream = conn.stream.borrow_mut();
            match write_all_nonblocking(&mut stream, &buf) {
                Ok(n) => n,
                Err(err) => {
                    drop(stream);
                    tracing::warn!(token = ?conn.token, error = %err, "write failed");
                    conn.schedule_close(reactor);
                    return;
                }
            }
        };
        buf.drain(..written);
        buf.is_empty()
    };
    if wrote_all {
        disarm_write(reactor, conn);
    } else {
        arm_write(reactor, conn, pending);
    }
}

fn arm_write(reactor: &Reactor, conn: &ConnHandle, pending: &Pending) {
    if conn.write.borrow().is_some() {
        return;
    }
    let write_conn = conn.clone();
    let write_pending = pending.clone();
    let event = crate::event::create(
        "echo-write",
        Box::new(move |reactor: &Reactor| on_writable(reactor, &write_conn, &write_pending)),
    );
    *conn.write.borrow_mut() = Some(event);
    if let Err(err) = conn.reregister(reactor) {
        tracing::warn!(token = ?conn.token, error = %err, "reregister failed while arming write");
        conn.schedule_close(reactor);
    }
}

fn disarm_write(reactor: &Reactor, conn: &ConnHandle) {
    if conn.write.borrow().is_none() {
        return;
    }
    *conn.write.borrow_mut() = None;
    if let Err(err) = conn.reregister(reactor) {
        tracing::warn!(token = ?conn.token, error = %err, "reregister failed while disarming write");
        conn.schedule_close(reactor);
    }
}

/// Writes as much of `data` as the socket accepts before hitting
/// `WouldBlock`, returning the number of bytes consumed. A partial write is
/// not an error; the caller re-arms for the remainder.
fn write_all_nonblocking(stream: &mut TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut consumed = 0;
    while consumed < data.len() {
        match stream.write(&data[consumed..]) {
            Ok(0) => break,
            Ok(n) => consumed += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(consumed)
}
