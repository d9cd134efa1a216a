//! Worker pool lifecycle (§4.10, §5, C10): spawns N reactors, each running
//! its own perpetual loop on a dedicated thread, and round-robins accepted
//! connections onto them via their hand-off queues.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread::JoinHandle;

use mio::net::TcpStream;

use crate::error::FatalSetupError;
use crate::handoff::HandoffQueue;
use crate::reactor::{LoopMode, Reactor, StopHandle};

struct Worker {
    handoff: Arc<HandoffQueue<TcpStream>>,
    join: JoinHandle<()>,
    stop: StopHandle,
}

/// Owns the pool of worker threads and the round-robin cursor used to
/// dispatch accepted connections onto them (§4.10). A pool of size zero is
/// valid: the master then handles every connection itself (§4.1 "a
/// configuration with zero workers is valid").
pub struct WorkerPool {
    workers: Vec<Worker>,
    cursor: AtomicUsize,
}

/// Invoked once per accepted connection, on the worker reactor's own thread,
/// to turn the raw `TcpStream` into a live connection with its event slots
/// installed (§4.12). The pool is agnostic to what this does.
pub type InstallHook = fn(&Reactor, TcpStream);

impl WorkerPool {
    /// Spawns `count` worker reactors and blocks until all of them have
    /// reached the barrier inside their own thread, synchronized with the
    /// caller through an `(count + 1)`-party barrier (§4.10, §5, S6). `count
    /// == 0` is valid and returns an empty, immediately-ready pool.
    pub fn spawn(count: usize, events_capacity: usize) -> Result<WorkerPool, FatalSetupError> {
        let barrier = Arc::new(Barrier::new(count + 1));
        let mut workers = Vec::with_capacity(count);

        for index in 0..count {
            let reactor = Reactor::new(format!("worker-{index}"), events_capacity)
                .map_err(FatalSetupError::Backend)?;
            let handoff = reactor.handoff();
            let stop = reactor.stop_handle();
            let worker_barrier = barrier.clone();

            let join = std::thread::Builder::new()
                .name(format!("reactor-worker-{index}"))
                .spawn(move || {
                    worker_barrier.wait();
                    reactor.run(LoopMode::Perpetual);
                })
                .expect("failed to spawn worker thread");

            workers.push(Worker {
                handoff,
                join,
                stop,
            });
        }

        barrier.wait();
        Ok(WorkerPool {
            workers,
            cursor: AtomicUsize::new(0),
        })
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Hands `stream` to the next worker in round-robin order (§4.10). The
    /// cursor is only ever advanced from the master thread, so a plain
    /// `fetch_add` with `Relaxed` ordering is enough -- there is no other
    /// writer to synchronize with.
    pub fn dispatch(&self, stream: TcpStream, install: InstallHook) {
        debug_assert!(!self.workers.is_empty(), "dispatch on an empty pool");
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        self.workers[index]
            .handoff
            .safe_add(stream, move |reactor, stream| install(reactor, stream));
    }

    /// Signals every worker to stop after its current iteration and joins
    /// all threads (§4.10 graceful shutdown). Blocks until every worker
    /// thread has exited.
    pub fn shutdown(self) {
        for worker in &self.workers {
            worker.stop.request_stop();
        }
        for worker in self.workers {
            if let Err(panic) = worker.join.join() {
                tracing::error!(?panic, "worker thread panicked during shutdown");
            }
        }
    }
}
