//! Posted-event queue (§4.7, C7): a single-reactor-owned deferred-callback
//! FIFO, never touched from another thread.

use crate::event::{Event, EventInner};
use crate::queue::IntrusiveQueue;
use crate::reactor::Reactor;

#[derive(Default)]
pub struct PostedQueue {
    queue: IntrusiveQueue<EventInner>,
}

impl PostedQueue {
    pub fn new() -> PostedQueue {
        PostedQueue {
            queue: IntrusiveQueue::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Posts `event`. Asserts `!event.posted` per §4.5.
    pub fn post(&mut self, event: Event) {
        debug_assert!(
            !event.borrow().is_posted(),
            "post() on an already-posted event '{}'",
            event.borrow().label()
        );
        event.borrow().set_posted(true);
        self.queue.push_back(event);
    }

    /// Un-posts `event`. Asserts `event.posted` per §4.5. No-op if the event
    /// is already unlinked by the time the caller notices a race is
    /// impossible (single-threaded ownership), so the assert is the only
    /// guard needed.
    pub fn cancel_post(&mut self, event: &Event) {
        debug_assert!(
            event.borrow().is_posted(),
            "cancel_post() on an event that was not posted: '{}'",
            event.borrow().label()
        );
        self.queue.remove(event);
        event.borrow().set_posted(false);
    }

    /// Drains the queue, firing each handler in FIFO order. Events posted
    /// *during* the drain (by a handler calling `post` again) are processed
    /// in the same pass, because `pop_front` re-reads the queue on every
    /// iteration rather than snapshotting its length up front (§4.7, S4).
    pub fn drain(&mut self, reactor: &Reactor) {
        while let Some(event) = self.queue.pop_front() {
            event.borrow().set_posted(false);
            event.borrow().fire(reactor);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;
    use crate::reactor::Reactor;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn post_then_cancel_is_a_noop_and_handler_never_fires() {
        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();
        let ev = event::create("never", Box::new(move |_: &Reactor| fired_clone.set(true)));

        let mut queue = PostedQueue::new();
        queue.post(ev.clone());
        assert!(ev.borrow().is_posted());
        queue.cancel_post(&ev);

        assert!(queue.is_empty());
        assert!(!ev.borrow().is_posted());
        let reactor = Reactor::new("test-cancel-post", 16).expect("reactor");
        queue.drain(&reactor);
        assert!(!fired.get());
    }

    #[test]
    #[should_panic(expected = "already-posted")]
    fn post_twice_without_cancel_panics_in_debug() {
        let ev = event::create("dup", Box::new(|_: &Reactor| {}));
        let mut queue = PostedQueue::new();
        queue.post(ev.clone());
        queue.post(ev);
    }
}
