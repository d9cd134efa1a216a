//! Event objects (§3, §4.5, C5).
//!
//! An `Event` bundles a handler closure with the bookkeeping the reactor
//! needs to know whether the event is currently posted, currently timer-set,
//! or neither. The distilled spec models this as `handler` + opaque `data`
//! pointer + flags; in safe Rust the closure captures whatever state it
//! needs directly (a `Weak<RefCell<Connection>>`, an `fd`, ...), which is the
//! idiomatic equivalent of "callback + opaque data" -- see DESIGN.md.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::queue::{Link, Linked};
use crate::reactor::Reactor;

/// A handler runs to completion and cannot fail across the loop boundary
/// (§7 propagation rule): any fallible work inside must be caught and
/// logged by the handler itself.
pub type Handler = Box<dyn FnMut(&Reactor)>;

pub struct EventInner {
    handler: RefCell<Handler>,
    posted: Cell<bool>,
    timer_set: Cell<bool>,
    /// Absolute expiry in ms; meaningful only while `timer_set` is true.
    expiry_ms: Cell<u64>,
    /// Insertion sequence used as the timer wheel's tie-break key, also
    /// doubling as the key the wheel needs to remove this event in O(log n)
    /// without a linear scan.
    timer_seq: Cell<u64>,
    link: Link<EventInner>,
    /// Short tag used only for tracing output (e.g. "accept", "echo-read").
    label: &'static str,
}

pub type Event = Rc<RefCell<EventInner>>;

impl Linked for EventInner {
    fn link(&self) -> &Link<EventInner> {
        &self.link
    }
}

/// Creates a new event in neither the posted nor the timer-set state.
pub fn create(label: &'static str, handler: Handler) -> Event {
    Rc::new(RefCell::new(EventInner {
        handler: RefCell::new(handler),
        posted: Cell::new(false),
        timer_set: Cell::new(false),
        expiry_ms: Cell::new(0),
        timer_seq: Cell::new(0),
        link: Link::default(),
        label,
    }))
}

impl EventInner {
    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn is_posted(&self) -> bool {
        self.posted.get()
    }

    pub fn is_timer_set(&self) -> bool {
        self.timer_set.get()
    }

    pub fn expiry_ms(&self) -> u64 {
        self.expiry_ms.get()
    }

    pub(crate) fn set_posted(&self, value: bool) {
        self.posted.set(value);
    }

    pub(crate) fn set_timer(&self, expiry_ms: u64, seq: u64) {
        self.timer_set.set(true);
        self.expiry_ms.set(expiry_ms);
        self.timer_seq.set(seq);
    }

    pub(crate) fn clear_timer(&self) {
        self.timer_set.set(false);
    }

    pub(crate) fn timer_key(&self) -> (u64, u64) {
        (self.expiry_ms.get(), self.timer_seq.get())
    }

    /// Invokes the handler. The caller is responsible for having already
    /// cleared whichever flag (`posted`/`timer_set`) made this event
    /// runnable, per the spec invariant that the flag is false before the
    /// handler observes the event.
    pub fn fire(&self, reactor: &Reactor) {
        (self.handler.borrow_mut())(reactor);
    }
}

/// Asserts the destruction precondition from §4.5/§4.6: an event may only be
/// dropped once it is neither posted nor timer-set. Debug-only, matching the
/// spec's "abort on unrecoverable invariant violation" (§7) -- a release
/// build trusts its own bookkeeping.
pub fn debug_assert_destroyable(event: &Event) {
    let inner = event.borrow();
    debug_assert!(
        !inner.is_posted() && !inner.is_timer_set(),
        "event '{}' destroyed while still posted or timer-set",
        inner.label()
    );
}
