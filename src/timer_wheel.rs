//! Timer wheel (§4.4, C4): an ordered set of events keyed by absolute expiry.
//!
//! The teacher's historical `timer.rs` used a tick-indexed slab wheel with a
//! `Vec<WheelEntry>` of doubly-linked buckets. This crate's reactor is not on
//! a fixed tick cadence (it recomputes the next wakeup from the minimum
//! expiry every iteration, per §4.9), so a `BTreeMap` keyed by
//! `(expiry_ms, insertion_seq)` gives the same O(log n) insert/remove/min
//! with exact millisecond resolution and a free, stable tie-break via the
//! sequence number, instead of reimplementing a tick wheel.

use std::collections::BTreeMap;

use crate::event::Event;

#[derive(Default)]
pub struct TimerWheel {
    entries: BTreeMap<(u64, u64), Event>,
    next_seq: u64,
}

impl TimerWheel {
    pub fn new() -> TimerWheel {
        TimerWheel {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Arms `event` for `expiry_ms`. If `event` was already timer-set, it is
    /// removed from its old slot first (§4.4 re-insert rule).
    pub fn insert(&mut self, event: Event, expiry_ms: u64) {
        if event.borrow().is_timer_set() {
            self.remove(&event);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        event.borrow().set_timer(expiry_ms, seq);
        self.entries.insert((expiry_ms, seq), event);
    }

    /// Removes `event` from the wheel if it is currently timer-set. No-op
    /// otherwise, matching the idempotence property in §8.
    pub fn remove(&mut self, event: &Event) {
        let was_set = event.borrow().is_timer_set();
        if !was_set {
            return;
        }
        let key = event.borrow().timer_key();
        self.entries.remove(&key);
        event.borrow().clear_timer();
    }

    /// Smallest armed expiry, or `None` if the wheel is empty (treated as
    /// infinite per §4.9).
    pub fn find_min(&self) -> Option<u64> {
        self.entries.keys().next().map(|(expiry, _)| *expiry)
    }

    /// Removes and returns every event whose expiry is `<= now_ms`, in
    /// expiry order with insertion order as the tie-break, clearing their
    /// `timer_set` flag before returning them.
    pub fn expire(&mut self, now_ms: u64) -> Vec<Event> {
        let due_keys: Vec<(u64, u64)> = self
            .entries
            .range(..=(now_ms, u64::MAX))
            .map(|(key, _)| *key)
            .collect();

        let mut due = Vec::with_capacity(due_keys.len());
        for key in due_keys {
            if let Some(event) = self.entries.remove(&key) {
                event.borrow().clear_timer();
                due.push(event);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event;

    fn dummy_event() -> Event {
        event::create("test", Box::new(|_| {}))
    }

    #[test]
    fn find_min_is_none_when_empty() {
        let wheel = TimerWheel::new();
        assert_eq!(wheel.find_min(), None);
    }

    #[test]
    fn expire_orders_by_expiry_then_insertion() {
        let mut wheel = TimerWheel::new();
        let e30 = dummy_event();
        let e10 = dummy_event();
        let e20 = dummy_event();
        wheel.insert(e30.clone(), 30);
        wheel.insert(e10.clone(), 10);
        wheel.insert(e20.clone(), 20);

        assert_eq!(wheel.find_min(), Some(10));

        let due = wheel.expire(25);
        assert!(rc_eq(&due[0], &e10));
        assert!(rc_eq(&due[1], &e20));
        assert_eq!(due.len(), 2);
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.find_min(), Some(30));
    }

    #[test]
    fn insert_when_already_set_reinserts_at_new_expiry() {
        let mut wheel = TimerWheel::new();
        let e = dummy_event();
        wheel.insert(e.clone(), 100);
        wheel.insert(e.clone(), 5);
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.find_min(), Some(5));
    }

    #[test]
    fn arm_then_disarm_is_a_noop_and_handler_never_fires() {
        use std::cell::Cell;
        use std::rc::Rc;

        let fired = Rc::new(Cell::new(false));
        let fired_clone = fired.clone();
        let e = event::create("never", Box::new(move |_| fired_clone.set(true)));

        let mut wheel = TimerWheel::new();
        wheel.insert(e.clone(), 10);
        wheel.remove(&e);

        assert!(wheel.is_empty());
        assert!(!e.borrow().is_timer_set());
        assert!(wheel.expire(u64::MAX).is_empty());
        assert!(!fired.get());
    }

    fn rc_eq(a: &Event, b: &Event) -> bool {
        std::rc::Rc::ptr_eq(a, b)
    }
}
