//! Event: the fundamental readiness primitive
//!
//! A boolean signal plus a list of weak observers. Everything else in the
//! engine (operation completion, task runnability, resource teardown)
//! ultimately waits on one of these.
//!
//! Observers are never owned by the event: registration stores a `Weak`,
//! and a dead observer is dropped silently at the next notification pass.
//! Each registration is notified at most once per `set()` edge; callers
//! that want level semantics check `is_set()` before registering (that is
//! what the awaitable layer does to skip a scheduling round-trip).
//!
//! Destroying an event with observers still registered delivers a single
//! `Detached` signal to each of them, distinct from `Set`, so a waiter
//! blocked on a vanishing owner is unblocked instead of left dangling.
//!
//! Single-threaded by design: one event belongs to one region's
//! reactor/executor pair and is never touched from another thread.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

/// What an observer is being told.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSignal {
    /// The event transitioned to set
    Set,
    /// The event is being destroyed; the waiter will never be signalled
    Detached,
}

/// Receiver side of an event notification.
pub trait EventObserver {
    fn on_event(&self, signal: EventSignal);
}

/// A level/edge boolean signal with a waiter list.
pub struct Event {
    is_set: Cell<bool>,
    observers: RefCell<Vec<Weak<dyn EventObserver>>>,
}

impl Event {
    pub fn new() -> Rc<Event> {
        Rc::new(Event {
            is_set: Cell::new(false),
            observers: RefCell::new(Vec::new()),
        })
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.is_set.get()
    }

    /// Register an observer for the next `set()` edge.
    ///
    /// Returns `true` without registering when the event is already set,
    /// so an already-ready waiter never pays for a notification cycle.
    pub fn observe(&self, observer: Weak<dyn EventObserver>) -> bool {
        if self.is_set.get() {
            return true;
        }
        self.observers.borrow_mut().push(observer);
        false
    }

    /// Set the event and notify every registered observer once.
    ///
    /// Setting an already-set event is a no-op (no edge, no notification).
    pub fn set(&self) {
        if self.is_set.replace(true) {
            return;
        }
        self.notify(EventSignal::Set);
    }

    /// Clear the flag. Registered observers stay registered; they are
    /// waiting for the next edge.
    pub fn reset(&self) {
        self.is_set.set(false);
    }

    /// Number of live registrations (dead weak refs are not counted).
    pub fn observer_count(&self) -> usize {
        self.observers
            .borrow()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    fn notify(&self, signal: EventSignal) {
        // Swap the list out first: an observer may re-register from inside
        // its callback, and that registration belongs to the next edge.
        let waiters = self.observers.take();
        for weak in waiters {
            if let Some(obs) = weak.upgrade() {
                obs.on_event(signal);
            }
        }
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if !self.observers.get_mut().is_empty() {
            self.notify(EventSignal::Detached);
        }
    }
}

impl std::fmt::Debug for Event {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Event")
            .field("is_set", &self.is_set.get())
            .field("observers", &self.observers.borrow().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        log: RefCell<Vec<EventSignal>>,
    }

    impl Recorder {
        fn new() -> Rc<Recorder> {
            Rc::new(Recorder { log: RefCell::new(Vec::new()) })
        }
        fn log(&self) -> Vec<EventSignal> {
            self.log.borrow().clone()
        }
    }

    impl EventObserver for Recorder {
        fn on_event(&self, signal: EventSignal) {
            self.log.borrow_mut().push(signal);
        }
    }

    fn as_observer(r: &Rc<Recorder>) -> Weak<dyn EventObserver> {
        Rc::downgrade(r) as Weak<dyn EventObserver>
    }

    #[test]
    fn test_set_notifies_once() {
        let ev = Event::new();
        let rec = Recorder::new();
        assert!(!ev.observe(as_observer(&rec)));

        ev.set();
        ev.set(); // second set is not an edge
        assert_eq!(rec.log(), vec![EventSignal::Set]);
        assert!(ev.is_set());
    }

    #[test]
    fn test_observe_already_set_skips_registration() {
        let ev = Event::new();
        ev.set();
        let rec = Recorder::new();
        assert!(ev.observe(as_observer(&rec)));
        assert_eq!(ev.observer_count(), 0);
    }

    #[test]
    fn test_reset_allows_new_edge() {
        let ev = Event::new();
        let rec = Recorder::new();
        ev.observe(as_observer(&rec));
        ev.set();
        ev.reset();
        assert!(!ev.is_set());

        // Registration was consumed by the first edge.
        ev.observe(as_observer(&rec));
        ev.set();
        assert_eq!(rec.log(), vec![EventSignal::Set, EventSignal::Set]);
    }

    #[test]
    fn test_drop_detaches_waiters() {
        let ev = Event::new();
        let rec = Recorder::new();
        ev.observe(as_observer(&rec));
        drop(ev);
        assert_eq!(rec.log(), vec![EventSignal::Detached]);
    }

    #[test]
    fn test_dead_observer_is_skipped() {
        let ev = Event::new();
        let rec = Recorder::new();
        ev.observe(as_observer(&rec));
        drop(rec);
        ev.set(); // must not panic or notify anyone
        assert!(ev.is_set());
    }

    #[test]
    fn test_reregister_from_callback_waits_for_next_edge() {
        struct Rearm {
            ev: RefCell<Option<Rc<Event>>>,
            hits: Cell<usize>,
        }
        impl EventObserver for Rearm {
            fn on_event(&self, signal: EventSignal) {
                if signal == EventSignal::Set {
                    self.hits.set(self.hits.get() + 1);
                }
            }
        }
        let ev = Event::new();
        let rearm = Rc::new(Rearm { ev: RefCell::new(Some(ev.clone())), hits: Cell::new(0) });
        ev.observe(Rc::downgrade(&rearm) as Weak<dyn EventObserver>);
        ev.set();
        assert_eq!(rearm.hits.get(), 1);
        rearm.ev.borrow_mut().take();
    }
}
