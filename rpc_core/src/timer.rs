// SPDX-License-Identifier: BSD-3-Clause

//! Per-node timers, dispatched by the event loop that node is bound to.
//!
//! A node owns its timers outright; the event loop only ever holds a weak handle to the node
//! itself and walks `Node::timers` each dispatch to find due ones. Removing a node from a loop
//! stops its timers but remembers which were armed, so re-adding the node restores them.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

struct TimerInner {
    callback: RefCell<Box<dyn FnMut()>>,
    interval: Duration,
    periodic: bool,
    is_active: bool,
    reattach_pending: bool,
    next_due: Option<Instant>,
}

/// A handle to a timer created with [`crate::node::NodeHandle::create_timer`].
#[derive(Clone)]
pub struct Timer(Rc<RefCell<TimerInner>>);

impl Timer {
    pub(crate) fn new(callback: Box<dyn FnMut()>) -> Self {
        Timer(Rc::new(RefCell::new(TimerInner {
            callback: RefCell::new(callback),
            interval: Duration::ZERO,
            periodic: false,
            is_active: false,
            reattach_pending: false,
            next_due: None,
        })))
    }

    /// Arm the timer to fire once after `interval`, or every `interval` if `periodic`.
    pub fn start(&self, interval: Duration, periodic: bool) {
        let mut inner = self.0.borrow_mut();
        inner.interval = interval;
        inner.periodic = periodic;
        inner.is_active = true;
        inner.reattach_pending = false;
        inner.next_due = Some(Instant::now() + interval);
    }

    /// Disarm the timer. Does not forget the interval, so `start` with no arguments worth of
    /// state loss isn't needed to resume it.
    pub fn stop(&self) {
        let mut inner = self.0.borrow_mut();
        inner.is_active = false;
        inner.reattach_pending = false;
        inner.next_due = None;
    }

    pub fn is_active(&self) -> bool {
        self.0.borrow().is_active
    }

    pub(crate) fn due_at(&self) -> Option<Instant> {
        let inner = self.0.borrow();
        if inner.is_active {
            inner.next_due
        } else {
            None
        }
    }

    /// Detach this timer from its loop while preserving whether it was armed, for
    /// `EventLoop::del`.
    pub(crate) fn suspend_for_removal(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.is_active {
            inner.is_active = false;
            inner.reattach_pending = true;
        }
    }

    /// Re-arm a timer that was active before its node was removed from a loop, for
    /// `EventLoop::add`.
    pub(crate) fn resume_after_attach(&self) {
        let mut inner = self.0.borrow_mut();
        if inner.reattach_pending {
            inner.reattach_pending = false;
            inner.is_active = true;
            inner.next_due = Some(Instant::now() + inner.interval);
        }
    }

    /// Fire the timer if due, rescheduling it if periodic. No-op (and does not reborrow the
    /// callback) if the timer isn't due yet.
    pub(crate) fn fire_if_due(&self, now: Instant) {
        {
            let mut inner = self.0.borrow_mut();
            match inner.next_due {
                Some(due) if inner.is_active && due <= now => {}
                _ => return,
            }
            if inner.periodic {
                inner.next_due = Some(now + inner.interval);
            } else {
                inner.is_active = false;
                inner.next_due = None;
            }
        }
        (self.0.borrow().callback.borrow_mut())();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn fires_once_then_deactivates() {
        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        let timer = Timer::new(Box::new(move || f.set(f.get() + 1)));
        timer.start(Duration::from_millis(0), false);
        timer.fire_if_due(Instant::now());
        assert_eq!(fired.get(), 1);
        assert!(!timer.is_active());
        timer.fire_if_due(Instant::now());
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn removal_preserves_armed_flag_for_reattach() {
        let timer = Timer::new(Box::new(|| {}));
        timer.start(Duration::from_secs(10), true);
        timer.suspend_for_removal();
        assert!(!timer.is_active());
        timer.resume_after_attach();
        assert!(timer.is_active());
    }
}
