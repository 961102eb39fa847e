//! Interrupt-level control and delivery of asynchronous completions.
//!
//! Devices finish requests on their own host threads. They never touch kernel
//! state there: they post a handler into the pending queue, and the handler runs
//! on whichever logical thread is current the next time the interrupt level is
//! (or becomes) enabled. Disabling interrupts therefore closes the window between
//! "about to wait" and "completion handled".

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptLevel {
    Disabled,
    Enabled,
}

pub type Handler<K> = Box<dyn FnOnce(&K) + Send>;

struct Pending<K> {
    queue: VecDeque<Handler<K>>,
    /// Lines handed out whose interrupt has not been raised yet.
    outstanding: usize,
}

pub struct InterruptController<K> {
    enabled: AtomicBool,
    pending: Mutex<Pending<K>>,
    arrived: Condvar,
}

impl<K> Default for InterruptController<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> InterruptController<K> {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            pending: Mutex::new(Pending {
                queue: VecDeque::new(),
                outstanding: 0,
            }),
            arrived: Condvar::new(),
        }
    }

    fn pending(&self) -> MutexGuard<'_, Pending<K>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn level(&self) -> InterruptLevel {
        if self.enabled.load(Ordering::Acquire) {
            InterruptLevel::Enabled
        } else {
            InterruptLevel::Disabled
        }
    }

    /// Set the level without delivering anything. Returns the previous level.
    pub fn set_level(&self, level: InterruptLevel) -> InterruptLevel {
        let was = self
            .enabled
            .swap(level == InterruptLevel::Enabled, Ordering::AcqRel);
        if was {
            InterruptLevel::Enabled
        } else {
            InterruptLevel::Disabled
        }
    }

    /// Run pending handlers while the level is enabled. Each handler runs with
    /// interrupts disabled.
    pub fn deliver(&self, kernel: &K) {
        while self.level() == InterruptLevel::Enabled {
            let Some(handler) = self.pending().queue.pop_front() else {
                break;
            };
            self.set_level(InterruptLevel::Disabled);
            handler(kernel);
            self.set_level(InterruptLevel::Enabled);
        }
    }

    /// Hand out a line for one future interrupt.
    pub fn line(self: &Arc<Self>) -> IrqLine<K> {
        self.pending().outstanding += 1;
        IrqLine {
            controller: Arc::clone(self),
            raised: false,
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending().queue.is_empty()
    }

    pub fn outstanding(&self) -> usize {
        self.pending().outstanding
    }

    /// Block the host thread until an interrupt is pending. Returns `false`
    /// without waiting when none can arrive because no line is outstanding.
    pub fn wait(&self) -> bool {
        let pending = self
            .arrived
            .wait_while(self.pending(), |p| p.queue.is_empty() && p.outstanding > 0)
            .unwrap_or_else(PoisonError::into_inner);
        !pending.queue.is_empty()
    }
}

/// One expected interrupt. Dropping an unraised line withdraws it.
pub struct IrqLine<K> {
    controller: Arc<InterruptController<K>>,
    raised: bool,
}

impl<K> IrqLine<K> {
    pub fn raise<F>(mut self, handler: F)
    where
        F: FnOnce(&K) + Send + 'static,
    {
        self.raised = true;
        let mut pending = self.controller.pending();
        pending.queue.push_back(Box::new(handler));
        pending.outstanding -= 1;
        drop(pending);
        self.controller.arrived.notify_all();
    }
}

impl<K> Drop for IrqLine<K> {
    fn drop(&mut self) {
        if !self.raised {
            self.controller.pending().outstanding -= 1;
            self.controller.arrived.notify_all();
        }
    }
}
