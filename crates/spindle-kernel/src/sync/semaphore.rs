use crate::sync::spinlock::SpinLock;
use crate::thread::context::ContextSwitch;
use crate::types::ThreadId;
use crate::Kernel;
use std::collections::VecDeque;

struct SemaphoreState {
    count: usize,
    wait_queue: VecDeque<ThreadId>,
}

/// Counting semaphore for logical threads.
///
/// `p` suspends the calling thread through the scheduler rather than the host.
/// A `v` with waiters hands its unit straight to the oldest one, so a woken
/// thread never has to compete for the count again. Interrupt handlers may call
/// `v`; nothing running on the idle thread may call `p`.
pub struct Semaphore {
    state: SpinLock<SemaphoreState>,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Self {
            state: SpinLock::new(SemaphoreState {
                count,
                wait_queue: VecDeque::new(),
            }),
        }
    }

    pub fn p<C: ContextSwitch>(&self, kernel: &Kernel<C>) {
        let old = kernel.disable_interrupts();
        let acquired = {
            let mut state = self.state.lock();
            if state.count > 0 {
                state.count -= 1;
                true
            } else {
                state.wait_queue.push_back(kernel.current());
                false
            }
        };
        if !acquired {
            kernel.stop();
        }
        kernel.restore_interrupts(old);
    }

    pub fn v<C: ContextSwitch>(&self, kernel: &Kernel<C>) {
        let old = kernel.disable_interrupts();
        let waiter = {
            let mut state = self.state.lock();
            let waiter = state.wait_queue.pop_front();
            if waiter.is_none() {
                state.count += 1;
            }
            waiter
        };
        if let Some(thread) = waiter {
            kernel.start(thread);
        }
        kernel.restore_interrupts(old);
    }

    /// Take a unit only if that needs no waiting.
    pub fn try_p(&self) -> bool {
        let mut state = self.state.lock();
        if state.count > 0 {
            state.count -= 1;
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> usize {
        self.state.lock().count
    }

    pub fn waiters(&self) -> usize {
        self.state.lock().wait_queue.len()
    }
}
