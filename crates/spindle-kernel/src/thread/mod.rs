pub mod context;
pub mod scheduler;
pub mod tcb;

use crate::error::KernelError;
use crate::interrupt::InterruptLevel;
use crate::types::ThreadId;
use crate::Kernel;
use context::ContextSwitch;
use log::{debug, warn};
use scheduler::{RoundRobinScheduler, Scheduler};
use std::collections::{HashMap, VecDeque};
use tcb::{ThreadControlBlock, ThreadState};

/// Process-wide scheduler state: every live TCB, the ready and exited queues
/// and the running thread.
pub struct ThreadManager<C: ContextSwitch> {
    pub threads: HashMap<ThreadId, ThreadControlBlock<C>>,
    pub scheduler: Box<dyn Scheduler>,
    pub exited: VecDeque<ThreadId>,
    pub current_thread: ThreadId,
    pub next_id: u32,
}

impl<C: ContextSwitch> Default for ThreadManager<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: ContextSwitch> ThreadManager<C> {
    pub fn new() -> Self {
        let mut threads = HashMap::new();
        threads.insert(ThreadId::IDLE, ThreadControlBlock::idle());

        Self {
            threads,
            scheduler: Box::new(RoundRobinScheduler::new()),
            exited: VecDeque::new(),
            current_thread: ThreadId::IDLE,
            next_id: 1,
        }
    }

    /// Live TCBs, the idle thread included.
    pub fn live_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn state_of(&self, id: ThreadId) -> Option<ThreadState> {
        self.threads.get(&id).map(|tcb| tcb.state)
    }

    pub fn count_in(&self, state: ThreadState) -> usize {
        self.threads.values().filter(|tcb| tcb.state == state).count()
    }

    pub fn has_capacity(&self, max_threads: Option<usize>) -> bool {
        max_threads.map_or(true, |max| self.threads.len() < max)
    }

    pub fn admit(&mut self, context: C::Context, stack: C::Stack) -> ThreadId {
        let id = ThreadId::new(self.next_id);
        self.next_id += 1;
        self.threads
            .insert(id, ThreadControlBlock::new(id, context, stack));
        id
    }

    fn set_state(&mut self, id: ThreadId, state: ThreadState) {
        if let Some(tcb) = self.threads.get_mut(&id) {
            tcb.state = state;
        }
    }

    /// Mark a new or blocked thread READY and append it to the ready queue.
    pub fn make_ready(&mut self, id: ThreadId) -> bool {
        match self.state_of(id) {
            Some(ThreadState::Initial) | Some(ThreadState::Blocked) => {
                self.set_state(id, ThreadState::Ready);
                self.scheduler.enqueue(id);
                true
            }
            Some(state) => {
                warn!("Ignoring start of {} in state {:?}", id, state);
                false
            }
            None => {
                warn!("Ignoring start of unknown thread {}", id);
                false
            }
        }
    }

    pub fn requeue_current(&mut self) {
        let current = self.current_thread;
        self.set_state(current, ThreadState::Ready);
        self.scheduler.enqueue(current);
    }

    pub fn block_current(&mut self) {
        let current = self.current_thread;
        self.set_state(current, ThreadState::Blocked);
    }

    pub fn exit_current(&mut self) {
        let current = self.current_thread;
        self.set_state(current, ThreadState::Exited);
        self.exited.push_back(current);
    }

    /// One scheduling decision. Returns the contexts to transfer between, or
    /// `None` when the outgoing thread keeps the processor.
    pub fn pick_next(&mut self) -> Option<(C::Context, C::Context)> {
        let old = self.current_thread;
        let old_state = self.state_of(old)?;

        // The caller has not given up the processor.
        if !old.is_idle() && old_state == ThreadState::Running {
            return None;
        }

        let Some(mut new) = self.scheduler.schedule() else {
            self.set_state(old, ThreadState::Running);
            return None;
        };

        // The idle thread sinks below any real work.
        if new.is_idle() {
            if self.scheduler.is_empty() {
                if old.is_idle() {
                    self.set_state(old, ThreadState::Running);
                    return None;
                }
            } else {
                self.scheduler.enqueue(new);
                new = self.scheduler.schedule()?;
            }
        }

        if old.is_idle() && self.state_of(old) == Some(ThreadState::Running) {
            self.set_state(old, ThreadState::Ready);
            self.scheduler.enqueue(old);
        }

        self.current_thread = new;
        self.set_state(new, ThreadState::Running);

        if old == new {
            return None;
        }

        debug!("Switch {} -> {}", old, new);
        let from = self.threads.get(&old)?.context.clone();
        let to = self.threads.get(&new)?.context.clone();
        Some((from, to))
    }

    /// Drain the exited queue, handing back the TCBs to be freed.
    pub fn reap(&mut self) -> Vec<ThreadControlBlock<C>> {
        let mut reaped = Vec::with_capacity(self.exited.len());
        while let Some(id) = self.exited.pop_front() {
            if let Some(tcb) = self.threads.remove(&id) {
                reaped.push(tcb);
            }
        }
        reaped
    }
}

impl<C: ContextSwitch> Kernel<C> {
    /// Allocate a thread that will run `entry` once started.
    pub fn create<F>(&self, entry: F) -> Result<ThreadId, KernelError>
    where
        F: FnOnce(&Kernel<C>) + Send + 'static,
    {
        if !self.threads.lock().has_capacity(self.config.max_threads) {
            return Err(KernelError::Allocation(
                "thread control block pool exhausted".into(),
            ));
        }

        let body_kernel = self.this.clone();
        let exit_kernel = self.this.clone();
        let (context, stack) = self.switch.prepare(
            self.config.stack_size,
            Box::new(move || {
                if let Some(kernel) = body_kernel.upgrade() {
                    kernel.restore_interrupts(InterruptLevel::Enabled);
                    entry(&kernel);
                }
            }),
            Box::new(move || {
                if let Some(kernel) = exit_kernel.upgrade() {
                    kernel.exit_current();
                }
            }),
        )?;

        let id = self.threads.lock().admit(context, stack);
        debug!("Created thread {}", id);
        Ok(id)
    }

    /// Make `id` runnable and give the scheduler a chance to run.
    pub fn start(&self, id: ThreadId) {
        let old = self.disable_interrupts();
        let queued = self.threads.lock().make_ready(id);
        if queued {
            self.schedule();
        }
        self.restore_interrupts(old);
    }

    pub fn fork<F>(&self, entry: F) -> Result<ThreadId, KernelError>
    where
        F: FnOnce(&Kernel<C>) + Send + 'static,
    {
        let id = self.create(entry)?;
        self.start(id);
        Ok(id)
    }

    pub fn yield_now(&self) {
        let old = self.disable_interrupts();
        self.threads.lock().requeue_current();
        self.schedule();
        self.restore_interrupts(old);
    }

    /// Block the running thread.
    ///
    /// The caller must already be recorded on some wait structure that will
    /// eventually `start` it again; otherwise it never runs again.
    pub fn stop(&self) {
        let old = self.disable_interrupts();
        self.threads.lock().block_current();
        self.schedule();
        self.restore_interrupts(old);
    }

    /// Reached when a thread's entry returns. Its stack is never resumed, so
    /// this only comes back once `cleanup` has freed that stack.
    fn exit_current(&self) {
        self.disable_interrupts();
        {
            let mut tm = self.threads.lock();
            debug!("Thread {} exited", tm.current_thread);
            tm.exit_current();
        }
        self.schedule();
    }

    /// Free every exited thread. Returns how many were freed.
    pub fn cleanup(&self) -> usize {
        let reaped = self.threads.lock().reap();
        let count = reaped.len();
        // Stacks are released outside the lock.
        drop(reaped);
        if count > 0 {
            debug!("Cleaned up {} thread(s)", count);
        }
        count
    }

    fn schedule(&self) {
        let switch = self.threads.lock().pick_next();
        if let Some((from, to)) = switch {
            self.switch.transfer(&from, &to);
        }
    }

    pub fn current(&self) -> ThreadId {
        self.threads.lock().current_thread
    }

    pub fn current_id(&self) -> u32 {
        self.current().val()
    }

    pub fn live_threads(&self) -> usize {
        self.threads.lock().live_threads()
    }

    pub fn ready_threads(&self) -> usize {
        self.threads.lock().scheduler.len()
    }

    /// Number of threads currently in `state`, idle included.
    pub fn threads_in(&self, state: ThreadState) -> usize {
        self.threads.lock().count_in(state)
    }

    pub fn state_of(&self, id: ThreadId) -> Option<ThreadState> {
        self.threads.lock().state_of(id)
    }
}
