pub mod error;
pub mod fs;
pub mod interrupt;
pub mod sync;
pub mod thread;
pub mod types;

pub use error::KernelError;
pub use fs::cache::{BlockState, Buf, BufferCache, CacheConfig, CacheStats};
pub use interrupt::{InterruptController, InterruptLevel};
pub use sync::Semaphore;
pub use thread::context::{ContextSwitch, Handoff};
pub use thread::tcb::ThreadState;
pub use types::ThreadId;

use crate::sync::SpinLock;
use log::{error, info};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use thread::ThreadManager;

#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Stack size of every created thread, in bytes.
    pub stack_size: usize,
    /// Cap on live TCBs, the idle thread included. Creation fails once reached.
    pub max_threads: Option<usize>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            stack_size: 256 * 1024,
            max_threads: None,
        }
    }
}

/// The runtime: scheduler state, interrupt control and the stack switcher.
///
/// One kernel is built per process run and lives until the process ends. Every
/// thread body receives a reference to it.
pub struct Kernel<C: ContextSwitch = Handoff> {
    this: Weak<Kernel<C>>,
    config: KernelConfig,
    switch: C,
    threads: SpinLock<ThreadManager<C>>,
    interrupts: Arc<InterruptController<Kernel<C>>>,
    booted: AtomicBool,
}

impl Kernel<Handoff> {
    pub fn new(config: KernelConfig) -> Arc<Self> {
        Self::with_switch(config, Handoff)
    }
}

impl<C: ContextSwitch> Kernel<C> {
    pub fn with_switch(config: KernelConfig, switch: C) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            switch,
            threads: SpinLock::new(ThreadManager::new()),
            interrupts: Arc::new(InterruptController::new()),
            booted: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn interrupts(&self) -> &Arc<InterruptController<Kernel<C>>> {
        &self.interrupts
    }

    pub fn disable_interrupts(&self) -> InterruptLevel {
        self.interrupts.set_level(InterruptLevel::Disabled)
    }

    /// Set the interrupt level, delivering anything pending if it becomes
    /// enabled. Returns the previous level.
    pub fn set_interrupt_level(&self, level: InterruptLevel) -> InterruptLevel {
        let old = self.interrupts.set_level(level);
        if level == InterruptLevel::Enabled {
            self.interrupts.deliver(self);
        }
        old
    }

    pub fn restore_interrupts(&self, level: InterruptLevel) {
        self.set_interrupt_level(level);
    }

    fn enter<F>(&self, entry: F) -> Result<(), KernelError>
    where
        F: FnOnce(&Kernel<C>) + Send + 'static,
    {
        if self.booted.swap(true, Ordering::AcqRel) {
            return Err(KernelError::AlreadyBooted);
        }
        info!(
            "Booting kernel (stack size {} bytes)",
            self.config.stack_size
        );
        let main = self.create(entry)?;
        self.start(main);
        Ok(())
    }

    /// Turn the calling host thread into the idle thread, run `entry` as the
    /// first logical thread and schedule forever.
    pub fn boot<F>(&self, entry: F) -> !
    where
        F: FnOnce(&Kernel<C>) + Send + 'static,
    {
        if let Err(e) = self.enter(entry) {
            error!("Main thread creation failed: {}", e);
            process::exit(-1);
        }

        loop {
            self.cleanup();
            if self.ready_threads() == 0 && !self.interrupts.wait() {
                info!("No runnable threads remain; idling");
                loop {
                    std::thread::park();
                }
            }
            self.yield_now();
        }
    }

    /// Like [`Kernel::boot`], but returns once every thread has exited and
    /// been cleaned up.
    pub fn run<F>(&self, entry: F) -> Result<(), KernelError>
    where
        F: FnOnce(&Kernel<C>) + Send + 'static,
    {
        self.enter(entry)?;

        loop {
            self.cleanup();
            let live = self.live_threads();
            if live == 1 {
                info!("All threads finished");
                return Ok(());
            }
            if self.ready_threads() == 0 && !self.interrupts.wait() {
                let blocked = self.threads_in(ThreadState::Blocked);
                let unstarted = self.threads_in(ThreadState::Initial);
                error!(
                    "{} thread(s) blocked forever, {} never started",
                    blocked, unstarted
                );
                return Err(KernelError::Deadlock { blocked, unstarted });
            }
            self.yield_now();
        }
    }
}
