//! Stack preparation and transfer of control between logical threads.
//!
//! Everything architecture- or host-specific about switching stacks lives
//! behind [`ContextSwitch`]. The scheduler above it only ever asks for a fresh
//! stack ([`ContextSwitch::prepare`]) or for control to move from one saved
//! context to another ([`ContextSwitch::transfer`]).

use crate::error::KernelError;
use log::error;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

/// Code run on a freshly prepared stack.
pub type Entry = Box<dyn FnOnce() + Send>;

pub trait ContextSwitch: Send + Sync + 'static {
    /// A resumable execution context. The default value stands for the host
    /// thread that boots the kernel and is filled in by the first transfer
    /// out of it.
    type Context: Clone + Default + Send + Sync;

    /// Owner of a prepared stack. Dropping it frees the stack; a thread whose
    /// stack is freed while parked in `transfer` never resumes its caller.
    type Stack: Send;

    /// Build a stack whose first resumption runs `entry`, then `on_return`.
    fn prepare(
        &self,
        stack_size: usize,
        entry: Entry,
        on_return: Entry,
    ) -> Result<(Self::Context, Self::Stack), KernelError>;

    /// Save the caller into `save` and resume `resume`. Returns once `save`
    /// is resumed again, or once its stack has been freed.
    fn transfer(&self, save: &Self::Context, resume: &Self::Context);
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum Turn {
    #[default]
    Parked,
    Run,
    Retire,
}

#[derive(Debug, Default)]
struct Baton {
    turn: Mutex<Turn>,
    wake: Condvar,
}

impl Baton {
    fn turn(&self) -> MutexGuard<'_, Turn> {
        self.turn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn hand(&self, turn: Turn) {
        *self.turn() = turn;
        self.wake.notify_one();
    }

    fn park(&self) -> Turn {
        let mut turn = self.turn();
        loop {
            match *turn {
                Turn::Parked => {
                    turn = self
                        .wake
                        .wait(turn)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Turn::Run => {
                    *turn = Turn::Parked;
                    return Turn::Run;
                }
                Turn::Retire => return Turn::Retire,
            }
        }
    }
}

/// Portable [`ContextSwitch`]: every logical thread owns a host thread for its
/// stack, and a single baton is passed between them so that exactly one of
/// them executes at any time.
#[derive(Debug, Default, Clone, Copy)]
pub struct Handoff;

#[derive(Debug, Default, Clone)]
pub struct HandoffContext(Arc<Baton>);

pub struct HandoffStack {
    baton: Arc<Baton>,
    host: Option<JoinHandle<()>>,
}

impl Drop for HandoffStack {
    fn drop(&mut self) {
        self.baton.hand(Turn::Retire);
        if let Some(host) = self.host.take() {
            if host.thread().id() != thread::current().id() {
                let _ = host.join();
            }
        }
    }
}

fn describe(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "<non-string payload>"
    }
}

impl ContextSwitch for Handoff {
    type Context = HandoffContext;
    type Stack = HandoffStack;

    fn prepare(
        &self,
        stack_size: usize,
        entry: Entry,
        on_return: Entry,
    ) -> Result<(HandoffContext, HandoffStack), KernelError> {
        let baton = Arc::new(Baton::default());
        let parked = Arc::clone(&baton);

        let host = thread::Builder::new()
            .name("spindle-thread".into())
            .stack_size(stack_size)
            .spawn(move || {
                if parked.park() == Turn::Retire {
                    return;
                }
                if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(entry)) {
                    error!("Thread body panicked: {}", describe(panic.as_ref()));
                }
                on_return();
            })
            .map_err(|e| KernelError::Allocation(format!("stack allocation failed: {}", e)))?;

        Ok((
            HandoffContext(Arc::clone(&baton)),
            HandoffStack {
                baton,
                host: Some(host),
            },
        ))
    }

    fn transfer(&self, save: &HandoffContext, resume: &HandoffContext) {
        resume.0.hand(Turn::Run);
        save.0.park();
    }
}
