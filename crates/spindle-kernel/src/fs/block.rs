//! Blocking transfers between the cache and an asynchronous [`Disk`].
//!
//! A transfer occupies one device permit for its whole duration. The issuing
//! thread sleeps on the channel's signal, and the completion is handed back
//! through an interrupt handler that stores the reply and raises the signal.

use crate::error::KernelError;
use crate::sync::{Semaphore, SpinLock};
use crate::thread::context::ContextSwitch;
use crate::Kernel;
use log::trace;
use spindle_vm::devices::{Completion, Disk, Request};
use spindle_vm::DeviceError;
use std::sync::Arc;

/// Completion mailbox shared by every transfer issued under one bucket lock.
pub struct IoChannel {
    signal: Semaphore,
    reply: SpinLock<Option<Completion>>,
}

impl Default for IoChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl IoChannel {
    pub fn new() -> Self {
        Self {
            signal: Semaphore::new(0),
            reply: SpinLock::new(None),
        }
    }

    fn complete<C: ContextSwitch>(&self, kernel: &Kernel<C>, completion: Completion) {
        *self.reply.lock() = Some(completion);
        self.signal.v(kernel);
    }
}

/// Submit `request` and sleep until its completion has been delivered.
///
/// At most one transfer may be in flight per channel; callers serialize on the
/// lock that owns it.
pub fn transfer<C: ContextSwitch>(
    kernel: &Kernel<C>,
    disk: &Disk,
    permit: &Semaphore,
    channel: &Arc<IoChannel>,
    request: Request,
) -> Result<Completion, KernelError> {
    let block = request.block();
    permit.p(kernel);

    let line = kernel.interrupts().line();
    let mailbox = Arc::clone(channel);
    let submitted = disk.submit(
        request,
        Box::new(move |completion| {
            line.raise(move |kernel: &Kernel<C>| mailbox.complete(kernel, completion));
        }),
    );

    let result = match submitted {
        Ok(()) => {
            // Disabled across the wait so the completion cannot be handled
            // before this thread is queued on the signal.
            let old = kernel.disable_interrupts();
            channel.signal.p(kernel);
            kernel.restore_interrupts(old);
            channel
                .reply
                .lock()
                .take()
                .ok_or(KernelError::Device(DeviceError::Disconnected))
        }
        Err(e) => Err(e.into()),
    };

    permit.v(kernel);
    trace!("Transfer on {} block {} done", disk.id(), block);
    result
}
