use crate::thread::context::ContextSwitch;
use crate::types::ThreadId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Initial,
    Ready,
    Running,
    Blocked,
    Exited,
}

pub struct ThreadControlBlock<C: ContextSwitch> {
    pub id: ThreadId,
    pub state: ThreadState,
    pub context: C::Context,
    /// `None` for the idle thread, which runs on the boot stack.
    pub stack: Option<C::Stack>,
}

impl<C: ContextSwitch> ThreadControlBlock<C> {
    pub fn idle() -> Self {
        Self {
            id: ThreadId::IDLE,
            state: ThreadState::Running,
            context: C::Context::default(),
            stack: None,
        }
    }

    pub fn new(id: ThreadId, context: C::Context, stack: C::Stack) -> Self {
        Self {
            id,
            state: ThreadState::Initial,
            context,
            stack: Some(stack),
        }
    }
}
