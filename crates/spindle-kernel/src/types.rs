use core::fmt;

/// Thread identifier. Identifiers are handed out monotonically and never reused.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ThreadId(u32);

impl ThreadId {
    /// The idle thread, always present.
    pub const IDLE: ThreadId = ThreadId(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn val(&self) -> u32 {
        self.0
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::IDLE
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_idle() {
            write!(f, "idle")
        } else {
            write!(f, "t{}", self.0)
        }
    }
}
