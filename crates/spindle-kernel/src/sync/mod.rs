pub mod semaphore;
pub mod spinlock;

pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard};
