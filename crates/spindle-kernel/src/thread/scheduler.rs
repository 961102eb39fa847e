use crate::types::ThreadId;
use std::collections::VecDeque;

pub trait Scheduler: Send {
    /// Select next thread to run
    fn schedule(&mut self) -> Option<ThreadId>;

    /// Add thread to ready queue
    fn enqueue(&mut self, thread: ThreadId);

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Strict FIFO ready queue.
#[derive(Debug, Default)]
pub struct RoundRobinScheduler {
    ready_queue: VecDeque<ThreadId>,
}

impl RoundRobinScheduler {
    pub fn new() -> Self {
        Self {
            ready_queue: VecDeque::new(),
        }
    }
}

impl Scheduler for RoundRobinScheduler {
    fn schedule(&mut self) -> Option<ThreadId> {
        self.ready_queue.pop_front()
    }

    fn enqueue(&mut self, thread: ThreadId) {
        self.ready_queue.push_back(thread);
    }

    fn len(&self) -> usize {
        self.ready_queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut rr = RoundRobinScheduler::new();
        for i in 1..=3 {
            rr.enqueue(ThreadId::new(i));
        }
        assert_eq!(rr.schedule(), Some(ThreadId::new(1)));
        rr.enqueue(ThreadId::new(1));
        assert_eq!(rr.len(), 3);

        let order: Vec<u32> = std::iter::from_fn(|| rr.schedule()).map(|t| t.val()).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert!(rr.is_empty());
    }
}
