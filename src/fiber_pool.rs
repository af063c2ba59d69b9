use corosensei::stack::DefaultStack;
use parking_lot::Mutex;
use std::io;

/// A pool of reusable fiber stacks to minimize `mmap` churn.
///
/// Shared by every worker of a job system. Stacks come back here when the
/// fiber that ran on them completes normally.
pub(crate) struct StackPool {
    pool: Mutex<Vec<DefaultStack>>,
    stack_size: usize,
    capacity: usize,
}

impl StackPool {
    pub(crate) fn new(stack_size: usize, capacity: usize) -> Self {
        StackPool {
            pool: Mutex::new(Vec::with_capacity(capacity)),
            stack_size,
            capacity,
        }
    }

    /// Retrieves a stack from the pool or allocates a new one if empty.
    pub(crate) fn acquire(&self) -> io::Result<DefaultStack> {
        if let Some(stack) = self.pool.lock().pop() {
            return Ok(stack);
        }
        DefaultStack::new(self.stack_size)
    }

    /// Returns a stack for reuse. Dropped if the pool is full.
    pub(crate) fn recycle(&self, stack: DefaultStack) {
        let mut pool = self.pool.lock();
        if pool.len() < self.capacity {
            pool.push(stack);
        }
    }

    /// Returns the current number of idle stacks in the pool.
    pub(crate) fn len(&self) -> usize {
        self.pool.lock().len()
    }
}
