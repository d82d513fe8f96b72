use tracing::info;

use crate::config::BakeryConfig;
use crate::core::Segment;
use crate::customer::Customer;
use crate::errors::{BakeryError, Result};
use crate::guard::NamedSemaphore;

use super::BoundedQueue;

/// The customer queue segment and the guard serialising every access to it.
pub struct SharedQueue {
    segment: Segment,
    capacity: usize,
    guard: NamedSemaphore,
}

impl SharedQueue {
    /// Creates an empty queue of `max_customers` slots and resets its guard.
    pub fn create(cfg: &BakeryConfig) -> Result<SharedQueue> {
        let capacity = cfg.customers.max_customers as usize;
        let size = BoundedQueue::<Customer>::required_size(capacity)
            .ok_or_else(|| BakeryError::Config(format!("max_customers {} is too large", capacity)))?;
        let segment = Segment::create(&cfg.shmem, &cfg.shmem.queue_file_name, size)?;
        let guard = NamedSemaphore::reset(&cfg.guard_names().queue)?;
        let queue = SharedQueue { segment, capacity, guard };
        queue.with_queue(|q| q.clear())?;
        info!(capacity, size, "customer queue created");
        Ok(queue)
    }

    pub fn open(cfg: &BakeryConfig) -> Result<SharedQueue> {
        let segment = Segment::open(&cfg.shmem, &cfg.shmem.queue_file_name)?;
        let guard = NamedSemaphore::open(&cfg.guard_names().queue)?;
        Ok(SharedQueue { segment, capacity: cfg.customers.max_customers as usize, guard })
    }

    /// Runs `f` on the queue while holding the queue guard. `f` must not block.
    pub fn with_queue<R, F>(&self, f: F) -> Result<R>
        where F: FnOnce(&mut BoundedQueue<'_, Customer>) -> R,
    {
        let _held = self.guard.acquire()?;
        let mut queue = unsafe { BoundedQueue::attach_raw(self.segment.as_ptr(), self.segment.len(), self.capacity)? };
        Ok(f(&mut queue))
    }

    pub fn snapshot(&self) -> Result<Vec<Customer>> {
        self.with_queue(|q| q.to_vec())
    }

    pub fn is_owner(&self) -> bool {
        self.segment.is_owner()
    }
}

impl std::fmt::Debug for SharedQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedQueue")
            .field("capacity", &self.capacity)
            .field("owner", &self.is_owner())
            .field("guard", &self.guard.name())
            .finish()
    }
}
