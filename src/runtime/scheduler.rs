// retrace_interceptor::runtime::scheduler
//
// Deterministic single-threaded task queue modelling the cooperative event
// loop: setTimeout callbacks, zero-timeout message delivery, ping retries
// and the async focus/blur deferrals all run through here.  Virtual time
// advances to the next due task; within one instant tasks run in
// registration order.

use std::collections::BTreeMap;

use crate::runtime::Runtime;

pub type Task = Box<dyn FnOnce(&mut Runtime)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

pub struct Scheduler {
    now_ms: u64,
    next_id: u64,
    // Keyed by (due time, registration order) so ordering is total.
    queue: BTreeMap<(u64, u64), (TimerId, Task)>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            now_ms: 0,
            next_id: 0,
            queue: BTreeMap::new(),
        }
    }

    pub fn now(&self) -> u64 {
        self.now_ms
    }

    pub fn set_timeout(&mut self, delay_ms: u64, task: Task) -> TimerId {
        let id = TimerId(self.next_id);
        let key = (self.now_ms + delay_ms, self.next_id);
        self.next_id += 1;
        self.queue.insert(key, (id, task));
        id
    }

    /// Cancel a pending timer.  Cancelling an already-fired timer is a
    /// no-op, which is exactly what clearTimeout does.
    pub fn clear_timeout(&mut self, id: TimerId) {
        self.queue.retain(|_, (timer, _)| *timer != id);
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn pop_next(&mut self) -> Option<Task> {
        let key = *self.queue.keys().next()?;
        let (_, task) = self.queue.remove(&key)?;
        self.now_ms = key.0;
        Some(task)
    }

    /// Pop the next task only if it is due at or before `limit_ms`.
    pub(crate) fn pop_next_until(&mut self, limit_ms: u64) -> Option<Task> {
        let key = *self.queue.keys().next()?;
        if key.0 > limit_ms {
            return None;
        }
        let (_, task) = self.queue.remove(&key)?;
        self.now_ms = key.0;
        Some(task)
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("now_ms", &self.now_ms)
            .field("pending", &self.queue.len())
            .finish()
    }
}
