//! Discovery of the host's presentation queue.
use tracing::trace;

use crate::config::LatchPolicy;

/// Remembers the direct command queue the host submits frames through.
#[derive(Debug)]
pub struct QueueLatch<Q> {
    policy: LatchPolicy,
    queue: Option<Q>,
}

impl<Q> QueueLatch<Q> {
    pub fn new(policy: LatchPolicy) -> Self {
        Self { policy, queue: None }
    }

    pub fn policy(&self) -> LatchPolicy {
        self.policy
    }

    /// Observe a submission. Non-direct queues are ignored. Returns whether
    /// the latched queue changed.
    pub fn observe(&mut self, queue: &Q, is_direct: bool) -> bool
    where
        Q: Clone,
    {
        if !is_direct {
            return false;
        }

        match (&self.queue, self.policy) {
            (Some(_), LatchPolicy::First) => false,
            _ => {
                trace!("Latching command queue");
                self.queue = Some(queue.clone());
                true
            },
        }
    }

    pub fn get(&self) -> Option<&Q> {
        self.queue.as_ref()
    }

    pub fn is_latched(&self) -> bool {
        self.queue.is_some()
    }

    pub fn clear(&mut self) {
        self.queue = None;
    }
}
