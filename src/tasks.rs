//! Lock-free multi-producer/single-consumer queue of zero-argument actions,
//! the only way other threads hand work to the event-loop thread besides
//! the eventfd wake-up itself.
//!
//! Backed by `crossbeam_queue::SegQueue`, already a dependency of
//! `GssMahadevan-gvthread`'s `ksvc-module` crate for its own work queues.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use tracing::warn;

use crate::wakeup::WakeupState;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Producer handle, freely cloneable and shareable across threads.
#[derive(Clone)]
pub struct TaskSender {
    queue: Arc<SegQueue<Task>>,
    wakeup: Arc<WakeupState>,
}

impl TaskSender {
    /// Enqueues `task` and pokes the event loop's wake-up eventfd so it runs
    /// promptly even if currently blocked in `submit_and_wait`.
    pub fn send(&self, task: Task) {
        self.queue.push(task);
        self.wakeup.request_wakeup();
    }
}

/// Consumer side, owned exclusively by the event loop.
pub struct TaskQueue {
    queue: Arc<SegQueue<Task>>,
    wakeup: Arc<WakeupState>,
}

impl TaskQueue {
    pub fn new(wakeup: Arc<WakeupState>) -> Self {
        TaskQueue {
            queue: Arc::new(SegQueue::new()),
            wakeup,
        }
    }

    pub fn sender(&self) -> TaskSender {
        TaskSender {
            queue: Arc::clone(&self.queue),
            wakeup: Arc::clone(&self.wakeup),
        }
    }

    /// Pops and runs every task currently queued. New tasks pushed by a
    /// concurrent producer mid-drain are picked up on the *next* busy-phase
    /// iteration, not this one — draining is not required to be a fixed
    /// point.
    ///
    /// A task that panics is caught and logged at WARN rather than unwinding
    /// into the event loop: one bad task must not take the whole loop down.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Some(task) = self.queue.pop() {
            if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(task)) {
                crate::metrics::inc_loop_exceptions();
                let msg = panic
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
                    .unwrap_or("unknown panic payload");
                warn!(panic = msg, "task panicked during busy phase, continuing");
            }
            ran += 1;
        }
        ran
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
