use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use super::thread::{Shared, Task};
use crate::promise::{self, Future};

/// A FIFO of tasks on top of one [`ProcessingThread`](super::ProcessingThread)
/// whose tasks never overlap each other, but may interleave with tasks of
/// other strands on the same thread. Each SFTP session owns one so its native
/// calls and the queue driver never interleave mid-call.
///
/// The handle is cheap to clone; clones refer to the same strand.
#[derive(Clone)]
pub struct ProcessingStrand {
    thread: Arc<Shared>,
    state: Arc<StrandState>,
}

struct StrandState {
    queue: Mutex<VecDeque<Task>>,
    running: AtomicBool,
    finalized: AtomicBool,
}

impl ProcessingStrand {
    pub(crate) fn new(thread: Arc<Shared>) -> Self {
        Self {
            thread,
            state: Arc::new(StrandState {
                queue: Mutex::new(VecDeque::new()),
                running: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
            }),
        }
    }

    /// Enqueues a task behind all tasks previously pushed through this
    /// strand. Rejected once the strand is finalized.
    pub fn push_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        if self.state.finalized.load(Ordering::SeqCst) {
            return false;
        }
        self.push_unchecked(Box::new(task))
    }

    pub fn push_promise_task<F, R>(&self, task: F) -> Future<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise, future) = promise::promise();
        self.push_task(move || match catch_unwind(AssertUnwindSafe(task)) {
            Ok(value) => promise.set(value),
            Err(_) => log::error!("strand promise task panicked; reporting through its future"),
        });
        future
    }

    /// Pushes one last task and closes the strand; every later submission is
    /// rejected. Used by the SFTP session teardown.
    pub fn push_final_promise_task<F, R>(&self, task: F) -> Future<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.state.finalized.swap(true, Ordering::SeqCst) {
            let (promise, future) = promise::promise();
            drop(promise);
            return future;
        }

        let (promise, future) = promise::promise();
        self.push_unchecked(Box::new(
            move || match catch_unwind(AssertUnwindSafe(task)) {
                Ok(value) => promise.set(value),
                Err(_) => log::error!("final strand task panicked; reporting through its future"),
            },
        ));
        future
    }

    pub fn is_finalized(&self) -> bool {
        self.state.finalized.load(Ordering::SeqCst)
    }

    /// Marks the strand closed without scheduling anything, for teardown
    /// paths that already run on the processing thread.
    pub(crate) fn finalize(&self) {
        self.state.finalized.store(true, Ordering::SeqCst);
    }

    pub fn within_processing_thread(&self) -> bool {
        self.thread.within_processing_thread()
    }

    fn push_unchecked(&self, task: Task) -> bool {
        let schedule = {
            let mut queue = self.state.queue.lock().unwrap();
            queue.push_back(task);
            // Only one drain task is in flight per strand; that is what keeps
            // strand tasks from overlapping.
            !self.state.running.swap(true, Ordering::SeqCst)
        };

        if schedule && !self.schedule_drain() {
            self.state.running.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    fn schedule_drain(&self) -> bool {
        let thread = self.thread.clone();
        let state = self.state.clone();
        self.thread.push(Box::new(move || drain_one(thread, state)))
    }
}

fn drain_one(thread: Arc<Shared>, state: Arc<StrandState>) {
    let task = state.queue.lock().unwrap().pop_front();
    if let Some(task) = task {
        task();
    }

    let more = {
        let queue = state.queue.lock().unwrap();
        if queue.is_empty() {
            state.running.store(false, Ordering::SeqCst);
            false
        } else {
            true
        }
    };

    if more {
        // Repost instead of looping so other strands get their turn.
        let reposted = {
            let thread_for_task = thread.clone();
            let state = state.clone();
            thread.push(Box::new(move || drain_one(thread_for_task, state)))
        };
        if !reposted {
            state.running.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::ProcessingThread;
    use crate::promise;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn strand_tasks_run_in_submission_order() {
        let thread = ProcessingThread::new();
        thread.start(Duration::from_millis(1));
        let strand = thread.create_strand();

        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..20 {
            let order = order.clone();
            assert!(strand.push_task(move || order.lock().unwrap().push(i)));
        }

        let done = strand.push_promise_task(|| ());
        assert!(done.wait_timeout(Duration::from_secs(1)).is_ok());
        assert_eq!(*order.lock().unwrap(), (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn strand_tasks_never_overlap() {
        let thread = ProcessingThread::new();
        thread.start(Duration::from_millis(1));
        let strand = thread.create_strand();

        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let active = active.clone();
            let overlaps = overlaps.clone();
            strand.push_task(move || {
                if active.fetch_add(1, Ordering::SeqCst) != 0 {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                active.fetch_sub(1, Ordering::SeqCst);
            });
        }

        let done = strand.push_promise_task(|| ());
        assert!(done.wait_timeout(Duration::from_secs(1)).is_ok());
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reentrant_submission_from_inside_a_strand_task_works() {
        let thread = ProcessingThread::new();
        thread.start(Duration::from_millis(1));
        let strand = thread.create_strand();

        let (promise, future) = promise::promise();
        let inner_strand = strand.clone();
        strand.push_task(move || {
            inner_strand.push_task(move || promise.set(()));
        });
        assert!(future.wait_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn finalized_strand_rejects_further_tasks() {
        let thread = ProcessingThread::new();
        thread.start(Duration::from_millis(1));
        let strand = thread.create_strand();

        let future = strand.push_final_promise_task(|| 1);
        assert_eq!(future.wait_timeout(Duration::from_secs(1)), Ok(1));
        assert!(strand.is_finalized());
        assert!(!strand.push_task(|| {}));

        let broken = strand.push_final_promise_task(|| 2);
        assert!(broken.wait_timeout(Duration::from_millis(50)).is_err());
    }
}
