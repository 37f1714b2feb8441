use std::collections::{BTreeMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crate::promise::{self, Future};

/// Upper bound of one-shot tasks drained per cycle, so permanent tasks
/// cannot be starved by a flood of submissions.
pub const MAXIMUM_TASKS_PROCESSABLE_AT_ONCE: usize = 100;

const DEFERRED_REMOVAL_WAIT: Duration = Duration::from_secs(5);

pub type Task = Box<dyn FnOnce() + Send + 'static>;
type PermanentTask = Box<dyn FnMut() + Send + 'static>;
type DeferredEdit = Box<dyn FnOnce(&mut TaskState) + Send + 'static>;

/// Handle for removing a permanent task again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PermanentTaskId(i32);

impl PermanentTaskId {
    pub const INVALID: PermanentTaskId = PermanentTaskId(-1);

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

pub(crate) struct TaskState {
    tasks: VecDeque<Task>,
    permanent: BTreeMap<PermanentTaskId, PermanentTask>,
    deferred: Vec<DeferredEdit>,
    processing_permanents: bool,
}

pub(crate) struct Shared {
    state: Mutex<TaskState>,
    running: AtomicBool,
    shutting_down: AtomicBool,
    permanents_available: AtomicBool,
    next_permanent_id: AtomicI32,
    thread_id: Mutex<Option<ThreadId>>,
}

impl Shared {
    pub(crate) fn push(&self, task: Task) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        self.state.lock().unwrap().tasks.push_back(task);
        true
    }

    pub(crate) fn within_processing_thread(&self) -> bool {
        *self.thread_id.lock().unwrap() == Some(thread::current().id())
    }
}

/// A dedicated thread executing submitted tasks in FIFO order, plus a set of
/// permanent tasks that are re-run every cycle until removed. All native
/// SSH/SFTP handles of one session are driven from exactly one of these.
pub struct ProcessingThread {
    shared: Arc<Shared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessingThread {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TaskState {
                    tasks: VecDeque::new(),
                    permanent: BTreeMap::new(),
                    deferred: Vec::new(),
                    processing_permanents: false,
                }),
                running: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                permanents_available: AtomicBool::new(false),
                next_permanent_id: AtomicI32::new(0),
                thread_id: Mutex::new(None),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Starts the thread. Returns once the thread has begun executing.
    /// `min_cycle_wait` throttles the loop so permanent polling tasks do not
    /// spin a core.
    pub fn start(&self, min_cycle_wait: Duration) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_some() {
            return;
        }

        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.shutting_down.store(false, Ordering::SeqCst);

        let shared = self.shared.clone();
        let (started, await_start) = promise::promise();
        *handle = Some(thread::spawn(move || {
            *shared.thread_id.lock().unwrap() = Some(thread::current().id());
            started.set(());
            run(&shared, min_cycle_wait);
        }));
        let _ = await_start.wait_timeout(Duration::from_secs(5));
    }

    /// Stops the thread and executes all remaining one-shot tasks on the
    /// calling thread.
    pub fn stop(&self) {
        self.shared.shutting_down.store(true, Ordering::SeqCst);
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.handle.lock().unwrap().take() {
            let _ = handle.join();
        }

        // Tasks may push further tasks while draining, so pop one at a time
        // without holding the lock across the call.
        loop {
            let task = self.shared.state.lock().unwrap().tasks.pop_front();
            match task {
                Some(task) => task(),
                None => break,
            }
        }

        self.shared.shutting_down.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Enqueues a one-shot task. Rejected only while the thread is shutting
    /// down.
    pub fn push_task<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.shared.push(Box::new(task))
    }

    /// Enqueues a task with a return value. The future resolves with the
    /// value; if the task panics or is discarded the future reports
    /// `Broken` instead.
    pub fn push_promise_task<F, R>(&self, task: F) -> Future<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (promise, future) = promise::promise();
        self.push_task(move || match catch_unwind(AssertUnwindSafe(task)) {
            Ok(value) => promise.set(value),
            Err(_) => {
                log::error!("promise task panicked; reporting through its future");
            }
        });
        future
    }

    /// Registers a task invoked once per cycle until removed.
    pub fn push_permanent_task<F>(&self, task: F) -> (bool, PermanentTaskId)
    where
        F: FnMut() + Send + 'static,
    {
        if self.shared.shutting_down.load(Ordering::SeqCst) {
            return (false, PermanentTaskId::INVALID);
        }

        let id = PermanentTaskId(self.shared.next_permanent_id.fetch_add(1, Ordering::SeqCst));
        let mut state = self.shared.state.lock().unwrap();
        state.permanent.insert(id, Box::new(task));
        self.shared.permanents_available.store(true, Ordering::SeqCst);
        (true, id)
    }

    /// Removes a permanent task. While the permanent set is being iterated
    /// the removal is deferred; an outside caller then blocks until the
    /// deferred edit has been applied.
    pub fn remove_permanent_task(&self, id: PermanentTaskId) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        if state.processing_permanents {
            if self.shared.within_processing_thread() {
                state.deferred.push(Box::new(move |state| {
                    state.permanent.remove(&id);
                }));
                return true;
            }

            let (promise, future) = promise::promise();
            state.deferred.push(Box::new(move |state| {
                promise.set(state.permanent.remove(&id).is_some());
            }));
            drop(state);
            return future.wait_timeout(DEFERRED_REMOVAL_WAIT).unwrap_or(false);
        }

        let removed = state.permanent.remove(&id).is_some();
        self.shared
            .permanents_available
            .store(!state.permanent.is_empty(), Ordering::SeqCst);
        removed
    }

    /// Removes all permanent tasks, deferring if they are being iterated.
    pub fn clear_permanent_tasks(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if state.processing_permanents {
            state.deferred.push(Box::new(|state| {
                state.permanent.clear();
            }));
            return;
        }
        state.permanent.clear();
        self.shared.permanents_available.store(false, Ordering::SeqCst);
    }

    pub fn permanent_task_count(&self) -> usize {
        self.shared.state.lock().unwrap().permanent.len()
    }

    /// Waits until the thread has completed one more cycle.
    pub fn await_cycle(&self, max_wait: Duration) -> bool {
        if !self.is_running() || self.shared.within_processing_thread() {
            return false;
        }
        self.push_promise_task(|| true)
            .wait_timeout(max_wait)
            .unwrap_or(false)
    }

    pub fn within_processing_thread(&self) -> bool {
        self.shared.within_processing_thread()
    }

    pub fn create_strand(&self) -> super::ProcessingStrand {
        super::ProcessingStrand::new(self.shared.clone())
    }
}

impl Default for ProcessingThread {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ProcessingThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: &Shared, min_cycle_wait: Duration) {
    while shared.running.load(Ordering::SeqCst) {
        let cycle_start = Instant::now();

        if shared.permanents_available.load(Ordering::SeqCst) {
            let mut moved = {
                let mut state = shared.state.lock().unwrap();
                state.processing_permanents = true;
                std::mem::take(&mut state.permanent)
            };

            for task in moved.values_mut() {
                if catch_unwind(AssertUnwindSafe(|| task())).is_err() {
                    log::error!("permanent task panicked, stopping processing thread");
                    shared.running.store(false, Ordering::SeqCst);
                    let mut state = shared.state.lock().unwrap();
                    state.processing_permanents = false;
                    return;
                }
                if !shared.running.load(Ordering::SeqCst)
                    || shared.shutting_down.load(Ordering::SeqCst)
                {
                    break;
                }
            }

            let mut state = shared.state.lock().unwrap();
            state.processing_permanents = false;
            if state.permanent.is_empty() {
                state.permanent = moved;
            } else {
                // New permanents arrived while iterating; fold both sets.
                for (id, task) in moved {
                    state.permanent.insert(id, task);
                }
            }
            let edits = std::mem::take(&mut state.deferred);
            for edit in edits {
                edit(&mut state);
            }
            shared
                .permanents_available
                .store(!state.permanent.is_empty(), Ordering::SeqCst);
        }

        let batch: Vec<Task> = {
            let mut state = shared.state.lock().unwrap();
            let count = state.tasks.len().min(MAXIMUM_TASKS_PROCESSABLE_AT_ONCE);
            state.tasks.drain(..count).collect()
        };

        for task in batch {
            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                log::error!("task panicked, stopping processing thread");
                shared.running.store(false, Ordering::SeqCst);
                return;
            }
        }

        if !min_cycle_wait.is_zero() {
            let elapsed = cycle_start.elapsed();
            if elapsed < min_cycle_wait {
                thread::sleep(min_cycle_wait - elapsed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn started_thread() -> ProcessingThread {
        let thread = ProcessingThread::new();
        thread.start(Duration::from_millis(1));
        thread
    }

    #[test]
    fn can_start_and_stop() {
        let thread = started_thread();
        assert!(thread.is_running());
        thread.stop();
        assert!(!thread.is_running());
    }

    #[test]
    fn can_start_and_drop_without_stop() {
        let _thread = started_thread();
    }

    #[test]
    fn pushed_task_is_eventually_executed() {
        let thread = started_thread();
        let (promise, future) = promise::promise();
        assert!(thread.push_task(move || promise.set(())));
        assert!(future.wait_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn all_tasks_run_even_if_stopped_early() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (first_ran, await_first) = promise::promise();
        let mut first_ran = Some(first_ran);
        {
            let thread = ProcessingThread::new();
            thread.start(Duration::from_millis(100));
            for _ in 0..MAXIMUM_TASKS_PROCESSABLE_AT_ONCE * 3 {
                let counter = counter.clone();
                let mut signal = first_ran.take();
                assert!(thread.push_task(move || {
                    if let Some(signal) = signal.take() {
                        signal.set(());
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                }));
            }
            // Wait for the first task so the drop does not race the spawn.
            let _ = await_first.wait_timeout(Duration::from_secs(5));
        }
        assert_eq!(
            counter.load(Ordering::SeqCst),
            MAXIMUM_TASKS_PROCESSABLE_AT_ONCE * 3
        );
    }

    #[test]
    fn can_push_task_after_stop() {
        let thread = started_thread();
        thread.stop();
        assert!(thread.push_task(|| {}));
    }

    #[test]
    fn pushed_task_runs_on_stop_if_never_scheduled() {
        let thread = ProcessingThread::new();
        let (promise, future) = promise::promise();
        thread.push_task(move || promise.set(()));
        thread.stop();
        assert!(future.wait_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn promise_task_returns_its_value() {
        let thread = started_thread();
        let future = thread.push_promise_task(|| 40 + 2);
        assert_eq!(future.wait_timeout(Duration::from_secs(1)), Ok(42));
    }

    #[test]
    fn panicking_promise_task_breaks_future_but_keeps_thread_alive() {
        let thread = started_thread();
        let future = thread.push_promise_task(|| -> i32 { panic!("boom") });
        assert!(future.wait_timeout(Duration::from_secs(1)).is_err());
        assert!(thread.await_cycle(Duration::from_secs(1)));
        assert!(thread.is_running());
    }

    #[test]
    fn permanent_task_is_executed_multiple_times() {
        let thread = started_thread();
        let counter = Arc::new(AtomicUsize::new(0));
        let (accepted, _id) = thread.push_permanent_task({
            let counter = counter.clone();
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        assert!(accepted);

        let deadline = Instant::now() + Duration::from_secs(2);
        while counter.load(Ordering::SeqCst) < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(counter.load(Ordering::SeqCst) >= 5);
    }

    #[test]
    fn one_shots_still_run_while_permanents_exist() {
        let thread = started_thread();
        let (_, _id) = thread.push_permanent_task(|| {
            thread::sleep(Duration::from_millis(2));
        });
        let (promise, future) = promise::promise();
        thread.push_task(move || promise.set(()));
        assert!(future.wait_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn remove_permanent_task_returns_true_then_false() {
        let thread = started_thread();
        let (_, id) = thread.push_permanent_task(|| {});
        thread.await_cycle(Duration::from_secs(1));
        assert!(thread.remove_permanent_task(id));
        assert!(!thread.remove_permanent_task(id));
        assert_eq!(thread.permanent_task_count(), 0);
    }

    #[test]
    fn permanent_task_can_remove_itself_from_within() {
        let thread = Arc::new(started_thread());
        let counter = Arc::new(AtomicUsize::new(0));
        let id_slot = Arc::new(Mutex::new(PermanentTaskId::INVALID));

        let (_, id) = thread.push_permanent_task({
            let thread = thread.clone();
            let counter = counter.clone();
            let id_slot = id_slot.clone();
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                let id = *id_slot.lock().unwrap();
                if id.is_valid() {
                    thread.remove_permanent_task(id);
                }
            }
        });
        *id_slot.lock().unwrap() = id;

        let deadline = Instant::now() + Duration::from_secs(2);
        while thread.permanent_task_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(thread.permanent_task_count(), 0);
        // At least one run happened; self-removal stops the repetition.
        let runs = counter.load(Ordering::SeqCst);
        assert!(runs >= 1);
        thread.await_cycle(Duration::from_secs(1));
        thread.await_cycle(Duration::from_secs(1));
        assert!(counter.load(Ordering::SeqCst) <= runs + 1);
    }

    #[test]
    fn clear_permanent_tasks_empties_the_set() {
        let thread = started_thread();
        thread.push_permanent_task(|| {});
        thread.push_permanent_task(|| {});
        thread.clear_permanent_tasks();
        thread.await_cycle(Duration::from_secs(1));
        assert_eq!(thread.permanent_task_count(), 0);
    }

    #[test]
    fn await_cycle_reports_false_when_not_running() {
        let thread = ProcessingThread::new();
        assert!(!thread.await_cycle(Duration::from_millis(50)));
    }

    #[test]
    fn within_processing_thread_is_true_only_inside() {
        let thread = started_thread();
        assert!(!thread.within_processing_thread());
        let future = {
            let shared = thread.shared.clone();
            thread.push_promise_task(move || shared.within_processing_thread())
        };
        assert_eq!(future.wait_timeout(Duration::from_secs(1)), Ok(true));
    }
}
