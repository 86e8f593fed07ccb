//! Cancelable background tasks.
//!
//! Blink sequences, source pipelines, sampling queues, hold detection and
//! polled edge detection each run on their own named `std::thread`. A task
//! is driven by a closure that receives the task's stop [`Signal`]; the
//! closure must use [`Signal::wait`] for every pause so that a stop request
//! interrupts it within one step.
//!
//! Every live task is recorded in a [`TaskRegistry`] (the process-wide one
//! by default) so that [`shutdown_all_tasks`] can force-stop everything
//! outstanding when the process is shutting down.
//!
//! # Failure semantics
//!
//! A task whose device was closed or dropped while it was mid-iteration
//! ends quietly: the closure returns [`GpioError::DeviceClosed`] (or
//! `Ok(())` after a failed weak upgrade) and the task logs at `debug`.
//! Any other error ends that task only and is logged at `error`.

use slotmap::{new_key_type, SlotMap};
use std::sync::{Arc, Condvar, LazyLock, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{GpioError, Result};
use crate::tracing::prelude::*;

/// Lock a mutex, ignoring poisoning.
///
/// A panicking user callback must not wedge every other thread touching the
/// same pin or device.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A binary, wait-able flag.
///
/// Used as a task's stop request (where [`Signal::wait`] doubles as an
/// interruptible sleep) and as the active/inactive signals of the edge
/// event model.
#[derive(Debug, Default)]
pub struct Signal {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake every waiter.
    pub fn set(&self) {
        *lock(&self.flag) = true;
        self.cond.notify_all();
    }

    pub fn clear(&self) {
        *lock(&self.flag) = false;
    }

    pub fn is_set(&self) -> bool {
        *lock(&self.flag)
    }

    /// Block until the flag is set or `timeout` elapses.
    ///
    /// Returns `true` if the flag is set, `false` on timeout. A timeout of
    /// `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut flag = lock(&self.flag);
        while !*flag {
            match (timeout, deadline) {
                (None, _) | (Some(_), None) => {
                    flag = self.cond.wait(flag).unwrap_or_else(PoisonError::into_inner);
                }
                (Some(_), Some(deadline)) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    flag = self
                        .cond
                        .wait_timeout(flag, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }
        true
    }

    /// Interruptible sleep: `true` if the flag was set before `duration`.
    pub fn sleep(&self, duration: Duration) -> bool {
        self.wait(Some(duration))
    }
}

new_key_type! {
    /// Registry key of a live background task.
    pub struct TaskKey;
}

#[derive(Debug)]
struct TaskShared {
    name: String,
    stopping: Signal,
    done: Arc<Signal>,
}

/// Bookkeeping of live background tasks.
///
/// Tasks register on start and deregister when joined (or dropped).
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<SlotMap<TaskKey, Arc<TaskShared>>>,
}

static GLOBAL_REGISTRY: LazyLock<Arc<TaskRegistry>> =
    LazyLock::new(|| Arc::new(TaskRegistry::default()));

impl TaskRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The process-wide registry used by [`BackgroundTask::spawn`].
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL_REGISTRY)
    }

    /// Names of the tasks currently registered.
    pub fn live_tasks(&self) -> Vec<String> {
        lock(&self.tasks).values().map(|t| t.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.tasks).is_empty()
    }

    /// Request every registered task to stop, then wait up to `timeout`
    /// per task for it to exit.
    ///
    /// Returns the number of tasks that did not exit in time. Tasks are
    /// not deregistered here; their owners still join them.
    pub fn shutdown_all(&self, timeout: Duration) -> usize {
        let tasks: Vec<Arc<TaskShared>> = lock(&self.tasks).values().cloned().collect();
        for task in &tasks {
            task.stopping.set();
        }

        let mut stuck = 0;
        for task in &tasks {
            if !task.done.wait(Some(timeout)) {
                warn!(task = %task.name, "Background task did not stop in time");
                stuck += 1;
            }
        }

        debug!(tasks = tasks.len(), stuck, "Background tasks shut down");
        stuck
    }

    fn insert(&self, shared: Arc<TaskShared>) -> TaskKey {
        lock(&self.tasks).insert(shared)
    }

    fn remove(&self, key: TaskKey) {
        lock(&self.tasks).remove(key);
    }
}

/// Stop every background task in the process-wide registry.
pub fn shutdown_all_tasks(timeout: Duration) -> usize {
    TaskRegistry::global().shutdown_all(timeout)
}

// Marks the task done even if its body panics.
struct DoneGuard(Arc<TaskShared>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.done.set();
    }
}

/// A cancelable unit of repeated work on its own OS thread.
///
/// Dropping a task stops and joins it.
#[derive(Debug)]
pub struct BackgroundTask {
    shared: Arc<TaskShared>,
    key: TaskKey,
    registry: Arc<TaskRegistry>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Start `body` on a new thread registered in the global registry.
    pub fn spawn<F>(name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(&Signal) -> Result<()> + Send + 'static,
    {
        Self::spawn_in(TaskRegistry::global(), name, body)
    }

    /// Start `body` on a new thread registered in `registry`.
    pub fn spawn_in<F>(registry: Arc<TaskRegistry>, name: impl Into<String>, body: F) -> Result<Self>
    where
        F: FnOnce(&Signal) -> Result<()> + Send + 'static,
    {
        let name = name.into();
        let shared = Arc::new(TaskShared {
            name: name.clone(),
            stopping: Signal::new(),
            done: Arc::new(Signal::new()),
        });
        let key = registry.insert(Arc::clone(&shared));

        let thread_shared = Arc::clone(&shared);
        let spawned = thread::Builder::new().name(name.clone()).spawn(move || {
            let guard = DoneGuard(thread_shared);
            let task = &guard.0;
            trace!(task = %task.name, "Task started");
            match body(&task.stopping) {
                Ok(()) => trace!(task = %task.name, "Task finished"),
                Err(e) if e.is_closed() => {
                    debug!(task = %task.name, "Task target closed, exiting")
                }
                Err(e) => error!(task = %task.name, error = %e, "Task failed"),
            }
        });

        match spawned {
            Ok(handle) => Ok(Self {
                shared,
                key,
                registry,
                handle: Some(handle),
            }),
            Err(e) => {
                registry.remove(key);
                Err(GpioError::Io(e))
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The stop request; set by [`BackgroundTask::stop`].
    pub fn stopping(&self) -> &Signal {
        &self.shared.stopping
    }

    /// Signal set once the task body has returned (or panicked).
    ///
    /// Lets a caller wait for completion without holding whatever lock
    /// guards the task itself.
    pub fn done_signal(&self) -> Arc<Signal> {
        Arc::clone(&self.shared.done)
    }

    /// True until the task body has returned.
    pub fn is_running(&self) -> bool {
        !self.shared.done.is_set()
    }

    /// Request the task to stop and wait until it has fully exited.
    pub fn stop(&mut self) {
        self.shared.stopping.set();
        self.join();
    }

    /// Wait until the task has exited and deregister it.
    ///
    /// When called from the task's own thread (a callback on the task
    /// stopping its own device) the join is skipped; the stop request is
    /// still honored at the task's next wait.
    pub fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if handle.thread().id() == thread::current().id() {
            self.handle = Some(handle);
            return;
        }

        if handle.join().is_err() {
            warn!(task = %self.shared.name, "Background task panicked");
        }
        self.registry.remove(self.key);
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        self.stop();
        // A task dropped from its own thread still leaves the registry.
        self.registry.remove(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_signal_wait_times_out() {
        let signal = Signal::new();
        let start = Instant::now();
        assert!(!signal.wait(Some(Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_signal_wait_returns_early_when_set() {
        let signal = Arc::new(Signal::new());
        let setter = Arc::clone(&signal);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            setter.set();
        });

        let start = Instant::now();
        assert!(signal.wait(Some(Duration::from_secs(5))));
        assert!(start.elapsed() < Duration::from_secs(1));
        handle.join().unwrap();

        signal.clear();
        assert!(!signal.is_set());
    }

    #[test]
    fn test_stop_interrupts_sleep_and_deregisters() {
        let registry = TaskRegistry::new();
        let iterations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&iterations);

        let mut task = BackgroundTask::spawn_in(Arc::clone(&registry), "sleeper", move |stop| {
            while !stop.sleep(Duration::from_secs(10)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(registry.live_tasks(), vec!["sleeper".to_string()]);
        let start = Instant::now();
        task.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(!task.is_running());
        assert_eq!(iterations.load(Ordering::SeqCst), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_natural_completion() {
        let registry = TaskRegistry::new();
        let mut task =
            BackgroundTask::spawn_in(Arc::clone(&registry), "short", |_| Ok(())).unwrap();
        task.join();
        assert!(!task.is_running());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_failing_task_does_not_affect_caller() {
        let registry = TaskRegistry::new();
        let mut task = BackgroundTask::spawn_in(Arc::clone(&registry), "fails", |_| {
            Err(GpioError::PinSetInput(4))
        })
        .unwrap();
        task.join();
        assert!(!task.is_running());
    }

    #[test]
    fn test_panicking_task_is_marked_done() {
        let registry = TaskRegistry::new();
        let mut task = BackgroundTask::spawn_in(Arc::clone(&registry), "panics", |_| {
            panic!("boom");
        })
        .unwrap();
        task.join();
        assert!(!task.is_running());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_shutdown_all_stops_every_task() {
        let registry = TaskRegistry::new();
        let tasks: Vec<BackgroundTask> = (0..3)
            .map(|i| {
                BackgroundTask::spawn_in(Arc::clone(&registry), format!("worker-{i}"), |stop| {
                    stop.wait(None);
                    Ok(())
                })
                .unwrap()
            })
            .collect();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.shutdown_all(Duration::from_secs(1)), 0);
        assert!(tasks.iter().all(|t| !t.is_running()));

        drop(tasks);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drop_stops_task() {
        let registry = TaskRegistry::new();
        let task = BackgroundTask::spawn_in(Arc::clone(&registry), "dropped", |stop| {
            stop.wait(None);
            Ok(())
        })
        .unwrap();
        drop(task);
        assert!(registry.is_empty());
    }
}
