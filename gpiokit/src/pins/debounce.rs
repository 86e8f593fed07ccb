//! Software debounce for backends without native support.
//!
//! A raw reading only becomes the committed value once it has held steady
//! for the configured window. Anything that flips back before the window
//! ends is discarded without ever reaching the edge-event model.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::background::{lock, BackgroundTask, Signal};
use crate::error::Result;

// Longest the worker sleeps before rechecking its stop signal.
const STOP_POLL: Duration = Duration::from_millis(50);

/// Stable-for-duration filter over boolean readings.
#[derive(Debug, Clone)]
pub struct StableFilter {
    window: Duration,
    committed: Option<bool>,
    // value waiting to be committed, and when it first appeared
    candidate: Option<(bool, Instant)>,
}

impl StableFilter {
    pub fn new(window: Duration, initial: Option<bool>) -> Self {
        Self {
            window,
            committed: initial,
            candidate: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn committed(&self) -> Option<bool> {
        self.committed
    }

    /// Feed a raw reading taken at `now`.
    ///
    /// With a zero window a change commits immediately and is returned
    /// here; otherwise it becomes a candidate for [`StableFilter::poll`].
    pub fn observe(&mut self, value: bool, now: Instant) -> Option<(bool, Instant)> {
        if self.committed == Some(value) {
            self.candidate = None;
            return None;
        }

        if self.window.is_zero() {
            self.committed = Some(value);
            self.candidate = None;
            return Some((value, now));
        }

        match self.candidate {
            Some((pending, _)) if pending == value => {}
            _ => self.candidate = Some((value, now)),
        }
        None
    }

    /// Commit the candidate if it has been stable for the window.
    ///
    /// Returns the committed value and the instant it first appeared.
    pub fn poll(&mut self, now: Instant) -> Option<(bool, Instant)> {
        let (value, since) = self.candidate?;
        if now.saturating_duration_since(since) < self.window {
            return None;
        }
        self.committed = Some(value);
        self.candidate = None;
        Some((value, since))
    }

    /// When the current candidate will be committed, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.candidate
            .and_then(|(_, since)| since.checked_add(self.window))
    }
}

type Sink = Box<dyn Fn(Instant, bool) + Send + Sync>;

struct WorkerShared {
    filter: Mutex<StableFilter>,
    kick: Signal,
    sink: Sink,
}

/// Runs a [`StableFilter`] on its own thread for push-style backends.
///
/// The backend calls [`DebounceWorker::observe`] on every raw change; the
/// worker calls `sink` with each committed value once its window expires.
pub struct DebounceWorker {
    shared: Arc<WorkerShared>,
    task: Option<BackgroundTask>,
}

impl std::fmt::Debug for DebounceWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DebounceWorker")
            .field("filter", &*lock(&self.shared.filter))
            .finish()
    }
}

impl DebounceWorker {
    pub fn start<F>(name: impl Into<String>, filter: StableFilter, sink: F) -> Result<Self>
    where
        F: Fn(Instant, bool) + Send + Sync + 'static,
    {
        let shared = Arc::new(WorkerShared {
            filter: Mutex::new(filter),
            kick: Signal::new(),
            sink: Box::new(sink),
        });

        let worker = Arc::clone(&shared);
        let task = BackgroundTask::spawn(name, move |stop| {
            while !stop.is_set() {
                let timeout = lock(&worker.filter)
                    .deadline()
                    .map_or(STOP_POLL, |d| {
                        d.saturating_duration_since(Instant::now()).min(STOP_POLL)
                    });
                if worker.kick.wait(Some(timeout)) {
                    worker.kick.clear();
                }
                if stop.is_set() {
                    break;
                }
                let committed = lock(&worker.filter).poll(Instant::now());
                if let Some((state, at)) = committed {
                    (worker.sink)(at, state);
                }
            }
            Ok(())
        })?;

        Ok(Self {
            shared,
            task: Some(task),
        })
    }

    /// Feed a raw reading. Zero-window commits are delivered immediately on
    /// the caller's thread.
    pub fn observe(&self, value: bool, now: Instant) {
        let immediate = lock(&self.shared.filter).observe(value, now);
        match immediate {
            Some((state, at)) => (self.shared.sink)(at, state),
            None => self.shared.kick.set(),
        }
    }

    pub fn window(&self) -> Duration {
        lock(&self.shared.filter).window()
    }
}

impl Drop for DebounceWorker {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.stopping().set();
            self.shared.kick.set();
            drop(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_zero_window_commits_immediately() {
        let t0 = Instant::now();
        let mut filter = StableFilter::new(Duration::ZERO, Some(false));
        assert_eq!(filter.observe(false, t0), None);
        assert_eq!(filter.observe(true, t0), Some((true, t0)));
        assert_eq!(filter.committed(), Some(true));
    }

    #[test]
    fn test_glitch_is_discarded() {
        let t0 = Instant::now();
        let mut filter = StableFilter::new(ms(10), Some(false));

        assert_eq!(filter.observe(true, t0), None);
        assert_eq!(filter.deadline(), Some(t0 + ms(10)));
        assert_eq!(filter.poll(t0 + ms(5)), None);

        // Back to the committed value before the window ends
        assert_eq!(filter.observe(false, t0 + ms(6)), None);
        assert_eq!(filter.deadline(), None);
        assert_eq!(filter.poll(t0 + ms(50)), None);
        assert_eq!(filter.committed(), Some(false));
    }

    #[test]
    fn test_stable_value_commits_with_first_change_time() {
        let t0 = Instant::now();
        let mut filter = StableFilter::new(ms(10), Some(false));

        filter.observe(true, t0);
        // Repeated readings of the same candidate keep the first timestamp
        filter.observe(true, t0 + ms(4));
        assert_eq!(filter.poll(t0 + ms(10)), Some((true, t0)));
        assert_eq!(filter.committed(), Some(true));
        assert_eq!(filter.poll(t0 + ms(20)), None);
    }

    #[test]
    fn test_first_reading_commits_from_unknown() {
        let t0 = Instant::now();
        let mut filter = StableFilter::new(ms(10), None);
        filter.observe(false, t0);
        assert_eq!(filter.poll(t0 + ms(10)), Some((false, t0)));
    }

    #[test]
    fn test_worker_delivers_after_window() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let worker = DebounceWorker::start(
            "test-debounce",
            StableFilter::new(ms(20), Some(false)),
            move |_, state| {
                let _ = lock(&tx).send(state);
            },
        )
        .unwrap();

        let start = Instant::now();
        worker.observe(true, Instant::now());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), true);
        assert!(start.elapsed() >= ms(20));

        // A glitch shorter than the window never arrives
        worker.observe(false, Instant::now());
        worker.observe(true, Instant::now());
        assert!(rx.recv_timeout(ms(80)).is_err());
    }
}
