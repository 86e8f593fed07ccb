//! Background sampling into a bounded smoothing queue.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::background::{lock, BackgroundTask, Signal};
use crate::error::{GpioError, Result};

/// Aggregate over the queued samples, oldest first.
pub type Aggregate = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;

/// Arithmetic mean; the default aggregate.
pub fn mean(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    samples.iter().sum::<f64>() / samples.len() as f64
}

/// Device side of a sampling queue.
pub trait SampleSource: Send + Sync + 'static {
    /// Take one raw reading.
    fn read_sample(&self) -> Result<f64>;

    /// Called with the new aggregate after each sample once the queue is
    /// full (or immediately in partial mode).
    fn on_sample(&self, aggregate: f64);
}

struct QueueShared {
    capacity: usize,
    partial: bool,
    aggregate: Aggregate,
    samples: Mutex<VecDeque<f64>>,
    full: Signal,
}

impl QueueShared {
    fn aggregate(&self) -> f64 {
        let mut samples = lock(&self.samples);
        if samples.is_empty() {
            return 0.0;
        }
        (self.aggregate)(samples.make_contiguous())
    }
}

/// A background task filling a bounded queue every `sample_wait`.
pub struct SamplingQueue {
    shared: Arc<QueueShared>,
    done: Arc<Signal>,
    task: Mutex<Option<BackgroundTask>>,
}

impl fmt::Debug for SamplingQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SamplingQueue")
            .field("capacity", &self.shared.capacity)
            .field("partial", &self.shared.partial)
            .field("len", &lock(&self.shared.samples).len())
            .finish()
    }
}

impl SamplingQueue {
    /// Start sampling `source`.
    ///
    /// The task ends by itself once `source` is dropped or reports
    /// `DeviceClosed`.
    pub fn start<P: SampleSource>(
        name: impl Into<String>,
        source: Weak<P>,
        capacity: usize,
        sample_wait: Duration,
        partial: bool,
        aggregate: Option<Aggregate>,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(GpioError::InputDeviceBadQueueLen);
        }

        let shared = Arc::new(QueueShared {
            capacity,
            partial,
            aggregate: aggregate.unwrap_or_else(|| Arc::new(mean)),
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            full: Signal::new(),
        });

        let queue = Arc::clone(&shared);
        let task = BackgroundTask::spawn(name, move |stop| loop {
            let Some(source) = source.upgrade() else {
                return Ok(());
            };
            let sample = source.read_sample()?;
            let ready = {
                let mut samples = lock(&queue.samples);
                samples.push_back(sample);
                if samples.len() > queue.capacity {
                    samples.pop_front();
                }
                samples.len() == queue.capacity
            };
            if ready {
                queue.full.set();
            }
            if ready || queue.partial {
                source.on_sample(queue.aggregate());
            }
            drop(source);

            if stop.sleep(sample_wait) {
                return Ok(());
            }
        })?;

        Ok(Self {
            shared,
            done: task.done_signal(),
            task: Mutex::new(Some(task)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn partial(&self) -> bool {
        self.shared.partial
    }

    pub fn is_full(&self) -> bool {
        self.shared.full.is_set()
    }

    /// Aggregate of the queued samples.
    ///
    /// Blocks until the queue has filled unless in partial mode, where an
    /// empty queue reads as 0. Fails with `DeviceClosed` if sampling stops
    /// before the queue fills.
    pub fn value(&self, label: &str) -> Result<f64> {
        if !self.shared.partial {
            while !self.shared.full.wait(Some(Duration::from_millis(100))) {
                if self.done.is_set() {
                    return Err(GpioError::DeviceClosed(label.to_string()));
                }
            }
        }
        Ok(self.shared.aggregate())
    }

    /// Stop sampling. Idempotent.
    pub fn stop(&self) {
        let task = lock(&self.task).take();
        drop(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Ramp {
        next: AtomicUsize,
        closed: AtomicBool,
        fed: Mutex<Vec<f64>>,
    }

    impl SampleSource for Ramp {
        fn read_sample(&self) -> Result<f64> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(GpioError::DeviceClosed("ramp".into()));
            }
            Ok(self.next.fetch_add(1, Ordering::SeqCst) as f64)
        }

        fn on_sample(&self, aggregate: f64) {
            lock(&self.fed).push(aggregate);
        }
    }

    #[test]
    fn test_bad_queue_len() {
        let source = Arc::new(Ramp::default());
        let err = SamplingQueue::start(
            "q",
            Arc::downgrade(&source),
            0,
            Duration::ZERO,
            false,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, GpioError::InputDeviceBadQueueLen));
    }

    #[test]
    fn test_blocks_until_full_then_averages_window() {
        let source = Arc::new(Ramp::default());
        let queue = SamplingQueue::start(
            "q-full",
            Arc::downgrade(&source),
            3,
            Duration::from_millis(5),
            false,
            None,
        )
        .unwrap();

        let value = queue.value("ramp").unwrap();
        assert!(queue.is_full());
        // Mean of three consecutive integers starting at n is n + 1
        assert_eq!(value.fract(), 0.0);
        assert!(value >= 1.0);
        queue.stop();
        assert!(!lock(&source.fed).is_empty());
    }

    #[test]
    fn test_partial_reads_immediately() {
        let source = Arc::new(Ramp::default());
        let queue = SamplingQueue::start(
            "q-partial",
            Arc::downgrade(&source),
            100,
            Duration::from_secs(10),
            true,
            Some(Arc::new(|s: &[f64]| s.iter().copied().fold(f64::MIN, f64::max))),
        )
        .unwrap();
        // Only the first sample (0) has been taken
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.value("ramp").unwrap(), 0.0);
        assert!(!queue.is_full());
        assert_eq!(*lock(&source.fed), vec![0.0]);
    }

    #[test]
    fn test_closed_source_unblocks_reader() {
        let source = Arc::new(Ramp::default());
        source.closed.store(true, Ordering::SeqCst);
        let queue = SamplingQueue::start(
            "q-closed",
            Arc::downgrade(&source),
            3,
            Duration::from_millis(5),
            false,
            None,
        )
        .unwrap();
        assert!(matches!(
            queue.value("ramp"),
            Err(GpioError::DeviceClosed(_))
        ));
    }

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1.0, 0.0, 1.0, 0.0]), 0.5);
    }
}
