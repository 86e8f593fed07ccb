//! Source pipelines: a background task writing a stream of values into a
//! device, and the `values()` iterator that produces such streams.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use super::{Device, Value};
use crate::background::{lock, BackgroundTask};
use crate::error::Result;
use crate::tracing::prelude::*;

/// Pause between source writes unless configured otherwise.
pub const DEFAULT_SOURCE_DELAY: Duration = Duration::from_millis(10);

/// The source task slot of one device.
///
/// At most one source runs per device; installing a new one stops and joins
/// the previous task before the new one starts.
pub struct SourceSlot {
    task: Mutex<Option<BackgroundTask>>,
    delay_us: Arc<AtomicU64>,
}

impl fmt::Debug for SourceSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceSlot")
            .field("running", &self.is_running())
            .field("delay", &self.delay())
            .finish()
    }
}

impl Default for SourceSlot {
    fn default() -> Self {
        Self {
            task: Mutex::new(None),
            delay_us: Arc::new(AtomicU64::new(DEFAULT_SOURCE_DELAY.as_micros() as u64)),
        }
    }
}

impl SourceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delay(&self) -> Duration {
        Duration::from_micros(self.delay_us.load(Ordering::Relaxed))
    }

    /// Takes effect from the next write of a running source.
    pub fn set_delay(&self, delay: Duration) {
        self.delay_us
            .store(delay.as_micros().min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task).as_ref().is_some_and(BackgroundTask::is_running)
    }

    /// Stop any running source and, if `source` is given, start writing its
    /// values into `target`.
    pub fn replace<I>(&self, target: Weak<dyn Device>, source: Option<I>) -> Result<()>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        let mut slot = lock(&self.task);
        if let Some(mut old) = slot.take() {
            old.stop();
        }

        let Some(source) = source else {
            return Ok(());
        };

        let name = target
            .upgrade()
            .map(|d| format!("source: {}", d.describe()))
            .unwrap_or_else(|| "source".to_string());
        let delay = Arc::clone(&self.delay_us);
        let mut values = source.into_iter();
        let task = BackgroundTask::spawn(name, move |stop| {
            while !stop.is_set() {
                let Some(value) = values.next() else {
                    break;
                };
                // Checked again after a possibly blocking next()
                if stop.is_set() {
                    break;
                }
                let Some(device) = target.upgrade() else {
                    break;
                };
                device.set_value(value)?;
                drop(device);

                let pause = Duration::from_micros(delay.load(Ordering::Relaxed));
                if stop.sleep(pause) {
                    break;
                }
            }
            Ok(())
        })?;
        debug!(task = task.name(), "Source started");
        *slot = Some(task);
        Ok(())
    }

    /// Stop any running source. Idempotent.
    pub fn stop(&self) {
        let task = lock(&self.task).take();
        drop(task);
    }
}

/// Iterator over a device's current value, ending once the device is
/// closed or dropped.
///
/// Each call to `next()` reads the device once; pacing is up to the
/// consumer (a source pipeline sleeps its own delay between reads).
pub struct ValuesIter {
    device: Weak<dyn Device>,
}

impl ValuesIter {
    pub fn new(device: Weak<dyn Device>) -> Self {
        Self { device }
    }
}

impl Iterator for ValuesIter {
    type Item = Value;

    fn next(&mut self) -> Option<Value> {
        let device = self.device.upgrade()?;
        if device.closed() {
            return None;
        }
        device.value().ok()
    }
}

/// Devices that accept a source pipeline.
pub trait HasSource {
    /// Replace the running source (or just stop it, with `None`).
    fn set_source<I>(&self, source: Option<I>) -> Result<()>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static;

    fn source_delay(&self) -> Duration;

    fn set_source_delay(&self, delay: Duration);
}

/// Devices that can stream their value.
pub trait HasValues {
    fn values(&self) -> ValuesIter;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background::Signal;
    use crate::error::GpioError;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(Instant, f64)>>,
        closed: AtomicBool,
    }

    impl Device for Recorder {
        fn describe(&self) -> String {
            "recorder".into()
        }

        fn value(&self) -> Result<Value> {
            let last = lock(&self.writes).last().map(|w| w.1).unwrap_or(0.0);
            Ok(last.into())
        }

        fn set_value(&self, value: Value) -> Result<()> {
            if self.closed() {
                return Err(GpioError::DeviceClosed("recorder".into()));
            }
            lock(&self.writes).push((Instant::now(), value.scalar()?));
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }

        fn closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    fn target(device: &Arc<Recorder>) -> Weak<dyn Device> {
        let device: Arc<dyn Device> = device.clone();
        Arc::downgrade(&device)
    }

    #[test]
    fn test_finite_source_writes_every_value() {
        let device = Arc::new(Recorder::default());
        let slot = SourceSlot::new();
        slot.set_delay(Duration::from_millis(1));
        let values: Vec<Value> = vec![1.0.into(), 0.0.into(), 1.0.into()];
        slot.replace(target(&device), Some(values)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while slot.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let writes: Vec<f64> = lock(&device.writes).iter().map(|w| w.1).collect();
        assert_eq!(writes, vec![1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_replacement_stops_old_source_first() {
        let device = Arc::new(Recorder::default());
        let slot = SourceSlot::new();
        slot.set_delay(Duration::from_millis(1));

        slot.replace(target(&device), Some(std::iter::repeat(Value::Scalar(0.25))))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        slot.replace(target(&device), Some(std::iter::repeat(Value::Scalar(0.75))))
            .unwrap();
        std::thread::sleep(Duration::from_millis(30));
        slot.stop();

        let writes = lock(&device.writes).clone();
        let first_new = writes.iter().position(|w| w.1 == 0.75).unwrap();
        assert!(first_new > 0);
        assert!(writes[first_new..].iter().all(|w| w.1 == 0.75));
    }

    #[test]
    fn test_none_cancels_without_replacement() {
        let device = Arc::new(Recorder::default());
        let slot = SourceSlot::new();
        slot.replace(target(&device), Some(std::iter::repeat(Value::Scalar(1.0))))
            .unwrap();
        assert!(slot.is_running());
        slot.replace::<Vec<Value>>(target(&device), None).unwrap();
        assert!(!slot.is_running());
    }

    #[test]
    fn test_closed_target_ends_source_quietly() {
        let device = Arc::new(Recorder::default());
        let slot = SourceSlot::new();
        slot.replace(target(&device), Some(std::iter::repeat(Value::Scalar(1.0))))
            .unwrap();
        device.close();

        let deadline = Instant::now() + Duration::from_secs(2);
        while slot.is_running() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!slot.is_running());
    }

    #[test]
    fn test_stop_interrupts_blocking_iterator() {
        let device = Arc::new(Recorder::default());
        let slot = SourceSlot::new();
        let gate = Arc::new(Signal::new());
        let waiter = Arc::clone(&gate);
        // Each next() blocks until the gate opens
        let blocking = std::iter::from_fn(move || {
            waiter.wait(Some(Duration::from_millis(50)));
            Some(Value::Scalar(1.0))
        });
        slot.replace(target(&device), Some(blocking)).unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let start = Instant::now();
        slot.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        gate.set();
    }

    #[test]
    fn test_values_iter_ends_on_close() {
        let device = Arc::new(Recorder::default());
        device.set_value(Value::Scalar(1.0)).unwrap();
        let mut values = ValuesIter::new(target(&device));
        assert_eq!(values.next(), Some(Value::Scalar(1.0)));
        device.close();
        assert_eq!(values.next(), None);
    }
}
