//! Linux sysfs GPIO backend (`/sys/class/gpio`).
//!
//! Pins are exported on first use and unexported when the last handle is
//! dropped (only if this process exported them). The legacy interface has
//! no pull or PWM control. Edge detection is done by a polling background
//! task with a software stable-for-duration debounce filter.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use super::debounce::StableFilter;
use super::{ChangedCallback, Edges, FactoryCore, Pin, PinFactory, PinFunction, PinRef, PinSpec, Pull};
use crate::background::{lock, BackgroundTask};
use crate::error::{GpioError, Result};
use crate::tracing::prelude::*;

/// Default location of the sysfs GPIO class directory.
pub const DEFAULT_ROOT: &str = "/sys/class/gpio";

// Time allowed for udev to create gpioN/ after an export.
const EXPORT_RETRIES: u32 = 20;
const EXPORT_RETRY_DELAY: Duration = Duration::from_millis(10);

// Extra wait after a failed edge-poll read before trying again.
const POLL_RETRY_DELAY: Duration = Duration::from_millis(20);

struct SysfsState {
    function: PinFunction,
    bounce: Option<Duration>,
    edges: Edges,
    when_changed: Option<ChangedCallback>,
    poller: Option<BackgroundTask>,
}

/// One exported sysfs GPIO line.
pub struct SysfsPin {
    number: u32,
    root: PathBuf,
    dir: PathBuf,
    exported_by_us: bool,
    poll_interval: Duration,
    me: Weak<SysfsPin>,
    state: Mutex<SysfsState>,
}

impl fmt::Debug for SysfsPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysfsPin")
            .field("number", &self.number)
            .field("dir", &self.dir)
            .field("function", &lock(&self.state).function)
            .finish()
    }
}

impl SysfsPin {
    fn open(root: &Path, number: u32, poll_interval: Duration) -> Result<Arc<Self>> {
        let dir = root.join(format!("gpio{}", number));
        let mut exported_by_us = false;

        if !dir.exists() {
            fs::write(root.join("export"), number.to_string())?;
            exported_by_us = true;
            let mut retries = 0;
            while !dir.exists() {
                if retries == EXPORT_RETRIES {
                    return Err(GpioError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("{} did not appear after export", dir.display()),
                    )));
                }
                retries += 1;
                thread::sleep(EXPORT_RETRY_DELAY);
            }
            debug!(pin = number, "GPIO exported");
        }

        let function = match read_trimmed(&dir.join("direction"))?.as_str() {
            "out" => PinFunction::Output,
            _ => PinFunction::Input,
        };

        Ok(Arc::new_cyclic(|me| SysfsPin {
            number,
            root: root.to_path_buf(),
            dir,
            exported_by_us,
            poll_interval,
            me: me.clone(),
            state: Mutex::new(SysfsState {
                function,
                bounce: None,
                edges: Edges::BOTH,
                when_changed: None,
                poller: None,
            }),
        }))
    }

    fn read_value(&self) -> Result<bool> {
        match read_trimmed(&self.dir.join("value"))?.as_str() {
            "0" => Ok(false),
            "1" => Ok(true),
            other => Err(GpioError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected value {:?} for GPIO{}", other, self.number),
            ))),
        }
    }

    fn write_attr(&self, attr: &str, value: &str) -> Result<()> {
        fs::write(self.dir.join(attr), value)?;
        trace!(pin = self.number, attr, value, "sysfs write");
        Ok(())
    }

    // Start or stop the edge poller to match the current configuration.
    fn reconfigure_poller(&self) -> Result<()> {
        let (old, wanted) = {
            let mut state = lock(&self.state);
            let old = state.poller.take();
            let wanted = match (&state.when_changed, state.edges.is_empty()) {
                (Some(callback), false) => Some((Arc::clone(callback), state.edges, state.bounce)),
                _ => None,
            };
            (old, wanted)
        };
        drop(old);

        let Some((callback, edges, bounce)) = wanted else {
            return Ok(());
        };

        let pin = self.me.clone();
        let interval = self.poll_interval;
        let initial = self.read_value()?;
        let task = BackgroundTask::spawn(format!("gpio{}-edges", self.number), move |stop| {
            let mut filter = StableFilter::new(bounce.unwrap_or(Duration::ZERO), Some(initial));
            let mut failing = false;
            while !stop.sleep(interval) {
                let Some(pin) = pin.upgrade() else {
                    return Ok(());
                };
                let now = Instant::now();
                let value = match pin.read_value() {
                    Ok(value) => value,
                    Err(e) => {
                        // Warn once per run of failures, then keep polling
                        if !failing {
                            warn!(pin = pin.number, error = %e, "Edge poll read failed, retrying");
                            failing = true;
                        }
                        drop(pin);
                        if stop.sleep(POLL_RETRY_DELAY) {
                            break;
                        }
                        continue;
                    }
                };
                if failing {
                    debug!(pin = pin.number, "Edge poll reads recovered");
                    failing = false;
                }
                let committed = filter.observe(value, now).or_else(|| filter.poll(now));
                if let Some((high, at)) = committed {
                    if edges.matches(high) {
                        callback(at, high);
                    }
                }
            }
            Ok(())
        })?;

        lock(&self.state).poller = Some(task);
        Ok(())
    }

    fn stop_poller(&self) {
        let poller = lock(&self.state).poller.take();
        drop(poller);
    }
}

fn read_trimmed(path: &Path) -> Result<String> {
    Ok(fs::read_to_string(path)?.trim().to_string())
}

impl Pin for SysfsPin {
    fn number(&self) -> u32 {
        self.number
    }

    fn function(&self) -> PinFunction {
        lock(&self.state).function
    }

    fn set_function(&self, function: PinFunction) -> Result<()> {
        let direction = match function {
            PinFunction::Input => "in",
            PinFunction::Output => "out",
            PinFunction::Alt(_) => {
                return Err(GpioError::PinInvalidFunction {
                    pin: Some(self.number),
                    function: function.to_string(),
                })
            }
        };
        let mut state = lock(&self.state);
        self.write_attr("direction", direction)?;
        state.function = function;
        Ok(())
    }

    fn state(&self) -> Result<f64> {
        Ok(if self.read_value()? { 1.0 } else { 0.0 })
    }

    fn set_state(&self, value: f64) -> Result<()> {
        let state = lock(&self.state);
        if state.function == PinFunction::Input {
            return Err(GpioError::PinSetInput(self.number));
        }
        if !(0.0..=1.0).contains(&value) {
            return Err(GpioError::PinInvalidState {
                pin: self.number,
                state: value,
            });
        }
        self.write_attr("value", if value != 0.0 { "1" } else { "0" })
    }

    fn pull(&self) -> Pull {
        Pull::Floating
    }

    fn set_pull(&self, pull: Pull) -> Result<()> {
        if lock(&self.state).function != PinFunction::Input {
            return Err(GpioError::PinFixedPull {
                pin: self.number,
                reason: "pin is not an input".to_string(),
            });
        }
        match pull {
            Pull::Floating => Ok(()),
            _ => Err(GpioError::PinUnsupported {
                pin: self.number,
                operation: "pull resistors",
            }),
        }
    }

    fn bounce(&self) -> Option<Duration> {
        lock(&self.state).bounce
    }

    fn set_bounce(&self, bounce: Option<Duration>) -> Result<()> {
        lock(&self.state).bounce = bounce.filter(|b| !b.is_zero());
        self.reconfigure_poller()
    }

    fn edges(&self) -> Edges {
        lock(&self.state).edges
    }

    fn set_edges(&self, edges: Edges) -> Result<()> {
        lock(&self.state).edges = edges;
        self.reconfigure_poller()
    }

    fn set_when_changed(&self, callback: Option<ChangedCallback>) -> Result<()> {
        lock(&self.state).when_changed = callback;
        self.reconfigure_poller()
    }

    fn output_with_state(&self, value: f64) -> Result<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(GpioError::PinInvalidState {
                pin: self.number,
                state: value,
            });
        }
        let mut state = lock(&self.state);
        // "high"/"low" set direction and initial level in one write
        self.write_attr("direction", if value != 0.0 { "high" } else { "low" })?;
        state.function = PinFunction::Output;
        Ok(())
    }

    fn input_with_pull(&self, pull: Pull) -> Result<()> {
        if pull != Pull::Floating {
            return Err(GpioError::PinUnsupported {
                pin: self.number,
                operation: "pull resistors",
            });
        }
        self.set_function(PinFunction::Input)
    }

    fn close(&self) -> Result<()> {
        self.stop_poller();
        {
            let mut state = lock(&self.state);
            state.when_changed = None;
            state.bounce = None;
            state.edges = Edges::BOTH;
        }
        self.set_function(PinFunction::Input)
    }
}

impl Drop for SysfsPin {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(pin = self.number, error = %e, "Failed to reset GPIO");
        }
        if self.exported_by_us {
            match fs::write(self.root.join("unexport"), self.number.to_string()) {
                Ok(()) => debug!(pin = self.number, "GPIO unexported"),
                Err(e) => warn!(pin = self.number, error = %e, "Failed to unexport GPIO"),
            }
        }
    }
}

/// Factory for [`SysfsPin`]s under a sysfs root.
///
/// Pins are cached weakly: once every owner has dropped a pin, it is
/// unexported and the next request exports it afresh.
pub struct SysfsFactory {
    core: FactoryCore,
    root: PathBuf,
    poll_interval: Duration,
    pins: Mutex<HashMap<u32, Weak<SysfsPin>>>,
}

impl fmt::Debug for SysfsFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SysfsFactory")
            .field("root", &self.root)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

impl SysfsFactory {
    pub fn new(root: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            core: FactoryCore::new(),
            root: root.into(),
            poll_interval,
            pins: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl PinFactory for SysfsFactory {
    fn name(&self) -> &'static str {
        "sysfs"
    }

    fn core(&self) -> &FactoryCore {
        &self.core
    }

    fn pin(&self, spec: &PinSpec) -> Result<PinRef> {
        let number = spec.resolve(None)?;
        let mut pins = lock(&self.pins);
        if let Some(pin) = pins.get(&number).and_then(Weak::upgrade) {
            let pin: PinRef = pin;
            return Ok(pin);
        }
        let pin = SysfsPin::open(&self.root, number, self.poll_interval)?;
        pins.insert(number, Arc::downgrade(&pin));
        let pin: PinRef = pin;
        Ok(pin)
    }

    fn close(&self) -> Result<()> {
        let live: Vec<Arc<SysfsPin>> = lock(&self.pins)
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect();
        for pin in live {
            pin.close()?;
        }
        self.core.clear_reservations();
        debug!(root = %self.root.display(), "sysfs factory closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn fake_gpio(root: &Path, number: u32, direction: &str, value: &str) {
        let dir = root.join(format!("gpio{}", number));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("direction"), direction).unwrap();
        fs::write(dir.join("value"), value).unwrap();
    }

    fn read(root: &Path, number: u32, attr: &str) -> String {
        fs::read_to_string(root.join(format!("gpio{}", number)).join(attr))
            .unwrap()
            .trim()
            .to_string()
    }

    fn factory(tmp: &TempDir) -> SysfsFactory {
        SysfsFactory::new(tmp.path(), Duration::from_millis(1))
    }

    #[test]
    fn test_pin_identity_and_direction() {
        let tmp = TempDir::new().unwrap();
        fake_gpio(tmp.path(), 17, "in\n", "0\n");
        let factory = factory(&tmp);

        let a = factory.pin(&PinSpec::Number(17)).unwrap();
        let b = factory.pin(&"GPIO17".into()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.function(), PinFunction::Input);

        a.output_with_state(1.0).unwrap();
        assert_eq!(read(tmp.path(), 17, "direction"), "high");
        assert_eq!(a.function(), PinFunction::Output);

        a.set_state(0.0).unwrap();
        assert_eq!(read(tmp.path(), 17, "value"), "0");
    }

    #[test]
    fn test_capability_errors() {
        let tmp = TempDir::new().unwrap();
        fake_gpio(tmp.path(), 4, "in", "1");
        let factory = factory(&tmp);
        let pin = factory.pin(&PinSpec::Number(4)).unwrap();

        assert_eq!(pin.state().unwrap(), 1.0);
        assert!(matches!(pin.set_state(1.0), Err(GpioError::PinSetInput(4))));
        assert!(matches!(
            pin.set_pull(Pull::Up),
            Err(GpioError::PinUnsupported { pin: 4, .. })
        ));
        pin.set_pull(Pull::Floating).unwrap();
        assert!(matches!(
            pin.set_frequency(Some(100.0)),
            Err(GpioError::PinPwmUnsupported(4))
        ));
        assert!(matches!(
            pin.set_function(PinFunction::Alt(2)),
            Err(GpioError::PinInvalidFunction { pin: Some(4), .. })
        ));

        pin.set_function(PinFunction::Output).unwrap();
        assert!(matches!(
            pin.set_pull(Pull::Floating),
            Err(GpioError::PinFixedPull { pin: 4, .. })
        ));
    }

    #[test]
    fn test_missing_export_fails() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("export"), "").unwrap();
        let factory = factory(&tmp);

        let err = factory.pin(&PinSpec::Number(5)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
        // The export was attempted
        assert_eq!(fs::read_to_string(tmp.path().join("export")).unwrap(), "5");
    }

    #[test]
    fn test_polled_edges() {
        let tmp = TempDir::new().unwrap();
        fake_gpio(tmp.path(), 22, "in", "0");
        let factory = factory(&tmp);
        let pin = factory.pin(&PinSpec::Number(22)).unwrap();

        let rising = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rising);
        pin.set_edges(Edges::RISING).unwrap();
        pin.set_when_changed(Some(Arc::new(move |_, high| {
            assert!(high);
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        let value = tmp.path().join("gpio22").join("value");
        fs::write(&value, "1").unwrap();
        thread::sleep(Duration::from_millis(100));
        fs::write(&value, "0").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(rising.load(Ordering::SeqCst), 1);

        pin.close().unwrap();
        fs::write(&value, "1").unwrap();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(rising.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_edge_polling_survives_bad_reads() {
        let tmp = TempDir::new().unwrap();
        fake_gpio(tmp.path(), 23, "in", "0");
        let factory = factory(&tmp);
        let pin = factory.pin(&PinSpec::Number(23)).unwrap();

        let changes = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&changes);
        pin.set_when_changed(Some(Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        let value = tmp.path().join("gpio23").join("value");
        fs::write(&value, "garbage").unwrap();
        thread::sleep(Duration::from_millis(100));
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        fs::write(&value, "1").unwrap();
        thread::sleep(Duration::from_millis(150));
        assert_eq!(changes.load(Ordering::SeqCst), 1);
        pin.close().unwrap();
    }

    #[test]
    fn test_drop_unexports_only_own_exports() {
        let tmp = TempDir::new().unwrap();
        fake_gpio(tmp.path(), 6, "out", "0");
        fs::write(tmp.path().join("unexport"), "").unwrap();
        let factory = factory(&tmp);

        let pin = factory.pin(&PinSpec::Number(6)).unwrap();
        drop(pin);
        // Already exported before we started, so left alone
        assert_eq!(fs::read_to_string(tmp.path().join("unexport")).unwrap(), "");
        assert_eq!(read(tmp.path(), 6, "direction"), "in");
    }
}
