//! Input devices: plain and edge-driven digital inputs, buttons, and
//! smoothed (queue-averaged) inputs such as PIR motion sensors.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};

use crate::background::lock;
use crate::device::events::HoldDetector;
use crate::device::queue::{Aggregate, SampleSource, SamplingQueue};
use crate::device::source::{HasValues, ValuesIter};
use crate::device::{delegate_device, Device, EdgeEvents, EventHandler, GpioDevice, Value};
use crate::error::{GpioError, Result};
use crate::pins::{ChangedCallback, Edges, PinFactory, PinSpec, Pull};
use crate::tracing::prelude::*;

/// Work out the pull and the active level from the builder options.
///
/// With a pull resistor the active level is implied (pull-up means active
/// low); `active_state` is only accepted, and then required, for floating
/// inputs.
fn resolve_pull(pull_up: Option<bool>, active_state: Option<bool>) -> Result<(Pull, bool)> {
    match (pull_up, active_state) {
        (Some(true), None) => Ok((Pull::Up, false)),
        (Some(false), None) => Ok((Pull::Down, true)),
        (None, Some(active_high)) => Ok((Pull::Floating, active_high)),
        _ => Err(GpioError::InputDeviceBadActiveState),
    }
}

/// Pin ownership plus the active-level mapping shared by every input.
struct InputCore {
    gpio: GpioDevice,
    pull: Pull,
    active_high: bool,
}

impl InputCore {
    fn open(
        factory: Option<Arc<dyn PinFactory>>,
        spec: PinSpec,
        kind: &str,
        pull_up: Option<bool>,
        active_state: Option<bool>,
    ) -> Result<Self> {
        let (pull, active_high) = resolve_pull(pull_up, active_state)?;
        let gpio = GpioDevice::open(factory, spec, kind)?;
        gpio.pin()?.input_with_pull(pull)?;
        Ok(Self {
            gpio,
            pull,
            active_high,
        })
    }

    fn is_high(&self) -> Result<bool> {
        Ok(self.gpio.pin()?.state()? != 0.0)
    }

    fn read(&self) -> Result<bool> {
        Ok(self.is_high()? == self.active_high)
    }

    fn pull_up(&self) -> Option<bool> {
        match self.pull {
            Pull::Up => Some(true),
            Pull::Down => Some(false),
            Pull::Floating => None,
        }
    }
}

macro_rules! input_builder_common {
    () => {
        /// `Some(true)` for a pull-up, `Some(false)` for a pull-down,
        /// `None` for a floating input (then `active_state` is required).
        pub fn pull_up(mut self, pull_up: Option<bool>) -> Self {
            self.pull_up = pull_up;
            self
        }

        /// Active level of a floating input (`true` = active high).
        pub fn active_state(mut self, active_high: Option<bool>) -> Self {
            self.active_state = active_high;
            self
        }

        pub fn pin_factory(mut self, factory: Arc<dyn PinFactory>) -> Self {
            self.factory = Some(factory);
            self
        }
    };
}

// Plain input

struct InputInner {
    core: InputCore,
}

impl Device for InputInner {
    fn describe(&self) -> String {
        self.core.gpio.describe()
    }

    fn value(&self) -> Result<Value> {
        Ok(self.core.read()?.into())
    }

    fn close(&self) {
        self.core.gpio.close()
    }

    fn closed(&self) -> bool {
        self.core.gpio.closed()
    }
}

/// A GPIO input with no event handling.
pub struct InputDevice {
    inner: Arc<InputInner>,
}

pub struct InputDeviceBuilder {
    spec: PinSpec,
    kind: &'static str,
    pull_up: Option<bool>,
    active_state: Option<bool>,
    factory: Option<Arc<dyn PinFactory>>,
}

impl InputDeviceBuilder {
    input_builder_common!();

    pub(crate) fn kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    pub fn build(self) -> Result<InputDevice> {
        let core = InputCore::open(
            self.factory,
            self.spec,
            self.kind,
            self.pull_up,
            self.active_state,
        )?;
        Ok(InputDevice {
            inner: Arc::new(InputInner { core }),
        })
    }
}

impl InputDevice {
    /// Defaults to a pull-down (active high) input.
    pub fn builder(pin: impl Into<PinSpec>) -> InputDeviceBuilder {
        InputDeviceBuilder {
            spec: pin.into(),
            kind: "InputDevice",
            pull_up: Some(false),
            active_state: None,
            factory: None,
        }
    }

    pub fn pull_up(&self) -> Option<bool> {
        self.inner.core.pull_up()
    }

    pub fn pin_number(&self) -> u32 {
        self.inner.core.gpio.number()
    }

    /// Logical state, after applying the active level.
    pub fn read(&self) -> Result<bool> {
        self.inner.core.read()
    }

    /// Physical pin level, ignoring the active level.
    pub fn is_high(&self) -> Result<bool> {
        self.inner.core.is_high()
    }
}

impl fmt::Debug for InputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.describe())
    }
}

delegate_device!(InputDevice => inner);

impl HasValues for InputDevice {
    fn values(&self) -> ValuesIter {
        let target: Weak<InputInner> = Arc::downgrade(&self.inner);
        ValuesIter::new(target)
    }
}

impl Drop for InputDevice {
    fn drop(&mut self) {
        self.inner.close();
    }
}

// Edge-driven digital input

struct DigitalInner {
    core: InputCore,
    events: Arc<EdgeEvents>,
    hold: Mutex<Option<HoldDetector>>,
}

impl DigitalInner {
    fn on_edge(&self, at: Instant, high: bool) {
        let transition = self.events.fire(self, high == self.core.active_high, at);
        trace!(device = %self.core.gpio.label(), ?transition, "Edge");
        if let Some(hold) = lock(&self.hold).as_ref() {
            hold.on_transition(transition);
        }
    }
}

impl Device for DigitalInner {
    fn describe(&self) -> String {
        self.core.gpio.describe()
    }

    fn value(&self) -> Result<Value> {
        Ok(self.core.read()?.into())
    }

    fn close(&self) {
        if self.core.gpio.closed() {
            return;
        }
        // Out of the lock first: the hold task may be inside a handler.
        let hold = lock(&self.hold).take();
        drop(hold);
        if let Ok(pin) = self.core.gpio.pin() {
            if let Err(e) = pin.set_when_changed(None) {
                debug!(device = %self.core.gpio.label(), error = %e, "Failed to clear callback");
            }
        }
        self.core.gpio.close();
    }

    fn closed(&self) -> bool {
        self.core.gpio.closed()
    }
}

/// A digital input reporting activated/deactivated edges.
///
/// Edge callbacks run on the pin backend's thread (or the debounce
/// thread when a bounce time is set).
pub struct DigitalInputDevice {
    inner: Arc<DigitalInner>,
}

pub struct DigitalInputDeviceBuilder {
    spec: PinSpec,
    kind: &'static str,
    pull_up: Option<bool>,
    active_state: Option<bool>,
    bounce_time: Option<Duration>,
    factory: Option<Arc<dyn PinFactory>>,
}

impl DigitalInputDeviceBuilder {
    input_builder_common!();

    /// Ignore changes that do not last this long.
    pub fn bounce_time(mut self, bounce: Option<Duration>) -> Self {
        self.bounce_time = bounce;
        self
    }

    pub fn build(self) -> Result<DigitalInputDevice> {
        let core = InputCore::open(
            self.factory,
            self.spec,
            self.kind,
            self.pull_up,
            self.active_state,
        )?;
        let pin = core.gpio.pin()?;
        pin.set_bounce(self.bounce_time)?;
        pin.set_edges(Edges::BOTH)?;

        let inner = Arc::new(DigitalInner {
            core,
            events: Arc::new(EdgeEvents::new()),
            hold: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        let callback: ChangedCallback = Arc::new(move |at, high| {
            if let Some(inner) = weak.upgrade() {
                inner.on_edge(at, high);
            }
        });
        pin.set_when_changed(Some(callback))?;

        // Record the starting state; never fires a callback
        let initial = inner.core.is_high()?;
        inner.on_edge(Instant::now(), initial);

        Ok(DigitalInputDevice { inner })
    }
}

impl DigitalInputDevice {
    /// Defaults to a pull-down (active high) input without debounce.
    pub fn builder(pin: impl Into<PinSpec>) -> DigitalInputDeviceBuilder {
        DigitalInputDeviceBuilder {
            spec: pin.into(),
            kind: "DigitalInputDevice",
            pull_up: Some(false),
            active_state: None,
            bounce_time: None,
            factory: None,
        }
    }

    pub fn pull_up(&self) -> Option<bool> {
        self.inner.core.pull_up()
    }

    pub fn pin_number(&self) -> u32 {
        self.inner.core.gpio.number()
    }

    pub fn set_when_activated(&self, handler: Option<EventHandler>) {
        self.inner.events.set_when_activated(handler);
    }

    pub fn set_when_deactivated(&self, handler: Option<EventHandler>) {
        self.inner.events.set_when_deactivated(handler);
    }

    /// Block until active; `false` on timeout.
    pub fn wait_for_active(&self, timeout: Option<Duration>) -> bool {
        self.inner.events.wait_for_active(timeout)
    }

    /// Block until inactive; `false` on timeout.
    pub fn wait_for_inactive(&self, timeout: Option<Duration>) -> bool {
        self.inner.events.wait_for_inactive(timeout)
    }

    pub fn active_time(&self) -> Option<Duration> {
        self.inner.events.active_time()
    }

    pub fn inactive_time(&self) -> Option<Duration> {
        self.inner.events.inactive_time()
    }

    fn target(&self) -> Weak<dyn Device> {
        let target: Weak<DigitalInner> = Arc::downgrade(&self.inner);
        target
    }
}

impl fmt::Debug for DigitalInputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.describe())
    }
}

delegate_device!(DigitalInputDevice => inner);

impl HasValues for DigitalInputDevice {
    fn values(&self) -> ValuesIter {
        ValuesIter::new(self.target())
    }
}

impl Drop for DigitalInputDevice {
    fn drop(&mut self) {
        self.inner.close();
    }
}

// Button

/// Default time a button must be held before `when_held` fires.
pub const DEFAULT_HOLD_TIME: Duration = Duration::from_secs(1);

/// A push button: a pulled-up digital input with press/release/hold
/// events.
pub struct Button(DigitalInputDevice);

pub struct ButtonBuilder {
    input: DigitalInputDeviceBuilder,
    hold_time: Duration,
    hold_repeat: bool,
}

impl ButtonBuilder {
    pub fn pull_up(mut self, pull_up: Option<bool>) -> Self {
        self.input = self.input.pull_up(pull_up);
        self
    }

    pub fn active_state(mut self, active_high: Option<bool>) -> Self {
        self.input = self.input.active_state(active_high);
        self
    }

    pub fn bounce_time(mut self, bounce: Option<Duration>) -> Self {
        self.input = self.input.bounce_time(bounce);
        self
    }

    pub fn hold_time(mut self, hold_time: Duration) -> Self {
        self.hold_time = hold_time;
        self
    }

    /// Keep firing `when_held` every `hold_time` while held.
    pub fn hold_repeat(mut self, repeat: bool) -> Self {
        self.hold_repeat = repeat;
        self
    }

    pub fn pin_factory(mut self, factory: Arc<dyn PinFactory>) -> Self {
        self.input = self.input.pin_factory(factory);
        self
    }

    pub fn build(self) -> Result<Button> {
        let device = self.input.build()?;
        let hold = HoldDetector::start(
            format!("hold: {}", device.inner.core.gpio.label()),
            Arc::clone(&device.inner.events),
            device.target(),
            self.hold_time,
            self.hold_repeat,
        )?;
        *lock(&device.inner.hold) = Some(hold);
        Ok(Button(device))
    }
}

impl Button {
    /// Defaults to a pull-up (active low) button, held after one second.
    pub fn builder(pin: impl Into<PinSpec>) -> ButtonBuilder {
        let mut input = DigitalInputDevice::builder(pin).pull_up(Some(true));
        input.kind = "Button";
        ButtonBuilder {
            input,
            hold_time: DEFAULT_HOLD_TIME,
            hold_repeat: false,
        }
    }

    pub fn is_pressed(&self) -> Result<bool> {
        self.0.is_active()
    }

    pub fn set_when_pressed(&self, handler: Option<EventHandler>) {
        self.0.set_when_activated(handler);
    }

    pub fn set_when_released(&self, handler: Option<EventHandler>) {
        self.0.set_when_deactivated(handler);
    }

    pub fn set_when_held(&self, handler: Option<EventHandler>) {
        if let Some(hold) = lock(&self.0.inner.hold).as_ref() {
            hold.set_when_held(handler);
        }
    }

    pub fn wait_for_press(&self, timeout: Option<Duration>) -> bool {
        self.0.wait_for_active(timeout)
    }

    pub fn wait_for_release(&self, timeout: Option<Duration>) -> bool {
        self.0.wait_for_inactive(timeout)
    }

    /// True while pressed and past the hold time.
    pub fn is_held(&self) -> bool {
        lock(&self.0.inner.hold)
            .as_ref()
            .is_some_and(HoldDetector::is_held)
    }

    pub fn held_time(&self) -> Option<Duration> {
        lock(&self.0.inner.hold)
            .as_ref()
            .and_then(HoldDetector::held_time)
    }

    pub fn hold_time(&self) -> Duration {
        lock(&self.0.inner.hold)
            .as_ref()
            .map_or(DEFAULT_HOLD_TIME, HoldDetector::hold_time)
    }

    pub fn set_hold_time(&self, hold_time: Duration) {
        if let Some(hold) = lock(&self.0.inner.hold).as_ref() {
            hold.set_hold_time(hold_time);
        }
    }

    pub fn hold_repeat(&self) -> bool {
        lock(&self.0.inner.hold)
            .as_ref()
            .is_some_and(HoldDetector::hold_repeat)
    }

    pub fn set_hold_repeat(&self, repeat: bool) {
        if let Some(hold) = lock(&self.0.inner.hold).as_ref() {
            hold.set_hold_repeat(repeat);
        }
    }
}

impl Deref for Button {
    type Target = DigitalInputDevice;

    fn deref(&self) -> &DigitalInputDevice {
        &self.0
    }
}

impl fmt::Debug for Button {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

delegate_device!(Button => 0);

impl HasValues for Button {
    fn values(&self) -> ValuesIter {
        self.0.values()
    }
}

// Smoothed input

struct SmoothedInner {
    core: InputCore,
    events: Arc<EdgeEvents>,
    threshold: f64,
    queue: OnceLock<SamplingQueue>,
}

impl SmoothedInner {
    fn queue(&self) -> Result<&SamplingQueue> {
        self.queue
            .get()
            .ok_or_else(|| GpioError::DeviceClosed(self.core.gpio.label().to_string()))
    }

    fn smoothed(&self) -> Result<f64> {
        if self.core.gpio.closed() {
            return Err(GpioError::DeviceClosed(self.core.gpio.label().to_string()));
        }
        self.queue()?.value(self.core.gpio.label())
    }
}

impl SampleSource for SmoothedInner {
    fn read_sample(&self) -> Result<f64> {
        Ok(if self.core.read()? { 1.0 } else { 0.0 })
    }

    fn on_sample(&self, aggregate: f64) {
        self.events
            .fire(self, aggregate > self.threshold, Instant::now());
    }
}

impl Device for SmoothedInner {
    fn describe(&self) -> String {
        self.core.gpio.describe()
    }

    fn value(&self) -> Result<Value> {
        Ok(self.smoothed()?.into())
    }

    fn is_active(&self) -> Result<bool> {
        Ok(self.smoothed()? > self.threshold)
    }

    fn close(&self) {
        if let Some(queue) = self.queue.get() {
            queue.stop();
        }
        self.core.gpio.close();
    }

    fn closed(&self) -> bool {
        self.core.gpio.closed()
    }
}

/// An input whose value is the average of recent samples taken by a
/// background task; active when the average exceeds `threshold`.
pub struct SmoothedInputDevice {
    inner: Arc<SmoothedInner>,
}

pub struct SmoothedInputDeviceBuilder<T = SmoothedInputDevice> {
    spec: PinSpec,
    kind: &'static str,
    pull_up: Option<bool>,
    active_state: Option<bool>,
    threshold: f64,
    queue_len: usize,
    sample_wait: Duration,
    partial: bool,
    average: Option<Aggregate>,
    factory: Option<Arc<dyn PinFactory>>,
    _device: PhantomData<fn() -> T>,
}

impl<T: From<SmoothedInputDevice>> SmoothedInputDeviceBuilder<T> {
    fn new(spec: PinSpec, kind: &'static str) -> Self {
        Self {
            spec,
            kind,
            pull_up: Some(false),
            active_state: None,
            threshold: 0.5,
            queue_len: 5,
            sample_wait: Duration::ZERO,
            partial: false,
            average: None,
            factory: None,
            _device: PhantomData,
        }
    }

    input_builder_common!();

    /// Average above which the device counts as active (0 to 1).
    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn queue_len(mut self, queue_len: usize) -> Self {
        self.queue_len = queue_len;
        self
    }

    /// Pause between samples.
    pub fn sample_wait(mut self, sample_wait: Duration) -> Self {
        self.sample_wait = sample_wait;
        self
    }

    /// Report values before the queue has filled.
    pub fn partial(mut self, partial: bool) -> Self {
        self.partial = partial;
        self
    }

    /// Replace the mean with another aggregate.
    pub fn average<F>(mut self, average: F) -> Self
    where
        F: Fn(&[f64]) -> f64 + Send + Sync + 'static,
    {
        self.average = Some(Arc::new(average));
        self
    }

    pub fn build(self) -> Result<T> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(GpioError::InputDeviceBadThreshold(self.threshold));
        }
        if self.queue_len == 0 {
            return Err(GpioError::InputDeviceBadQueueLen);
        }

        let core = InputCore::open(
            self.factory,
            self.spec,
            self.kind,
            self.pull_up,
            self.active_state,
        )?;
        let inner = Arc::new(SmoothedInner {
            core,
            events: Arc::new(EdgeEvents::new()),
            threshold: self.threshold,
            queue: OnceLock::new(),
        });

        let queue = SamplingQueue::start(
            format!("queue: {}", inner.core.gpio.label()),
            Arc::downgrade(&inner),
            self.queue_len,
            self.sample_wait,
            self.partial,
            self.average,
        )?;
        // Freshly created, so the cell is empty
        let _ = inner.queue.set(queue);

        Ok(T::from(SmoothedInputDevice { inner }))
    }
}

impl SmoothedInputDevice {
    /// Pull-down input, five-sample queue, no pause between samples,
    /// threshold 0.5, blocking until the queue fills.
    pub fn builder(pin: impl Into<PinSpec>) -> SmoothedInputDeviceBuilder {
        SmoothedInputDeviceBuilder::new(pin.into(), "SmoothedInputDevice")
    }

    pub fn threshold(&self) -> f64 {
        self.inner.threshold
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.get().map_or(0, SamplingQueue::capacity)
    }

    pub fn partial(&self) -> bool {
        self.inner.queue.get().is_some_and(SamplingQueue::partial)
    }

    pub fn set_when_activated(&self, handler: Option<EventHandler>) {
        self.inner.events.set_when_activated(handler);
    }

    pub fn set_when_deactivated(&self, handler: Option<EventHandler>) {
        self.inner.events.set_when_deactivated(handler);
    }

    pub fn wait_for_active(&self, timeout: Option<Duration>) -> bool {
        self.inner.events.wait_for_active(timeout)
    }

    pub fn wait_for_inactive(&self, timeout: Option<Duration>) -> bool {
        self.inner.events.wait_for_inactive(timeout)
    }

    pub fn active_time(&self) -> Option<Duration> {
        self.inner.events.active_time()
    }

    pub fn inactive_time(&self) -> Option<Duration> {
        self.inner.events.inactive_time()
    }
}

impl fmt::Debug for SmoothedInputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.describe())
    }
}

delegate_device!(SmoothedInputDevice => inner);

impl HasValues for SmoothedInputDevice {
    fn values(&self) -> ValuesIter {
        let target: Weak<SmoothedInner> = Arc::downgrade(&self.inner);
        ValuesIter::new(target)
    }
}

impl Drop for SmoothedInputDevice {
    fn drop(&mut self) {
        self.inner.close();
    }
}

// Motion sensor

/// A PIR motion sensor: one sample every 100 ms, active when motion is
/// reported.
pub struct MotionSensor(SmoothedInputDevice);

impl MotionSensor {
    pub fn builder(pin: impl Into<PinSpec>) -> SmoothedInputDeviceBuilder<MotionSensor> {
        SmoothedInputDeviceBuilder::new(pin.into(), "MotionSensor")
            .queue_len(1)
            .sample_wait(Duration::from_millis(100))
    }

    /// Build with the motion-sensor defaults.
    pub fn new(pin: impl Into<PinSpec>, factory: Option<Arc<dyn PinFactory>>) -> Result<Self> {
        let mut builder = Self::builder(pin);
        builder.factory = factory;
        builder.build()
    }

    pub fn motion_detected(&self) -> Result<bool> {
        self.0.is_active()
    }

    pub fn set_when_motion(&self, handler: Option<EventHandler>) {
        self.0.set_when_activated(handler);
    }

    pub fn set_when_no_motion(&self, handler: Option<EventHandler>) {
        self.0.set_when_deactivated(handler);
    }

    pub fn wait_for_motion(&self, timeout: Option<Duration>) -> bool {
        self.0.wait_for_active(timeout)
    }

    pub fn wait_for_no_motion(&self, timeout: Option<Duration>) -> bool {
        self.0.wait_for_inactive(timeout)
    }
}

impl From<SmoothedInputDevice> for MotionSensor {
    fn from(device: SmoothedInputDevice) -> Self {
        MotionSensor(device)
    }
}

impl Deref for MotionSensor {
    type Target = SmoothedInputDevice;

    fn deref(&self) -> &SmoothedInputDevice {
        &self.0
    }
}

impl fmt::Debug for MotionSensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

delegate_device!(MotionSensor => 0);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::mock::{MockFactory, MockPin};
    use crate::pins::{Pin, PinFunction};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_case::test_case;

    fn setup(pin: u32) -> (Arc<dyn PinFactory>, Arc<MockPin>) {
        let factory = MockFactory::new();
        let mock = factory.mock_pin(pin).unwrap();
        (factory, mock)
    }

    fn counter() -> (Arc<AtomicUsize>, EventHandler) {
        let count = Arc::new(AtomicUsize::new(0));
        let handle = Arc::clone(&count);
        (
            count,
            EventHandler::new(move || {
                handle.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test_case(Some(true), None, Pull::Up, false; "pull_up")]
    #[test_case(Some(false), None, Pull::Down, true; "pull_down")]
    #[test_case(None, Some(false), Pull::Floating, false; "floating_active_low")]
    fn test_resolve_pull(
        pull_up: Option<bool>,
        active_state: Option<bool>,
        pull: Pull,
        active_high: bool,
    ) {
        assert_eq!(
            resolve_pull(pull_up, active_state).unwrap(),
            (pull, active_high)
        );
    }

    #[test_case(None, None; "floating_without_state")]
    #[test_case(Some(true), Some(true); "both_given")]
    fn test_resolve_pull_rejects(pull_up: Option<bool>, active_state: Option<bool>) {
        assert!(matches!(
            resolve_pull(pull_up, active_state),
            Err(GpioError::InputDeviceBadActiveState)
        ));
    }

    #[test]
    fn test_input_device_reads_through_active_level() {
        let (factory, pin) = setup(4);
        let device = InputDevice::builder(4)
            .pull_up(Some(true))
            .pin_factory(factory)
            .build()
            .unwrap();
        assert_eq!(pin.function(), PinFunction::Input);
        assert_eq!(pin.pull(), Pull::Up);
        // Pulled up and active low: idle reads inactive
        assert!(!device.is_active().unwrap());
        pin.drive_low().unwrap();
        assert!(device.is_active().unwrap());
        assert!(device.set_value(1.0.into()).is_err());
    }

    #[test]
    fn test_edges_fire_once_per_change() {
        let (factory, pin) = setup(4);
        let device = DigitalInputDevice::builder(4)
            .pin_factory(factory)
            .build()
            .unwrap();
        let (activated, on_active) = counter();
        let (deactivated, on_inactive) = counter();
        device.set_when_activated(Some(on_active));
        device.set_when_deactivated(Some(on_inactive));

        for high in [false, false, true, true, false] {
            if high {
                pin.drive_high().unwrap();
            } else {
                pin.drive_low().unwrap();
            }
        }
        assert_eq!(activated.load(Ordering::SeqCst), 1);
        assert_eq!(deactivated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_initially_active_device_fires_nothing() {
        let (factory, pin) = setup(4);
        pin.drive_high().unwrap();
        let device = DigitalInputDevice::builder(4)
            .pull_up(None)
            .active_state(Some(true))
            .pin_factory(factory)
            .build()
            .unwrap();
        let (activated, handler) = counter();
        device.set_when_activated(Some(handler));

        // Active from the start: the wait is satisfied, but no edge was seen
        assert!(device.is_active().unwrap());
        assert!(device.wait_for_active(Some(Duration::ZERO)));
        pin.drive_high().unwrap();
        assert_eq!(activated.load(Ordering::SeqCst), 0);

        pin.drive_low().unwrap();
        pin.drive_high().unwrap();
        assert_eq!(activated.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_handler_receives_device() {
        let (factory, pin) = setup(4);
        let device = DigitalInputDevice::builder(4)
            .pin_factory(factory)
            .build()
            .unwrap();
        let seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&seen);
        device.set_when_activated(Some(EventHandler::with_device(move |d| {
            *lock(&sink) = Some(d.describe());
        })));
        pin.drive_high().unwrap();
        assert_eq!(
            lock(&seen).as_deref(),
            Some("DigitalInputDevice on GPIO4")
        );
    }

    #[test]
    fn test_wait_for_active_from_other_thread() {
        let (factory, pin) = setup(4);
        let device = DigitalInputDevice::builder(4)
            .pin_factory(factory)
            .build()
            .unwrap();
        assert!(!device.wait_for_active(Some(Duration::from_millis(20))));

        let driver = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            pin.drive_high().unwrap();
        });
        assert!(device.wait_for_active(Some(Duration::from_secs(2))));
        driver.join().unwrap();
        assert!(device.active_time().is_some());
    }

    #[test]
    fn test_close_clears_callback_and_releases() {
        let (factory, pin) = setup(4);
        let device = DigitalInputDevice::builder(4)
            .pin_factory(Arc::clone(&factory))
            .build()
            .unwrap();
        let (activated, handler) = counter();
        device.set_when_activated(Some(handler));
        device.close();
        device.close();
        pin.drive_high().unwrap();
        assert_eq!(activated.load(Ordering::SeqCst), 0);
        assert!(matches!(device.value(), Err(GpioError::DeviceClosed(_))));
        assert!(!factory.core().is_reserved(4));
    }

    #[test]
    fn test_button_press_release_and_hold() {
        let (factory, pin) = setup(4);
        let button = Button::builder(4)
            .hold_time(Duration::from_millis(50))
            .pin_factory(factory)
            .build()
            .unwrap();
        let (pressed, on_press) = counter();
        let (released, on_release) = counter();
        let (held, on_held) = counter();
        button.set_when_pressed(Some(on_press));
        button.set_when_released(Some(on_release));
        button.set_when_held(Some(on_held));

        assert!(!button.is_pressed().unwrap());
        pin.drive_low().unwrap();
        assert!(button.is_pressed().unwrap());
        std::thread::sleep(Duration::from_millis(300));
        assert!(button.is_held());
        assert!(button.held_time().is_some());
        pin.drive_high().unwrap();

        assert_eq!(pressed.load(Ordering::SeqCst), 1);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(held.load(Ordering::SeqCst), 1);
        assert!(!button.is_held());
    }

    #[test]
    fn test_button_bounce() {
        let (factory, pin) = setup(4);
        let button = Button::builder(4)
            .bounce_time(Some(Duration::from_millis(30)))
            .pin_factory(factory)
            .build()
            .unwrap();
        let (pressed, on_press) = counter();
        button.set_when_pressed(Some(on_press));

        pin.drive_low().unwrap();
        pin.drive_high().unwrap();
        pin.drive_low().unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(pressed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_smoothed_input_threshold() {
        let (factory, pin) = setup(4);
        pin.drive_high().unwrap();
        let device = SmoothedInputDevice::builder(4)
            .pull_up(None)
            .active_state(Some(true))
            .queue_len(3)
            .sample_wait(Duration::from_millis(5))
            .pin_factory(factory)
            .build()
            .unwrap();

        assert_eq!(device.value().unwrap(), 1.0.into());
        assert!(device.is_active().unwrap());
        assert!(device.wait_for_active(Some(Duration::from_secs(1))));

        pin.drive_low().unwrap();
        assert!(device.wait_for_inactive(Some(Duration::from_secs(1))));
        assert!(!device.is_active().unwrap());
    }

    #[test_case(1.5; "too_high")]
    #[test_case(-0.1; "negative")]
    fn test_smoothed_bad_threshold(threshold: f64) {
        let (factory, _pin) = setup(4);
        let result = SmoothedInputDevice::builder(4)
            .threshold(threshold)
            .pin_factory(Arc::clone(&factory))
            .build();
        assert!(matches!(result, Err(GpioError::InputDeviceBadThreshold(_))));
        assert!(!factory.core().is_reserved(4));
    }

    #[test]
    fn test_motion_sensor() {
        let (factory, pin) = setup(4);
        let sensor = MotionSensor::new(4, Some(factory)).unwrap();
        let (motion, handler) = counter();
        sensor.set_when_motion(Some(handler));

        assert!(!sensor.motion_detected().unwrap());
        pin.drive_high().unwrap();
        assert!(sensor.wait_for_motion(Some(Duration::from_secs(1))));
        // The handler runs just after the wait signal is set
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(motion.load(Ordering::SeqCst), 1);

        sensor.close();
        assert!(matches!(
            sensor.motion_detected(),
            Err(GpioError::DeviceClosed(_))
        ));
    }
}
