//! Output devices: digital and PWM outputs, LEDs, buzzers, motors and
//! traffic-light boards.
//!
//! Blinking runs on a background task that owns the pin's timing. Starting
//! a new blink, or writing the device directly (`on`, `off`, `toggle`,
//! `set_value`), stops and joins the previous blink first, so at most one
//! sequence drives a device at a time.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::background::{lock, BackgroundTask, Signal};
use crate::device::source::{HasSource, HasValues, SourceSlot, ValuesIter};
use crate::device::{delegate_device, CompositeDevice, Device, GpioDevice, Value};
use crate::error::{GpioError, Result};
use crate::pins::{PinFactory, PinFunction, PinSpec};
use crate::tracing::prelude::*;

/// Frame rate of PWM fades.
pub const FADE_FPS: f64 = 25.0;

/// Default PWM frequency in Hz.
pub const DEFAULT_PWM_FREQUENCY: f64 = 100.0;

// Blink sequence: (logical value, hold time) pairs.
type Steps = Vec<(f64, Duration)>;

/// Steps of one on/off cycle, with linear fades at [`FADE_FPS`].
fn blink_steps(on: Duration, off: Duration, fade_in: Duration, fade_out: Duration) -> Steps {
    let frame = Duration::from_secs_f64(1.0 / FADE_FPS);
    let mut steps = Steps::new();

    let frames_in = (FADE_FPS * fade_in.as_secs_f64()) as usize;
    for i in 0..frames_in {
        steps.push((i as f64 / FADE_FPS / fade_in.as_secs_f64(), frame));
    }
    steps.push((1.0, on));

    let frames_out = (FADE_FPS * fade_out.as_secs_f64()) as usize;
    for i in 0..frames_out {
        steps.push((1.0 - i as f64 / FADE_FPS / fade_out.as_secs_f64(), frame));
    }
    steps.push((0.0, off));
    steps
}

struct OutputInner {
    gpio: GpioDevice,
    pwm: bool,
    active_high: AtomicBool,
    blink: Mutex<Option<BackgroundTask>>,
    source: SourceSlot,
}

impl OutputInner {
    fn new(gpio: GpioDevice, pwm: bool, active_high: bool) -> Arc<Self> {
        Arc::new(Self {
            gpio,
            pwm,
            active_high: AtomicBool::new(active_high),
            blink: Mutex::new(None),
            source: SourceSlot::new(),
        })
    }

    fn physical(&self, value: f64) -> f64 {
        if self.active_high.load(Ordering::Acquire) {
            value
        } else {
            1.0 - value
        }
    }

    fn check_value(&self, value: f64) -> Result<f64> {
        if !(0.0..=1.0).contains(&value) {
            return Err(GpioError::OutputDeviceBadValue(format!(
                "{} must be between 0 and 1, got {}",
                self.gpio.label(),
                value
            )));
        }
        if self.pwm {
            Ok(value)
        } else {
            Ok(if value != 0.0 { 1.0 } else { 0.0 })
        }
    }

    // Raw write, used by blink tasks; does not touch the blink slot.
    fn write(&self, value: f64) -> Result<()> {
        self.gpio.pin()?.set_state(self.physical(value))
    }

    fn read(&self) -> Result<f64> {
        let state = self.gpio.pin()?.state()?;
        Ok(self.physical(state))
    }

    fn stop_blink(&self) {
        let task = lock(&self.blink).take();
        drop(task);
    }

    fn start_blink(self: &Arc<Self>, steps: Steps, n: Option<usize>, background: bool) -> Result<()> {
        self.gpio.pin()?;
        let done = {
            let mut slot = lock(&self.blink);
            if let Some(mut old) = slot.take() {
                old.stop();
            }

            let target = Arc::downgrade(self);
            let task = BackgroundTask::spawn(format!("blink: {}", self.gpio.label()), move |stop| {
                run_steps(&target, &steps, n, stop)
            })?;
            let done = task.done_signal();
            *slot = Some(task);
            done
        };

        if !background {
            done.wait(None);
            let finished = {
                let mut slot = lock(&self.blink);
                match slot.as_ref() {
                    Some(task) if !task.is_running() => slot.take(),
                    _ => None,
                }
            };
            drop(finished);
        }
        Ok(())
    }

    fn toggle(&self) -> Result<()> {
        self.stop_blink();
        let current = self.read()?;
        self.write(if self.pwm { 1.0 - current } else if current != 0.0 { 0.0 } else { 1.0 })
    }

    fn set_active_high(&self, active_high: bool) {
        self.active_high.store(active_high, Ordering::Release);
    }

    fn target(self: &Arc<Self>) -> Weak<dyn Device> {
        let target: Weak<OutputInner> = Arc::downgrade(self);
        target
    }
}

fn run_steps(
    target: &Weak<OutputInner>,
    steps: &[(f64, Duration)],
    n: Option<usize>,
    stop: &Signal,
) -> Result<()> {
    let mut remaining = n;
    loop {
        match remaining.as_mut() {
            Some(0) => return Ok(()),
            Some(left) => *left -= 1,
            None => {}
        }
        for (value, hold) in steps {
            let Some(device) = target.upgrade() else {
                return Ok(());
            };
            device.write(*value)?;
            drop(device);
            if stop.wait(Some(*hold)) {
                return Ok(());
            }
        }
    }
}

impl Device for OutputInner {
    fn describe(&self) -> String {
        self.gpio.describe()
    }

    fn value(&self) -> Result<Value> {
        Ok(self.read()?.into())
    }

    fn set_value(&self, value: Value) -> Result<()> {
        let value = self.check_value(value.scalar()?)?;
        self.stop_blink();
        self.write(value)
    }

    fn is_active(&self) -> Result<bool> {
        Ok(self.read()? != 0.0)
    }

    fn close(&self) {
        if self.gpio.closed() {
            return;
        }
        self.source.stop();
        self.stop_blink();
        if self.pwm {
            if let Ok(pin) = self.gpio.pin() {
                if let Err(e) = pin.set_frequency(None) {
                    debug!(device = %self.gpio.label(), error = %e, "Failed to stop PWM");
                }
            }
        }
        self.gpio.close();
    }

    fn closed(&self) -> bool {
        self.gpio.closed()
    }
}

// Digital output

/// An output that is either on or off.
pub struct DigitalOutputDevice {
    inner: Arc<OutputInner>,
}

/// Builder for [`DigitalOutputDevice`] and the types wrapping it.
pub struct DigitalOutputBuilder<T = DigitalOutputDevice> {
    spec: PinSpec,
    kind: &'static str,
    active_high: bool,
    initial_value: Option<bool>,
    factory: Option<Arc<dyn PinFactory>>,
    _output: PhantomData<fn() -> T>,
}

impl<T: From<DigitalOutputDevice>> DigitalOutputBuilder<T> {
    fn new(spec: PinSpec, kind: &'static str) -> Self {
        Self {
            spec,
            kind,
            active_high: true,
            initial_value: Some(false),
            factory: None,
            _output: PhantomData,
        }
    }

    pub(crate) fn kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    /// `false` when the device is on while the pin is low.
    pub fn active_high(mut self, active_high: bool) -> Self {
        self.active_high = active_high;
        self
    }

    /// Starting state; `None` leaves the pin's current level alone.
    pub fn initial_value(mut self, initial: Option<bool>) -> Self {
        self.initial_value = initial;
        self
    }

    pub fn pin_factory(mut self, factory: Arc<dyn PinFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<T> {
        let gpio = GpioDevice::open(self.factory, self.spec, self.kind)?;
        let inner = OutputInner::new(gpio, false, self.active_high);
        let pin = inner.gpio.pin()?;
        match self.initial_value {
            Some(on) => pin.output_with_state(inner.physical(if on { 1.0 } else { 0.0 }))?,
            None => pin.set_function(PinFunction::Output)?,
        }
        Ok(T::from(DigitalOutputDevice { inner }))
    }
}

impl DigitalOutputDevice {
    pub fn builder(pin: impl Into<PinSpec>) -> DigitalOutputBuilder {
        DigitalOutputBuilder::new(pin.into(), "DigitalOutputDevice")
    }

    pub fn on(&self) -> Result<()> {
        self.set_value(1.0.into())
    }

    pub fn off(&self) -> Result<()> {
        self.set_value(0.0.into())
    }

    pub fn toggle(&self) -> Result<()> {
        self.inner.toggle()
    }

    /// Blink `n` times (forever with `None`).
    ///
    /// With `background = false` this returns once the sequence has ended.
    pub fn blink(
        &self,
        on_time: Duration,
        off_time: Duration,
        n: Option<usize>,
        background: bool,
    ) -> Result<()> {
        let steps = blink_steps(on_time, off_time, Duration::ZERO, Duration::ZERO);
        self.inner.start_blink(steps, n, background)
    }

    pub fn active_high(&self) -> bool {
        self.inner.active_high.load(Ordering::Acquire)
    }

    /// Change the active level; the pin level stays, so the value flips.
    pub fn set_active_high(&self, active_high: bool) {
        self.inner.set_active_high(active_high)
    }

    pub fn pin_number(&self) -> u32 {
        self.inner.gpio.number()
    }
}

impl fmt::Debug for DigitalOutputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.describe())
    }
}

delegate_device!(DigitalOutputDevice => inner);

impl HasSource for DigitalOutputDevice {
    fn set_source<I>(&self, source: Option<I>) -> Result<()>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.inner.gpio.pin()?;
        self.inner.source.replace(self.inner.target(), source)
    }

    fn source_delay(&self) -> Duration {
        self.inner.source.delay()
    }

    fn set_source_delay(&self, delay: Duration) {
        self.inner.source.set_delay(delay)
    }
}

impl HasValues for DigitalOutputDevice {
    fn values(&self) -> ValuesIter {
        ValuesIter::new(self.inner.target())
    }
}

impl Drop for DigitalOutputDevice {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// An LED on a digital pin.
pub struct Led(DigitalOutputDevice);

impl Led {
    pub fn builder(pin: impl Into<PinSpec>) -> DigitalOutputBuilder<Led> {
        DigitalOutputBuilder::new(pin.into(), "Led")
    }

    pub fn is_lit(&self) -> Result<bool> {
        self.0.is_active()
    }
}

impl From<DigitalOutputDevice> for Led {
    fn from(device: DigitalOutputDevice) -> Self {
        Led(device)
    }
}

/// A buzzer on a digital pin.
pub struct Buzzer(DigitalOutputDevice);

impl Buzzer {
    pub fn builder(pin: impl Into<PinSpec>) -> DigitalOutputBuilder<Buzzer> {
        DigitalOutputBuilder::new(pin.into(), "Buzzer")
    }

    /// Sound `n` beeps (forever with `None`).
    pub fn beep(
        &self,
        on_time: Duration,
        off_time: Duration,
        n: Option<usize>,
        background: bool,
    ) -> Result<()> {
        self.0.blink(on_time, off_time, n, background)
    }
}

impl From<DigitalOutputDevice> for Buzzer {
    fn from(device: DigitalOutputDevice) -> Self {
        Buzzer(device)
    }
}

macro_rules! digital_wrapper {
    ($ty:ident) => {
        impl Deref for $ty {
            type Target = DigitalOutputDevice;

            fn deref(&self) -> &DigitalOutputDevice {
                &self.0
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(&self.0, f)
            }
        }

        delegate_device!($ty => 0);
    };
}

digital_wrapper!(Led);
digital_wrapper!(Buzzer);

// PWM output

/// An output with a variable duty cycle.
pub struct PwmOutputDevice {
    inner: Arc<OutputInner>,
}

/// Builder for [`PwmOutputDevice`] and the types wrapping it.
pub struct PwmOutputBuilder<T = PwmOutputDevice> {
    spec: PinSpec,
    kind: &'static str,
    active_high: bool,
    initial_value: f64,
    frequency: f64,
    factory: Option<Arc<dyn PinFactory>>,
    _output: PhantomData<fn() -> T>,
}

impl<T: From<PwmOutputDevice>> PwmOutputBuilder<T> {
    fn new(spec: PinSpec, kind: &'static str) -> Self {
        Self {
            spec,
            kind,
            active_high: true,
            initial_value: 0.0,
            frequency: DEFAULT_PWM_FREQUENCY,
            factory: None,
            _output: PhantomData,
        }
    }

    pub(crate) fn kind(mut self, kind: &'static str) -> Self {
        self.kind = kind;
        self
    }

    pub fn active_high(mut self, active_high: bool) -> Self {
        self.active_high = active_high;
        self
    }

    /// Starting duty cycle (0 to 1).
    pub fn initial_value(mut self, initial: f64) -> Self {
        self.initial_value = initial;
        self
    }

    /// PWM frequency in Hz.
    pub fn frequency(mut self, frequency: f64) -> Self {
        self.frequency = frequency;
        self
    }

    pub fn pin_factory(mut self, factory: Arc<dyn PinFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<T> {
        let gpio = GpioDevice::open(self.factory, self.spec, self.kind)?;
        let inner = OutputInner::new(gpio, true, self.active_high);
        let initial = inner.check_value(self.initial_value)?;
        let pin = inner.gpio.pin()?;
        pin.output_with_state(inner.physical(0.0))?;
        pin.set_frequency(Some(self.frequency))?;
        inner.write(initial)?;
        Ok(T::from(PwmOutputDevice { inner }))
    }
}

impl PwmOutputDevice {
    pub fn builder(pin: impl Into<PinSpec>) -> PwmOutputBuilder {
        PwmOutputBuilder::new(pin.into(), "PwmOutputDevice")
    }

    pub fn on(&self) -> Result<()> {
        self.set_value(1.0.into())
    }

    pub fn off(&self) -> Result<()> {
        self.set_value(0.0.into())
    }

    /// Invert the duty cycle.
    pub fn toggle(&self) -> Result<()> {
        self.inner.toggle()
    }

    /// Blink with optional linear fades, `n` times (forever with `None`).
    pub fn blink(
        &self,
        on_time: Duration,
        off_time: Duration,
        fade_in: Duration,
        fade_out: Duration,
        n: Option<usize>,
        background: bool,
    ) -> Result<()> {
        let steps = blink_steps(on_time, off_time, fade_in, fade_out);
        self.inner.start_blink(steps, n, background)
    }

    /// Fade in and out repeatedly.
    pub fn pulse(
        &self,
        fade_in: Duration,
        fade_out: Duration,
        n: Option<usize>,
        background: bool,
    ) -> Result<()> {
        self.blink(Duration::ZERO, Duration::ZERO, fade_in, fade_out, n, background)
    }

    pub fn frequency(&self) -> Result<Option<f64>> {
        Ok(self.inner.gpio.pin()?.frequency())
    }

    pub fn set_frequency(&self, frequency: f64) -> Result<()> {
        self.inner.gpio.pin()?.set_frequency(Some(frequency))
    }

    pub fn active_high(&self) -> bool {
        self.inner.active_high.load(Ordering::Acquire)
    }

    pub fn set_active_high(&self, active_high: bool) {
        self.inner.set_active_high(active_high)
    }

    pub fn pin_number(&self) -> u32 {
        self.inner.gpio.number()
    }
}

impl fmt::Debug for PwmOutputDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.describe())
    }
}

delegate_device!(PwmOutputDevice => inner);

impl HasSource for PwmOutputDevice {
    fn set_source<I>(&self, source: Option<I>) -> Result<()>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.inner.gpio.pin()?;
        self.inner.source.replace(self.inner.target(), source)
    }

    fn source_delay(&self) -> Duration {
        self.inner.source.delay()
    }

    fn set_source_delay(&self, delay: Duration) {
        self.inner.source.set_delay(delay)
    }
}

impl HasValues for PwmOutputDevice {
    fn values(&self) -> ValuesIter {
        ValuesIter::new(self.inner.target())
    }
}

impl Drop for PwmOutputDevice {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// An LED with variable brightness.
pub struct PwmLed(PwmOutputDevice);

impl PwmLed {
    pub fn builder(pin: impl Into<PinSpec>) -> PwmOutputBuilder<PwmLed> {
        PwmOutputBuilder::new(pin.into(), "PwmLed")
    }

    pub fn is_lit(&self) -> Result<bool> {
        self.0.is_active()
    }
}

impl From<PwmOutputDevice> for PwmLed {
    fn from(device: PwmOutputDevice) -> Self {
        PwmLed(device)
    }
}

impl Deref for PwmLed {
    type Target = PwmOutputDevice;

    fn deref(&self) -> &PwmOutputDevice {
        &self.0
    }
}

impl fmt::Debug for PwmLed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

delegate_device!(PwmLed => 0);

// Motor

enum MotorChannel {
    Digital(Arc<DigitalOutputDevice>),
    Pwm(Arc<PwmOutputDevice>),
}

impl MotorChannel {
    fn open(
        spec: PinSpec,
        pwm: bool,
        factory: Option<Arc<dyn PinFactory>>,
    ) -> Result<Self> {
        if pwm {
            let mut builder = PwmOutputDevice::builder(spec).kind("Motor");
            if let Some(factory) = factory {
                builder = builder.pin_factory(factory);
            }
            Ok(MotorChannel::Pwm(Arc::new(builder.build()?)))
        } else {
            let mut builder = DigitalOutputDevice::builder(spec).kind("Motor");
            if let Some(factory) = factory {
                builder = builder.pin_factory(factory);
            }
            Ok(MotorChannel::Digital(Arc::new(builder.build()?)))
        }
    }

    fn device(&self) -> &dyn Device {
        match self {
            MotorChannel::Digital(d) => &**d,
            MotorChannel::Pwm(d) => &**d,
        }
    }

    fn shared(&self) -> Arc<dyn Device> {
        match self {
            MotorChannel::Digital(d) => Arc::clone(d) as Arc<dyn Device>,
            MotorChannel::Pwm(d) => Arc::clone(d) as Arc<dyn Device>,
        }
    }

    fn speed(&self) -> Result<f64> {
        self.device().value()?.scalar()
    }

    fn set_speed(&self, speed: f64) -> Result<()> {
        self.device().set_value(speed.into())
    }
}

struct MotorInner {
    forward: MotorChannel,
    backward: MotorChannel,
    pwm: bool,
    // forward, backward and (if wired) enable
    channels: CompositeDevice,
    source: SourceSlot,
}

impl MotorInner {
    fn check_open(&self) -> Result<()> {
        if self.closed() {
            return Err(GpioError::DeviceClosed(self.describe()));
        }
        Ok(())
    }

    fn check_speed(&self, speed: f64) -> Result<()> {
        let valid = if self.pwm {
            (0.0..=1.0).contains(&speed)
        } else {
            speed == 0.0 || speed == 1.0
        };
        if !valid {
            return Err(GpioError::OutputDeviceBadValue(format!(
                "motor speed must be {}, got {}",
                if self.pwm { "between 0 and 1" } else { "0 or 1" },
                speed
            )));
        }
        Ok(())
    }

    fn drive(&self, forward: f64, backward: f64) -> Result<()> {
        self.check_open()?;
        // Release one side before driving the other
        if forward > 0.0 {
            self.backward.set_speed(0.0)?;
            self.forward.set_speed(forward)
        } else {
            self.forward.set_speed(0.0)?;
            self.backward.set_speed(backward)
        }
    }
}

impl Device for MotorInner {
    fn describe(&self) -> String {
        let mut text = format!(
            "Motor on {} and {}",
            self.forward.device().describe(),
            self.backward.device().describe()
        );
        if self.closed() {
            text.push_str(" (closed)");
        }
        text
    }

    /// Speed from -1 (full backward) to 1 (full forward).
    fn value(&self) -> Result<Value> {
        self.check_open()?;
        Ok((self.forward.speed()? - self.backward.speed()?).into())
    }

    fn set_value(&self, value: Value) -> Result<()> {
        let speed = value.scalar()?;
        if !(-1.0..=1.0).contains(&speed) {
            return Err(GpioError::OutputDeviceBadValue(format!(
                "motor value must be between -1 and 1, got {}",
                speed
            )));
        }
        self.check_speed(speed.abs())?;
        if speed >= 0.0 {
            self.drive(speed, 0.0)
        } else {
            self.drive(0.0, -speed)
        }
    }

    fn close(&self) {
        if self.closed() {
            return;
        }
        self.source.stop();
        self.channels.close();
    }

    fn closed(&self) -> bool {
        self.channels.closed()
    }
}

/// A DC motor on an H-bridge: one forward pin, one backward pin and an
/// optional enable pin.
///
/// The motor's own value is a single speed from -1 to 1. Its channels are
/// a [`CompositeDevice`] (`forward`, `backward`, then `enable`) reachable
/// through `Deref`.
pub struct Motor {
    inner: Arc<MotorInner>,
}

pub struct MotorBuilder {
    forward: PinSpec,
    backward: PinSpec,
    enable: Option<PinSpec>,
    pwm: bool,
    factory: Option<Arc<dyn PinFactory>>,
}

impl MotorBuilder {
    /// Pin that must be high for the driver to run; held on while open.
    pub fn enable(mut self, pin: impl Into<PinSpec>) -> Self {
        self.enable = Some(pin.into());
        self
    }

    /// Use PWM for variable speed (the default) or plain on/off pins.
    pub fn pwm(mut self, pwm: bool) -> Self {
        self.pwm = pwm;
        self
    }

    pub fn pin_factory(mut self, factory: Arc<dyn PinFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<Motor> {
        let forward = MotorChannel::open(self.forward, self.pwm, self.factory.clone())?;
        let backward = MotorChannel::open(self.backward, self.pwm, self.factory.clone())?;

        let mut channels = CompositeDevice::builder()
            .add_named("forward", forward.shared())
            .add_named("backward", backward.shared());
        let mut order = vec!["forward", "backward"];
        if let Some(spec) = self.enable {
            let mut builder = DigitalOutputDevice::builder(spec)
                .kind("Motor enable")
                .initial_value(Some(true));
            if let Some(factory) = self.factory {
                builder = builder.pin_factory(factory);
            }
            channels = channels.add_named("enable", builder.build()?);
            order.push("enable");
        }
        let channels = channels.order(order).build()?;

        Ok(Motor {
            inner: Arc::new(MotorInner {
                forward,
                backward,
                pwm: self.pwm,
                channels,
                source: SourceSlot::new(),
            }),
        })
    }
}

impl Motor {
    pub fn builder(forward: impl Into<PinSpec>, backward: impl Into<PinSpec>) -> MotorBuilder {
        MotorBuilder {
            forward: forward.into(),
            backward: backward.into(),
            enable: None,
            pwm: true,
            factory: None,
        }
    }

    /// Drive forward at `speed` (0 to 1; exactly 0 or 1 without PWM).
    pub fn forward(&self, speed: f64) -> Result<()> {
        self.inner.check_speed(speed)?;
        self.inner.drive(speed, 0.0)
    }

    /// Drive backward at `speed` (0 to 1; exactly 0 or 1 without PWM).
    pub fn backward(&self, speed: f64) -> Result<()> {
        self.inner.check_speed(speed)?;
        self.inner.drive(0.0, speed)
    }

    /// Same speed, opposite direction.
    pub fn reverse(&self) -> Result<()> {
        let speed = self.inner.value()?.scalar()?;
        self.inner.set_value((-speed).into())
    }

    pub fn stop(&self) -> Result<()> {
        self.inner.drive(0.0, 0.0)
    }
}

impl Deref for Motor {
    type Target = CompositeDevice;

    fn deref(&self) -> &CompositeDevice {
        &self.inner.channels
    }
}

impl fmt::Debug for Motor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.describe())
    }
}

delegate_device!(Motor => inner);

impl HasSource for Motor {
    fn set_source<I>(&self, source: Option<I>) -> Result<()>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.inner.check_open()?;
        let target: Weak<MotorInner> = Arc::downgrade(&self.inner);
        self.inner.source.replace(target, source)
    }

    fn source_delay(&self) -> Duration {
        self.inner.source.delay()
    }

    fn set_source_delay(&self, delay: Duration) {
        self.inner.source.set_delay(delay)
    }
}

impl HasValues for Motor {
    fn values(&self) -> ValuesIter {
        let target: Weak<MotorInner> = Arc::downgrade(&self.inner);
        ValuesIter::new(target)
    }
}

impl Drop for Motor {
    fn drop(&mut self) {
        self.inner.close();
    }
}

// Traffic lights

/// A traffic-light channel.
///
/// `"yellow"` is accepted as another name for [`Role::Amber`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Red,
    Amber,
    Green,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::Red, Role::Amber, Role::Green];

    fn index(self) -> usize {
        match self {
            Role::Red => 0,
            Role::Amber => 1,
            Role::Green => 2,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Role::Red => "red",
            Role::Amber => "amber",
            Role::Green => "green",
        })
    }
}

impl FromStr for Role {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "red" => Ok(Role::Red),
            "amber" | "yellow" => Ok(Role::Amber),
            "green" => Ok(Role::Green),
            _ => Err(GpioError::CompositeDeviceBadName(s.to_string())),
        }
    }
}

/// Red, amber and green LEDs.
///
/// A [`CompositeDevice`] with the lights as named children in
/// `(red, amber, green)` order; sequence access comes through `Deref`.
pub struct TrafficLights {
    // Indexed by Role::index()
    lights: [Arc<Led>; 3],
    children: CompositeDevice,
}

pub struct TrafficLightsBuilder {
    pins: [Option<PinSpec>; 3],
    error: Option<GpioError>,
    active_high: bool,
    factory: Option<Arc<dyn PinFactory>>,
}

impl TrafficLightsBuilder {
    /// Assign a pin to the light called `role` (`red`, `amber`/`yellow`,
    /// `green`).
    pub fn light(mut self, role: &str, pin: impl Into<PinSpec>) -> Self {
        match role.parse::<Role>() {
            Ok(role) if self.pins[role.index()].is_some() => {
                self.error
                    .get_or_insert(GpioError::CompositeDeviceBadName(format!(
                        "{} assigned twice",
                        role
                    )));
            }
            Ok(role) => self.pins[role.index()] = Some(pin.into()),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn active_high(mut self, active_high: bool) -> Self {
        self.active_high = active_high;
        self
    }

    pub fn pin_factory(mut self, factory: Arc<dyn PinFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<TrafficLights> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let [red, amber, green] = self.pins;
        let (Some(red), Some(amber), Some(green)) = (red, amber, green) else {
            return Err(GpioError::CompositeDeviceBadDevice(
                "traffic lights need red, amber and green pins".into(),
            ));
        };

        let open = |spec: PinSpec| {
            let mut builder = Led::builder(spec).active_high(self.active_high);
            if let Some(factory) = &self.factory {
                builder = builder.pin_factory(Arc::clone(factory));
            }
            builder.build().map(Arc::new)
        };
        let lights = [open(red)?, open(amber)?, open(green)?];

        let mut children = CompositeDevice::builder();
        for role in Role::ALL {
            children = children.add_named(role.to_string(), Arc::clone(&lights[role.index()]));
        }
        let children = children.order(Role::ALL.map(|r| r.to_string())).build()?;

        Ok(TrafficLights { lights, children })
    }
}

impl TrafficLights {
    pub fn builder() -> TrafficLightsBuilder {
        TrafficLightsBuilder {
            pins: [None, None, None],
            error: None,
            active_high: true,
            factory: None,
        }
    }

    /// Shorthand for the common red/amber/green wiring.
    pub fn new(
        red: impl Into<PinSpec>,
        amber: impl Into<PinSpec>,
        green: impl Into<PinSpec>,
        factory: Option<Arc<dyn PinFactory>>,
    ) -> Result<Self> {
        let mut builder = Self::builder()
            .light("red", red)
            .light("amber", amber)
            .light("green", green);
        builder.factory = factory;
        builder.build()
    }

    pub fn light(&self, role: Role) -> &Led {
        &self.lights[role.index()]
    }

    /// Look a light up by name (`"yellow"` finds amber).
    pub fn by_name(&self, name: &str) -> Result<&Led> {
        Ok(self.light(name.parse()?))
    }

    pub fn red(&self) -> &Led {
        self.light(Role::Red)
    }

    pub fn amber(&self) -> &Led {
        self.light(Role::Amber)
    }

    pub fn green(&self) -> &Led {
        self.light(Role::Green)
    }
}

impl Deref for TrafficLights {
    type Target = CompositeDevice;

    fn deref(&self) -> &CompositeDevice {
        &self.children
    }
}

impl fmt::Debug for TrafficLights {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl Device for TrafficLights {
    fn describe(&self) -> String {
        let pins: Vec<String> = Role::ALL
            .iter()
            .map(|r| format!("{}=GPIO{}", r, self.light(*r).pin_number()))
            .collect();
        let closed = if self.closed() { " (closed)" } else { "" };
        format!("TrafficLights({}){}", pins.join(", "), closed)
    }

    /// `(red, amber, green)`
    fn value(&self) -> Result<Value> {
        self.children.value()
    }

    fn set_value(&self, value: Value) -> Result<()> {
        self.children.set_value(value)
    }

    fn is_active(&self) -> Result<bool> {
        self.children.is_active()
    }

    fn close(&self) {
        self.children.close()
    }

    fn closed(&self) -> bool {
        self.children.closed()
    }
}

impl HasSource for TrafficLights {
    fn set_source<I>(&self, source: Option<I>) -> Result<()>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.children.set_source(source)
    }

    fn source_delay(&self) -> Duration {
        self.children.source_delay()
    }

    fn set_source_delay(&self, delay: Duration) {
        self.children.set_source_delay(delay)
    }
}

impl HasValues for TrafficLights {
    fn values(&self) -> ValuesIter {
        self.children.values()
    }
}
