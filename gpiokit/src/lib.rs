//! gpiokit: GPIO pins and the simple devices wired to them.
//!
//! Devices (LEDs, buttons, buzzers, motors, motion sensors, traffic
//! lights, software SPI) own their pins through a pluggable
//! [`PinFactory`](pins::PinFactory). Blinking, sampling, hold detection and
//! value pipelines run on background threads that stop when their device
//! closes.

pub mod background;
pub mod config;
pub mod device;
pub mod error;
pub mod input;
pub mod output;
pub mod pins;
pub mod spi;
pub mod tools;
pub mod tracing;

use std::time::Duration;

pub use device::{CompositeDevice, Device, EventHandler, HasSource, HasValues, Value};
pub use error::{GpioError, Result};
pub use input::{Button, DigitalInputDevice, InputDevice, MotionSensor, SmoothedInputDevice};
pub use output::{
    Buzzer, DigitalOutputDevice, Led, Motor, PwmLed, PwmOutputDevice, Role, TrafficLights,
};
pub use pins::{pin_factory, set_pin_factory, PinFactory, PinSpec};
pub use spi::SpiInterface;

/// Stop every background task, then close the default pin factory.
///
/// Waits up to `timeout` per task. Returns the number of tasks that did
/// not stop in time.
pub fn shutdown(timeout: Duration) -> usize {
    let stuck = background::shutdown_all_tasks(timeout);
    pins::close_default_factory();
    stuck
}
