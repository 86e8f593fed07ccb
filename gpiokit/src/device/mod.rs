//! Device lifecycle.
//!
//! A [`Device`] owns one pin (through [`GpioDevice`]) or a set of child
//! devices (through [`composite::CompositeDevice`]). Ownership is exclusive:
//! the pin is reserved in the factory before anything touches the hardware,
//! and released again on `close()` or drop. After `close()` every operation
//! fails with [`GpioError::DeviceClosed`].

pub mod composite;
pub mod events;
pub mod queue;
pub mod source;

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::background::lock;
use crate::error::{GpioError, Result};
use crate::pins::{self, OwnerId, PinFactory, PinRef, PinSpec};
use crate::tracing::prelude::*;

pub use composite::{CompositeDevice, DeviceGroup};
pub use events::{EdgeEvents, EventHandler, Transition};
pub use source::{HasSource, HasValues, ValuesIter};

/// A device value: a scalar for single-pin devices, a tuple for composites.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(f64),
    Tuple(Vec<Value>),
}

impl Value {
    /// The scalar, or `None` for a tuple.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Scalar(v) => Some(*v),
            Value::Tuple(_) => None,
        }
    }

    /// Nonzero scalar, or a tuple with any truthy element.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Scalar(v) => *v != 0.0,
            Value::Tuple(items) => items.iter().any(Value::is_truthy),
        }
    }

    /// The scalar, or `OutputDeviceBadValue` for a tuple.
    pub fn scalar(&self) -> Result<f64> {
        self.as_f64()
            .ok_or_else(|| GpioError::OutputDeviceBadValue(format!("expected a scalar, got {}", self)))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(v) => write!(f, "{}", v),
            Value::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Scalar(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Scalar(if v { 1.0 } else { 0.0 })
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Tuple(items)
    }
}

impl<A: Into<Value>, B: Into<Value>> From<(A, B)> for Value {
    fn from((a, b): (A, B)) -> Self {
        Value::Tuple(vec![a.into(), b.into()])
    }
}

impl<A: Into<Value>, B: Into<Value>, C: Into<Value>> From<(A, B, C)> for Value {
    fn from((a, b, c): (A, B, C)) -> Self {
        Value::Tuple(vec![a.into(), b.into(), c.into()])
    }
}

/// Base lifecycle unit.
pub trait Device: Send + Sync {
    /// Short human-readable description, e.g. `"Led on GPIO17"`.
    fn describe(&self) -> String;

    fn value(&self) -> Result<Value>;

    /// Write a value. Input devices are read-only.
    fn set_value(&self, _value: Value) -> Result<()> {
        Err(GpioError::OutputDeviceReadOnly(self.describe()))
    }

    fn is_active(&self) -> Result<bool> {
        Ok(self.value()?.is_truthy())
    }

    /// Release every resource the device holds. Idempotent; never fails.
    fn close(&self);

    fn closed(&self) -> bool;
}

/// Shared handles are devices too, so a board can keep typed access to a
/// child it has also handed to a [`CompositeDevice`].
impl<T: Device + ?Sized> Device for Arc<T> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn value(&self) -> Result<Value> {
        (**self).value()
    }

    fn set_value(&self, value: Value) -> Result<()> {
        (**self).set_value(value)
    }

    fn is_active(&self) -> Result<bool> {
        (**self).is_active()
    }

    fn close(&self) {
        (**self).close()
    }

    fn closed(&self) -> bool {
        (**self).closed()
    }
}

/// Implement [`Device`] for a handle type by forwarding to one of its
/// fields. `Device` must be in scope at the call site.
macro_rules! delegate_device {
    ($ty:ty => $($field:tt).+) => {
        impl $crate::device::Device for $ty {
            fn describe(&self) -> String {
                self.$($field).+.describe()
            }

            fn value(&self) -> $crate::error::Result<$crate::device::Value> {
                self.$($field).+.value()
            }

            fn set_value(&self, value: $crate::device::Value) -> $crate::error::Result<()> {
                self.$($field).+.set_value(value)
            }

            fn is_active(&self) -> $crate::error::Result<bool> {
                self.$($field).+.is_active()
            }

            fn close(&self) {
                self.$($field).+.close()
            }

            fn closed(&self) -> bool {
                self.$($field).+.closed()
            }
        }
    };
}
pub(crate) use delegate_device;

/// Resolve the factory a device should use.
pub(crate) fn factory_or_default(
    factory: Option<Arc<dyn PinFactory>>,
) -> Result<Arc<dyn PinFactory>> {
    match factory {
        Some(factory) => Ok(factory),
        None => pins::pin_factory(),
    }
}

/// Single-pin device core: resolution, reservation and release.
pub struct GpioDevice {
    factory: Arc<dyn PinFactory>,
    owner: OwnerId,
    label: String,
    number: u32,
    pin: Mutex<Option<PinRef>>,
}

impl fmt::Debug for GpioDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioDevice")
            .field("label", &self.label)
            .field("closed", &self.closed())
            .finish()
    }
}

impl GpioDevice {
    /// Reserve and fetch the pin for `spec`.
    ///
    /// `kind` names the device in logs and errors. The reservation is taken
    /// before the pin is touched and released if fetching it fails.
    pub fn open(
        factory: Option<Arc<dyn PinFactory>>,
        spec: impl Into<PinSpec>,
        kind: &str,
    ) -> Result<Self> {
        let factory = factory_or_default(factory)?;
        let number = spec.into().resolve(factory.board_info())?;
        let label = format!("{} on GPIO{}", kind, number);
        let owner = OwnerId::next();

        factory.core().reserve_pins(owner, &label, &[number])?;
        let pin = match factory.pin(&PinSpec::Number(number)) {
            Ok(pin) => pin,
            Err(e) => {
                factory.core().release_pins(owner, &[number]);
                return Err(e);
            }
        };

        debug!(device = %label, "Device opened");
        Ok(Self {
            factory,
            owner,
            label,
            number,
            pin: Mutex::new(Some(pin)),
        })
    }

    pub fn number(&self) -> u32 {
        self.number
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn factory(&self) -> &Arc<dyn PinFactory> {
        &self.factory
    }

    /// The owned pin, or `DeviceClosed`.
    pub fn pin(&self) -> Result<PinRef> {
        lock(&self.pin)
            .clone()
            .ok_or_else(|| GpioError::DeviceClosed(self.label.clone()))
    }

    pub fn closed(&self) -> bool {
        lock(&self.pin).is_none()
    }

    /// Reset the pin and release the reservation. Idempotent.
    pub fn close(&self) {
        let Some(pin) = lock(&self.pin).take() else {
            return;
        };
        if let Err(e) = pin.close() {
            warn!(device = %self.label, error = %e, "Failed to reset pin on close");
        }
        self.factory.core().release_pins(self.owner, &[self.number]);
        debug!(device = %self.label, "Device closed");
    }

    /// Description with the closed state appended when relevant.
    pub fn describe(&self) -> String {
        if self.closed() {
            format!("{} (closed)", self.label)
        } else {
            self.label.clone()
        }
    }
}

impl Drop for GpioDevice {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::mock::MockFactory;

    fn factory() -> Arc<dyn PinFactory> {
        MockFactory::new()
    }

    #[test]
    fn test_exclusive_ownership() {
        let factory = factory();
        let a = GpioDevice::open(Some(Arc::clone(&factory)), 17, "Led").unwrap();
        let err = GpioDevice::open(Some(Arc::clone(&factory)), "J8:11", "Button").unwrap_err();
        assert!(matches!(err, GpioError::PinInUse { pin: 17, .. }));

        a.close();
        let b = GpioDevice::open(Some(Arc::clone(&factory)), 17, "Button").unwrap();
        assert_eq!(b.label(), "Button on GPIO17");
    }

    #[test]
    fn test_close_is_idempotent() {
        let factory = factory();
        let device = GpioDevice::open(Some(Arc::clone(&factory)), 4, "Led").unwrap();
        device.pin().unwrap().output_with_state(1.0).unwrap();

        device.close();
        device.close();
        assert!(device.closed());
        assert!(matches!(device.pin(), Err(GpioError::DeviceClosed(_))));
        assert_eq!(device.describe(), "Led on GPIO4 (closed)");
        assert!(!factory.core().is_reserved(4));
    }

    #[test]
    fn test_drop_releases_pin() {
        let factory = factory();
        {
            let _device = GpioDevice::open(Some(Arc::clone(&factory)), 4, "Led").unwrap();
            assert!(factory.core().is_reserved(4));
        }
        assert!(!factory.core().is_reserved(4));
    }

    #[test]
    fn test_invalid_spec_reserves_nothing() {
        let factory = factory();
        assert!(matches!(
            GpioDevice::open(Some(Arc::clone(&factory)), "GPIO99", "Led"),
            Err(GpioError::PinInvalidPin(_))
        ));
    }

    #[test]
    fn test_value_helpers() {
        let v: Value = (1.0, false).into();
        assert_eq!(v, Value::Tuple(vec![Value::Scalar(1.0), Value::Scalar(0.0)]));
        assert!(v.is_truthy());
        assert_eq!(v.to_string(), "(1, 0)");
        assert!(v.scalar().is_err());
        assert!(!Value::from(0.0).is_truthy());
    }
}
