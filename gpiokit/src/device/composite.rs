//! Composite devices: an ordered aggregate of child devices.

use std::collections::HashSet;
use std::fmt;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use super::source::{HasSource, HasValues, SourceSlot, ValuesIter};
use super::{Device, Value};
use crate::error::{GpioError, Result};
use crate::tracing::prelude::*;

/// Names a named child may not take; they collide with the composite's own
/// members.
pub const RESERVED_NAMES: &[&str] = &[
    "close",
    "closed",
    "value",
    "is_active",
    "values",
    "source",
    "source_delay",
    "pin_factory",
    "all",
    "describe",
];

struct Child {
    name: Option<String>,
    device: Box<dyn Device>,
}

struct CompositeInner {
    children: Vec<Child>,
    closed: AtomicBool,
    source: SourceSlot,
}

impl CompositeInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GpioError::DeviceClosed(self.describe()));
        }
        Ok(())
    }
}

impl Device for CompositeInner {
    fn describe(&self) -> String {
        let names: Vec<String> = self
            .children
            .iter()
            .enumerate()
            .map(|(i, c)| c.name.clone().unwrap_or_else(|| format!("#{}", i)))
            .collect();
        let closed = if self.closed.load(Ordering::Acquire) {
            " (closed)"
        } else {
            ""
        };
        format!("CompositeDevice[{}]{}", names.join(", "), closed)
    }

    fn value(&self) -> Result<Value> {
        self.check_open()?;
        let values = self
            .children
            .iter()
            .map(|c| c.device.value())
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Tuple(values))
    }

    fn set_value(&self, value: Value) -> Result<()> {
        self.check_open()?;
        let items = match value {
            Value::Tuple(items) => items,
            other => {
                return Err(GpioError::OutputDeviceBadValue(format!(
                    "composite value must be a tuple, got {}",
                    other
                )))
            }
        };
        if items.len() != self.children.len() {
            return Err(GpioError::CompositeDeviceBadValue {
                expected: self.children.len(),
                got: items.len(),
            });
        }
        for (child, item) in self.children.iter().zip(items) {
            child.device.set_value(item)?;
        }
        Ok(())
    }

    fn is_active(&self) -> Result<bool> {
        self.check_open()?;
        for child in &self.children {
            if child.device.is_active()? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.source.stop();
        for child in &self.children {
            child.device.close();
        }
        debug!(children = self.children.len(), "Composite device closed");
    }

    fn closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Ordered aggregate of positional and named child devices.
///
/// The composite owns its children: closing (or dropping) it closes each
/// child exactly once.
pub struct CompositeDevice {
    inner: Arc<CompositeInner>,
}

impl fmt::Debug for CompositeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.describe())
    }
}

/// Builder for [`CompositeDevice`].
#[derive(Default)]
pub struct CompositeBuilder {
    positional: Vec<Box<dyn Device>>,
    named: Vec<(String, Box<dyn Device>)>,
    order: Option<Vec<String>>,
}

impl CompositeBuilder {
    /// Add a positional child.
    pub fn add(mut self, device: impl Device + 'static) -> Self {
        self.positional.push(Box::new(device));
        self
    }

    /// Add a named child.
    pub fn add_named(mut self, name: impl Into<String>, device: impl Device + 'static) -> Self {
        self.named.push((name.into(), Box::new(device)));
        self
    }

    /// Order of the named children in `value()`; required when positional
    /// and named children are mixed. Named children are sorted by name
    /// otherwise.
    pub fn order<S: Into<String>>(mut self, names: impl IntoIterator<Item = S>) -> Self {
        self.order = Some(names.into_iter().map(Into::into).collect());
        self
    }

    /// Validate and assemble.
    ///
    /// On error every child passed to the builder is closed.
    pub fn build(self) -> Result<CompositeDevice> {
        let CompositeBuilder {
            positional,
            mut named,
            order,
        } = self;

        if let Err(e) = validate(&positional, &named, order.as_deref()) {
            positional.iter().for_each(|d| d.close());
            named.iter().for_each(|(_, d)| d.close());
            return Err(e);
        }

        let order = order.unwrap_or_else(|| {
            let mut names: Vec<String> = named.iter().map(|(n, _)| n.clone()).collect();
            names.sort();
            names
        });

        let mut children: Vec<Child> = positional
            .into_iter()
            .map(|device| Child { name: None, device })
            .collect();
        for name in order {
            if let Some(pos) = named.iter().position(|(n, _)| *n == name) {
                let (name, device) = named.swap_remove(pos);
                children.push(Child {
                    name: Some(name),
                    device,
                });
            }
        }

        let composite = CompositeDevice {
            inner: Arc::new(CompositeInner {
                children,
                closed: AtomicBool::new(false),
                source: SourceSlot::new(),
            }),
        };
        debug!(device = %composite.inner.describe(), "Composite device built");
        Ok(composite)
    }
}

fn validate(
    positional: &[Box<dyn Device>],
    named: &[(String, Box<dyn Device>)],
    order: Option<&[String]>,
) -> Result<()> {
    if positional.is_empty() && named.is_empty() {
        return Err(GpioError::CompositeDeviceBadDevice(
            "a composite needs at least one child".into(),
        ));
    }

    let mut seen = HashSet::new();
    for (name, device) in named {
        if name.is_empty() || RESERVED_NAMES.contains(&name.as_str()) {
            return Err(GpioError::CompositeDeviceBadName(name.clone()));
        }
        if !seen.insert(name.as_str()) {
            return Err(GpioError::CompositeDeviceBadName(format!("duplicate name {}", name)));
        }
        if device.closed() {
            return Err(GpioError::CompositeDeviceBadDevice(format!(
                "{} is closed",
                name
            )));
        }
    }
    if let Some(closed) = positional.iter().find(|d| d.closed()) {
        return Err(GpioError::CompositeDeviceBadDevice(format!(
            "{} is closed",
            closed.describe()
        )));
    }

    match order {
        None if !positional.is_empty() && !named.is_empty() => Err(
            GpioError::CompositeDeviceBadOrder("order must be given with mixed children".into()),
        ),
        None => Ok(()),
        Some(order) => {
            let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
            if ordered.len() != order.len() || ordered != seen {
                return Err(GpioError::CompositeDeviceBadOrder(format!(
                    "order {:?} must list each named child exactly once",
                    order
                )));
            }
            Ok(())
        }
    }
}

impl CompositeDevice {
    pub fn builder() -> CompositeBuilder {
        CompositeBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.inner.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.children.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&dyn Device> {
        self.inner.children.get(index).map(|c| c.device.as_ref())
    }

    pub fn by_name(&self, name: &str) -> Option<&dyn Device> {
        self.inner
            .children
            .iter()
            .find(|c| c.name.as_deref() == Some(name))
            .map(|c| c.device.as_ref())
    }

    /// Names in declared order; positional children have none.
    pub fn names(&self) -> Vec<Option<&str>> {
        self.inner.children.iter().map(|c| c.name.as_deref()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Device> + '_ {
        self.inner.children.iter().map(|c| c.device.as_ref())
    }

    /// Borrowing view over a range of children.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> DeviceGroup<'_> {
        let len = self.len();
        let start = match range.start_bound() {
            std::ops::Bound::Included(&s) => s,
            std::ops::Bound::Excluded(&s) => s.saturating_add(1),
            std::ops::Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            std::ops::Bound::Included(&e) => e.saturating_add(1),
            std::ops::Bound::Excluded(&e) => e,
            std::ops::Bound::Unbounded => len,
        };
        let (start, end) = (start.min(len), end.min(len));
        DeviceGroup {
            devices: self.inner.children[start..end.max(start)]
                .iter()
                .map(|c| c.device.as_ref())
                .collect(),
        }
    }

    fn target(&self) -> Weak<dyn Device> {
        let inner: Arc<dyn Device> = self.inner.clone();
        Arc::downgrade(&inner)
    }
}

impl Device for CompositeDevice {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    fn value(&self) -> Result<Value> {
        self.inner.value()
    }

    fn set_value(&self, value: Value) -> Result<()> {
        self.inner.set_value(value)
    }

    fn is_active(&self) -> Result<bool> {
        self.inner.is_active()
    }

    fn close(&self) {
        self.inner.close()
    }

    fn closed(&self) -> bool {
        self.inner.closed()
    }
}

impl HasSource for CompositeDevice {
    fn set_source<I>(&self, source: Option<I>) -> Result<()>
    where
        I: IntoIterator<Item = Value>,
        I::IntoIter: Send + 'static,
    {
        self.inner.check_open()?;
        self.inner.source.replace(self.target(), source)
    }

    fn source_delay(&self) -> Duration {
        self.inner.source.delay()
    }

    fn set_source_delay(&self, delay: Duration) {
        self.inner.source.set_delay(delay)
    }
}

impl HasValues for CompositeDevice {
    fn values(&self) -> ValuesIter {
        ValuesIter::new(self.target())
    }
}

impl Drop for CompositeDevice {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// A non-owning view over some of a composite's children.
pub struct DeviceGroup<'a> {
    devices: Vec<&'a dyn Device>,
}

impl<'a> DeviceGroup<'a> {
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&'a dyn Device> {
        self.devices.get(index).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a dyn Device> + '_ {
        self.devices.iter().copied()
    }

    pub fn value(&self) -> Result<Value> {
        let values = self
            .devices
            .iter()
            .map(|d| d.value())
            .collect::<Result<Vec<_>>>()?;
        Ok(Value::Tuple(values))
    }

    pub fn is_active(&self) -> Result<bool> {
        for device in &self.devices {
            if device.is_active()? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::Led;
    use crate::pins::mock::MockFactory;
    use crate::pins::{Pin, PinFactory};
    use test_case::test_case;

    fn led(factory: &Arc<MockFactory>, pin: u32) -> Led {
        let factory: Arc<dyn PinFactory> = factory.clone();
        Led::builder(pin).pin_factory(factory).build().unwrap()
    }

    #[test]
    fn test_value_is_tuple_of_children() {
        let factory = MockFactory::new();
        let composite = CompositeDevice::builder()
            .add(led(&factory, 2))
            .add(led(&factory, 3))
            .build()
            .unwrap();

        assert_eq!(composite.value().unwrap(), (0.0, 0.0).into());
        composite.get(1).unwrap().set_value(1.0.into()).unwrap();
        assert_eq!(composite.value().unwrap(), (0.0, 1.0).into());
        assert!(composite.is_active().unwrap());

        composite.set_value((1.0, 0.0).into()).unwrap();
        assert_eq!(composite.get(0).unwrap().value().unwrap(), 1.0.into());
        assert_eq!(composite.get(1).unwrap().value().unwrap(), 0.0.into());
        assert_eq!(factory.mock_pin(2).unwrap().state().unwrap(), 1.0);

        assert!(matches!(
            composite.set_value(Value::Tuple(vec![1.0.into()])),
            Err(GpioError::CompositeDeviceBadValue {
                expected: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn test_named_children_sorted_without_order() {
        let factory = MockFactory::new();
        let composite = CompositeDevice::builder()
            .add_named("red", led(&factory, 4))
            .add_named("green", led(&factory, 5))
            .build()
            .unwrap();
        assert_eq!(composite.names(), vec![Some("green"), Some("red")]);
        composite.by_name("red").unwrap().set_value(1.0.into()).unwrap();
        assert_eq!(composite.value().unwrap(), (0.0, 1.0).into());
    }

    #[test]
    fn test_mixed_children_follow_order() {
        let factory = MockFactory::new();
        let composite = CompositeDevice::builder()
            .add(led(&factory, 4))
            .add_named("b", led(&factory, 5))
            .add_named("a", led(&factory, 6))
            .order(["b", "a"])
            .build()
            .unwrap();
        assert_eq!(composite.names(), vec![None, Some("b"), Some("a")]);
    }

    #[test_case("value"; "reserved_value")]
    #[test_case("close"; "reserved_close")]
    #[test_case(""; "empty")]
    fn test_bad_names(name: &str) {
        let factory = MockFactory::new();
        let result = CompositeDevice::builder()
            .add_named(name, led(&factory, 4))
            .build();
        assert!(matches!(result, Err(GpioError::CompositeDeviceBadName(_))));
        // The child was closed, so its pin is free again
        assert!(!factory.core().is_reserved(4));
    }

    #[test]
    fn test_bad_orders() {
        let factory = MockFactory::new();
        let mixed = CompositeDevice::builder()
            .add(led(&factory, 4))
            .add_named("a", led(&factory, 5))
            .build();
        assert!(matches!(mixed, Err(GpioError::CompositeDeviceBadOrder(_))));

        let incomplete = CompositeDevice::builder()
            .add_named("a", led(&factory, 4))
            .add_named("b", led(&factory, 5))
            .order(["a"])
            .build();
        assert!(matches!(
            incomplete,
            Err(GpioError::CompositeDeviceBadOrder(_))
        ));

        let empty = CompositeDevice::builder().build();
        assert!(matches!(empty, Err(GpioError::CompositeDeviceBadDevice(_))));
    }

    #[test]
    fn test_slice_and_iter() {
        let factory = MockFactory::new();
        let composite = CompositeDevice::builder()
            .add(led(&factory, 4))
            .add(led(&factory, 5))
            .add(led(&factory, 6))
            .build()
            .unwrap();
        composite.get(2).unwrap().set_value(1.0.into()).unwrap();

        let tail = composite.slice(1..);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail.value().unwrap(), (0.0, 1.0).into());
        assert!(composite.slice(..2).iter().all(|d| !d.is_active().unwrap()));
        assert!(composite.slice(5..).is_empty());
        assert_eq!(composite.slice(0..=usize::MAX).len(), 3);
        assert!(composite
            .slice((std::ops::Bound::Excluded(usize::MAX), std::ops::Bound::Unbounded))
            .is_empty());
        assert_eq!(composite.iter().count(), 3);
    }

    #[test]
    fn test_close_closes_children_once() {
        let factory = MockFactory::new();
        let composite = CompositeDevice::builder()
            .add(led(&factory, 4))
            .add(led(&factory, 5))
            .build()
            .unwrap();
        composite.close();
        composite.close();
        assert!(composite.closed());
        assert!(composite.iter().all(|d| d.closed()));
        assert!(matches!(composite.value(), Err(GpioError::DeviceClosed(_))));
        assert!(!factory.core().is_reserved(4));
    }

    #[test]
    fn test_source_drives_children() {
        let factory = MockFactory::new();
        let composite = CompositeDevice::builder()
            .add(led(&factory, 4))
            .add(led(&factory, 5))
            .build()
            .unwrap();
        composite.set_source_delay(Duration::from_millis(1));
        composite
            .set_source(Some(vec![Value::from((1.0, 1.0)), Value::from((0.0, 1.0))]))
            .unwrap();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(composite.value().unwrap(), (0.0, 1.0).into());

        let mut values = composite.values();
        assert_eq!(values.next(), Some((0.0, 1.0).into()));
        composite.close();
        assert_eq!(values.next(), None);
    }
}
