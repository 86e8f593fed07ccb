//! Adapters for source pipelines.
//!
//! Each function wraps one or more value streams (usually a device's
//! `values()`) and yields transformed values, ready to hand to
//! `set_source`. Tuple values are transformed element-wise.

use crate::device::Value;
use crate::error::{GpioError, Result};

fn map_scalars(value: Value, f: &impl Fn(f64) -> f64) -> Value {
    match value {
        Value::Scalar(v) => Value::Scalar(f(v)),
        Value::Tuple(items) => Value::Tuple(items.into_iter().map(|v| map_scalars(v, f)).collect()),
    }
}

fn check_range(min: f64, max: f64) -> Result<()> {
    if min >= max {
        return Err(GpioError::OutputDeviceBadValue(format!(
            "range minimum {} must be below maximum {}",
            min, max
        )));
    }
    Ok(())
}

/// Logical negation: truthy values become 0, others 1.
pub fn negated<I>(values: I) -> impl Iterator<Item = Value>
where
    I: IntoIterator<Item = Value>,
{
    values.into_iter().map(|v| (!v.is_truthy()).into())
}

/// Mirror values within `min..=max` (`1 - v` for the unit range).
pub fn inverted<I>(values: I, min: f64, max: f64) -> Result<impl Iterator<Item = Value>>
where
    I: IntoIterator<Item = Value>,
{
    check_range(min, max)?;
    Ok(values
        .into_iter()
        .map(move |v| map_scalars(v, &|x| min + max - x)))
}

/// Linearly map values from `input` range to `output` range.
pub fn scaled<I>(
    values: I,
    output: (f64, f64),
    input: (f64, f64),
) -> Result<impl Iterator<Item = Value>>
where
    I: IntoIterator<Item = Value>,
{
    let (out_min, out_max) = output;
    let (in_min, in_max) = input;
    check_range(in_min, in_max)?;
    let factor = (out_max - out_min) / (in_max - in_min);
    Ok(values
        .into_iter()
        .map(move |v| map_scalars(v, &|x| out_min + (x - in_min) * factor)))
}

/// Limit values to `min..=max`.
pub fn clamped<I>(values: I, min: f64, max: f64) -> Result<impl Iterator<Item = Value>>
where
    I: IntoIterator<Item = Value>,
{
    check_range(min, max)?;
    Ok(values
        .into_iter()
        .map(move |v| map_scalars(v, &|x| x.clamp(min, max))))
}

// Step several streams in lock-step; ends with the shortest.
fn zipped<I>(sources: Vec<I>) -> impl Iterator<Item = Vec<Value>>
where
    I: Iterator<Item = Value>,
{
    let mut sources = sources;
    std::iter::from_fn(move || {
        if sources.is_empty() {
            return None;
        }
        sources.iter_mut().map(Iterator::next).collect()
    })
}

/// 1 while every source is truthy.
pub fn all_values<I>(sources: Vec<I>) -> impl Iterator<Item = Value>
where
    I: Iterator<Item = Value>,
{
    zipped(sources).map(|vals| vals.iter().all(Value::is_truthy).into())
}

/// 1 while any source is truthy.
pub fn any_values<I>(sources: Vec<I>) -> impl Iterator<Item = Value>
where
    I: Iterator<Item = Value>,
{
    zipped(sources).map(|vals| vals.iter().any(Value::is_truthy).into())
}

/// Mean of the sources' scalar values (tuples count as their truthiness).
pub fn averaged<I>(sources: Vec<I>) -> impl Iterator<Item = Value>
where
    I: Iterator<Item = Value>,
{
    zipped(sources).map(|vals| {
        let sum: f64 = vals
            .iter()
            .map(|v| v.as_f64().unwrap_or(if v.is_truthy() { 1.0 } else { 0.0 }))
            .sum();
        Value::Scalar(sum / vals.len() as f64)
    })
}
