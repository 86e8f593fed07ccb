//! Error types for pin, device and bus operations.
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are
//! raised at the call that violates a precondition; background tasks never
//! surface errors to the caller (see [`crate::background`]).

/// Broad classification of a [`GpioError`].
///
/// Lets callers tell "wrong hardware" apart from "wrong input" without
/// matching on every variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid pin spec, function, pull, edge, or argument combination.
    Configuration,
    /// Operation not valid in the current state (closed device, input pin).
    State,
    /// Pin already owned by another device.
    ResourceConflict,
    /// Backend or pin lacks the requested capability.
    Capability,
    /// Underlying I/O failure.
    Io,
}

/// Common error type for pin and device operations
#[derive(Debug, thiserror::Error)]
pub enum GpioError {
    /// I/O error from the backend driver
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid pin: {0}")]
    PinInvalidPin(String),

    /// `pin` is `None` when a function name failed to parse.
    #[error("Invalid function{}: {function}", for_pin(.pin))]
    PinInvalidFunction { pin: Option<u32>, function: String },

    #[error("Invalid state for pin {pin}: {state}")]
    PinInvalidState { pin: u32, state: f64 },

    #[error("Invalid pull{}: {pull}", for_pin(.pin))]
    PinInvalidPull { pin: Option<u32>, pull: String },

    #[error("Invalid edges: {0}")]
    PinInvalidEdges(String),

    #[error("Invalid PWM frequency for pin {pin}: {frequency}")]
    PinInvalidFrequency { pin: u32, frequency: f64 },

    #[error("Cannot set state of pin {0}: pin is an input")]
    PinSetInput(u32),

    #[error("Cannot change pull of pin {pin}: {reason}")]
    PinFixedPull { pin: u32, reason: String },

    #[error("Cannot start PWM on pin {0}: pin is not an output")]
    PinPwmFixedValue(u32),

    #[error("PWM is not supported on pin {0}")]
    PinPwmUnsupported(u32),

    #[error("Edge detection is not supported on pin {0}")]
    PinEdgeDetectUnsupported(u32),

    #[error("Operation not supported on pin {pin}: {operation}")]
    PinUnsupported { pin: u32, operation: &'static str },

    #[error("Pin {pin} is already in use by {owner}")]
    PinInUse { pin: u32, owner: String },

    #[error("Unknown pin factory: {0}")]
    BadPinFactory(String),

    #[error("Device is closed: {0}")]
    DeviceClosed(String),

    #[error("Queue length must be at least 1")]
    InputDeviceBadQueueLen,

    #[error("Threshold must be between 0 and 1, got {0}")]
    InputDeviceBadThreshold(f64),

    #[error("Active state must be given when pull is floating")]
    InputDeviceBadActiveState,

    #[error("Invalid output value: {0}")]
    OutputDeviceBadValue(String),

    #[error("Device is read-only: {0}")]
    OutputDeviceReadOnly(String),

    #[error("Invalid composite device name: {0}")]
    CompositeDeviceBadName(String),

    #[error("Invalid composite device order: {0}")]
    CompositeDeviceBadOrder(String),

    #[error("Invalid composite device: {0}")]
    CompositeDeviceBadDevice(String),

    #[error("Invalid composite value: expected {expected} items, got {got}")]
    CompositeDeviceBadValue { expected: usize, got: usize },

    #[error("Invalid SPI arguments: {0}")]
    SpiBadArgs(String),

    #[error("Invalid SPI clock mode: {0} (must be 0-3)")]
    SpiInvalidClockMode(u8),

    #[error("Invalid SPI word size: {0} bits (must be 1-32)")]
    SpiInvalidWordSize(u8),

    #[error("SPI word 0x{word:x} does not fit in {bits} bits")]
    SpiBadWord { word: u32, bits: u8 },
}

fn for_pin(pin: &Option<u32>) -> String {
    pin.map(|p| format!(" for pin {}", p)).unwrap_or_default()
}

impl GpioError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        use GpioError::*;
        match self {
            Io(_) => ErrorKind::Io,
            PinInUse { .. } => ErrorKind::ResourceConflict,
            PinPwmUnsupported(_) | PinEdgeDetectUnsupported(_) | PinUnsupported { .. } => {
                ErrorKind::Capability
            }
            DeviceClosed(_)
            | PinSetInput(_)
            | PinPwmFixedValue(_)
            | PinFixedPull { .. }
            | OutputDeviceReadOnly(_) => ErrorKind::State,
            _ => ErrorKind::Configuration,
        }
    }

    /// True for the error a background task treats as "device went away".
    pub(crate) fn is_closed(&self) -> bool {
        matches!(self, GpioError::DeviceClosed(_))
    }
}

pub type Result<T> = std::result::Result<T, GpioError>;
