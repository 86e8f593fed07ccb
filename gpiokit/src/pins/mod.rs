//! Pin capability interface and backend factories.
//!
//! A [`Pin`] is a handle to one physical or virtual I/O line. Pins are
//! created (and cached) by a [`PinFactory`]; the same address always yields
//! the same `Arc` while it is alive. Devices never create pins directly:
//! they reserve an address through the factory's [`FactoryCore`] and then
//! fetch the pin, so two devices can never drive one line at once.
//!
//! Backends:
//! - [`mock`]: in-memory pins for tests, with a timestamped state history
//! - [`sysfs`]: Linux `/sys/class/gpio`

pub mod board;
pub mod debounce;
pub mod mock;
pub mod sysfs;

use bitflags::bitflags;
use strum::IntoEnumIterator;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crate::background::lock;
use crate::config::Config;
use crate::error::{GpioError, Result};
use crate::spi::{SoftwareSpiBus, SpiBusKey};
use crate::tracing::prelude::*;

pub use board::{BoardInfo, StaticBoardInfo};

/// Shared handle to a pin.
pub type PinRef = Arc<dyn Pin>;

/// Callback invoked on a detected edge with the tick and the new state.
pub type ChangedCallback = Arc<dyn Fn(Instant, bool) + Send + Sync>;

/// Pin function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinFunction {
    Input,
    Output,
    /// Alternate function N (board-specific peripheral routing)
    Alt(u8),
}

impl fmt::Display for PinFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinFunction::Input => write!(f, "input"),
            PinFunction::Output => write!(f, "output"),
            PinFunction::Alt(n) => write!(f, "alt{}", n),
        }
    }
}

impl FromStr for PinFunction {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "input" => Ok(PinFunction::Input),
            "output" => Ok(PinFunction::Output),
            other => other
                .strip_prefix("alt")
                .and_then(|n| n.parse().ok())
                .map(PinFunction::Alt)
                .ok_or_else(|| GpioError::PinInvalidFunction {
                    pin: None,
                    function: s.to_string(),
                }),
        }
    }
}

/// Pull resistor state
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, strum::Display, strum::AsRefStr, strum::EnumIter,
)]
#[strum(serialize_all = "lowercase")]
pub enum Pull {
    Up,
    Down,
    #[default]
    Floating,
}

impl FromStr for Pull {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self> {
        Pull::iter()
            .find(|p| p.as_ref().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| GpioError::PinInvalidPull {
                pin: None,
                pull: s.to_string(),
            })
    }
}

bitflags! {
    /// Edges that trigger a pin's changed-callback.
    ///
    /// The empty set disables edge detection.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Edges: u8 {
        const RISING = 0b01;
        const FALLING = 0b10;
        const BOTH = Self::RISING.bits() | Self::FALLING.bits();
    }
}

impl Edges {
    /// Whether a transition to `state` is one of the selected edges.
    pub fn matches(self, state: bool) -> bool {
        if state {
            self.contains(Edges::RISING)
        } else {
            self.contains(Edges::FALLING)
        }
    }
}

impl FromStr for Edges {
    type Err = GpioError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Edges::empty()),
            "rising" => Ok(Edges::RISING),
            "falling" => Ok(Edges::FALLING),
            "both" => Ok(Edges::BOTH),
            _ => Err(GpioError::PinInvalidEdges(s.to_string())),
        }
    }
}

/// Identifier a caller uses to name a pin.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PinSpec {
    Number(u32),
    Name(String),
}

impl From<u32> for PinSpec {
    fn from(n: u32) -> Self {
        PinSpec::Number(n)
    }
}

impl From<&str> for PinSpec {
    fn from(s: &str) -> Self {
        PinSpec::Name(s.to_string())
    }
}

impl From<String> for PinSpec {
    fn from(s: String) -> Self {
        PinSpec::Name(s)
    }
}

impl fmt::Display for PinSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PinSpec::Number(n) => write!(f, "GPIO{}", n),
            PinSpec::Name(s) => write!(f, "{}", s),
        }
    }
}

impl PinSpec {
    /// Resolve to a GPIO number.
    ///
    /// Accepts `17`, `"17"`, `"GPIO17"` and `"BCM17"`; other names are
    /// looked up through the board's header layout.
    pub fn resolve(&self, board: Option<&dyn BoardInfo>) -> Result<u32> {
        let number = match self {
            PinSpec::Number(n) => *n,
            PinSpec::Name(name) => {
                let trimmed = name.trim();
                let upper = trimmed.to_ascii_uppercase();
                let digits = upper
                    .strip_prefix("GPIO")
                    .or_else(|| upper.strip_prefix("BCM"))
                    .unwrap_or(&upper);
                match digits.parse::<u32>() {
                    Ok(n) => n,
                    Err(_) => board
                        .and_then(|b| b.resolve_name(trimmed))
                        .ok_or_else(|| GpioError::PinInvalidPin(trimmed.to_string()))?,
                }
            }
        };

        if let Some(count) = board.and_then(|b| b.gpio_count()) {
            if number >= count {
                return Err(GpioError::PinInvalidPin(format!(
                    "GPIO{} does not exist (board has {} GPIOs)",
                    number, count
                )));
            }
        }
        Ok(number)
    }
}

/// Capability-based handle to one I/O line.
///
/// All methods take `&self`; implementations synchronize internally because
/// a pin is shared between its owning device, background tasks and the
/// backend's edge-detection thread.
pub trait Pin: Send + Sync + fmt::Debug {
    /// Backend address (GPIO number).
    fn number(&self) -> u32;

    fn function(&self) -> PinFunction;

    /// Change the pin function. Fails with `PinInvalidFunction` if the
    /// backend does not support `function`.
    fn set_function(&self, function: PinFunction) -> Result<()>;

    /// Current state: 0.0 / 1.0, or the duty cycle while PWM is active.
    fn state(&self) -> Result<f64>;

    /// Drive the pin. Fails with `PinSetInput` on inputs.
    fn set_state(&self, state: f64) -> Result<()>;

    fn pull(&self) -> Pull;

    /// Fails with `PinFixedPull` on non-inputs and on pins whose physical
    /// pull resistor cannot be changed.
    fn set_pull(&self, pull: Pull) -> Result<()>;

    /// PWM frequency in Hz, `None` when PWM is off.
    fn frequency(&self) -> Option<f64> {
        None
    }

    /// Start (`Some`) or stop (`None`) PWM.
    fn set_frequency(&self, frequency: Option<f64>) -> Result<()> {
        match frequency {
            None => Ok(()),
            Some(_) => Err(GpioError::PinPwmUnsupported(self.number())),
        }
    }

    fn bounce(&self) -> Option<Duration>;

    fn set_bounce(&self, bounce: Option<Duration>) -> Result<()>;

    fn edges(&self) -> Edges;

    fn set_edges(&self, edges: Edges) -> Result<()>;

    /// Replace the single changed-callback slot.
    fn set_when_changed(&self, callback: Option<ChangedCallback>) -> Result<()>;

    /// Switch to output and drive `state` as one operation where the backend
    /// allows it, so no transient level is observable.
    fn output_with_state(&self, state: f64) -> Result<()> {
        self.set_function(PinFunction::Output)?;
        self.set_state(state)
    }

    /// Switch to input and apply `pull`.
    fn input_with_pull(&self, pull: Pull) -> Result<()> {
        self.set_function(PinFunction::Input)?;
        self.set_pull(pull)
    }

    /// Reset to a safe default (input, PWM off, callback cleared).
    ///
    /// Safe to call any number of times.
    fn close(&self) -> Result<()>;
}

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identity of a pin reservation holder (a device or a shared bus).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn next() -> Self {
        OwnerId(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone)]
struct Reservation {
    owner: OwnerId,
    label: String,
}

/// State every factory shares: pin reservations, the shared software SPI
/// buses built on its pins, and the tick origin.
#[derive(Debug)]
pub struct FactoryCore {
    started: Instant,
    reservations: Mutex<HashMap<u32, Reservation>>,
    spi_buses: Mutex<HashMap<SpiBusKey, Weak<SoftwareSpiBus>>>,
}

impl Default for FactoryCore {
    fn default() -> Self {
        Self {
            started: Instant::now(),
            reservations: Mutex::new(HashMap::new()),
            spi_buses: Mutex::new(HashMap::new()),
        }
    }
}

impl FactoryCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// When the factory was created.
    pub fn started(&self) -> Instant {
        self.started
    }

    /// Reserve `pins` for `owner`.
    ///
    /// Either every pin is reserved or none is: if any pin is held by a
    /// different owner this fails with `PinInUse` and records nothing.
    pub fn reserve_pins(&self, owner: OwnerId, label: &str, pins: &[u32]) -> Result<()> {
        let mut reservations = lock(&self.reservations);
        for pin in pins {
            if let Some(existing) = reservations.get(pin) {
                if existing.owner != owner {
                    return Err(GpioError::PinInUse {
                        pin: *pin,
                        owner: existing.label.clone(),
                    });
                }
            }
        }
        for pin in pins {
            reservations.insert(
                *pin,
                Reservation {
                    owner,
                    label: label.to_string(),
                },
            );
        }
        debug!(owner = %label, pins = ?pins, "Pins reserved");
        Ok(())
    }

    /// Release `pins` held by `owner`; pins held by others are untouched.
    pub fn release_pins(&self, owner: OwnerId, pins: &[u32]) {
        let mut reservations = lock(&self.reservations);
        for pin in pins {
            if reservations.get(pin).is_some_and(|r| r.owner == owner) {
                reservations.remove(pin);
            }
        }
        trace!(pins = ?pins, "Pins released");
    }

    /// Release every pin held by `owner`.
    pub fn release_all(&self, owner: OwnerId) {
        lock(&self.reservations).retain(|_, r| r.owner != owner);
    }

    /// Drop every reservation (factory teardown).
    pub fn clear_reservations(&self) {
        lock(&self.reservations).clear();
    }

    pub fn is_reserved(&self, pin: u32) -> bool {
        lock(&self.reservations).contains_key(&pin)
    }

    pub(crate) fn spi_buses(&self) -> &Mutex<HashMap<SpiBusKey, Weak<SoftwareSpiBus>>> {
        &self.spi_buses
    }
}

/// Backend that creates and caches pins.
pub trait PinFactory: Send + Sync + fmt::Debug {
    /// Short backend name used in logs.
    fn name(&self) -> &'static str;

    fn core(&self) -> &FactoryCore;

    /// Fetch the pin for `spec`, creating it on first use.
    fn pin(&self, spec: &PinSpec) -> Result<PinRef>;

    /// Board metadata, if the backend knows which board it runs on.
    fn board_info(&self) -> Option<&dyn BoardInfo> {
        None
    }

    /// Close every pin and drop all reservations.
    fn close(&self) -> Result<()>;

    fn ticks(&self) -> Instant {
        Instant::now()
    }

    /// Seconds from `earlier` to `later` (0 if `later` is earlier).
    fn ticks_diff(&self, later: Instant, earlier: Instant) -> f64 {
        later.saturating_duration_since(earlier).as_secs_f64()
    }
}

static DEFAULT_FACTORY: Mutex<Option<Arc<dyn PinFactory>>> = Mutex::new(None);

/// The process-wide default factory.
///
/// Built from [`Config::from_env`] on first use.
pub fn pin_factory() -> Result<Arc<dyn PinFactory>> {
    let mut slot = lock(&DEFAULT_FACTORY);
    if let Some(factory) = slot.as_ref() {
        return Ok(Arc::clone(factory));
    }
    let factory = Config::from_env().build_factory()?;
    info!(factory = factory.name(), "Default pin factory created");
    *slot = Some(Arc::clone(&factory));
    Ok(factory)
}

/// Replace the process-wide default factory, returning the previous one.
pub fn set_pin_factory(factory: Option<Arc<dyn PinFactory>>) -> Option<Arc<dyn PinFactory>> {
    std::mem::replace(&mut *lock(&DEFAULT_FACTORY), factory)
}

/// Close and forget the default factory, if one was created.
pub(crate) fn close_default_factory() {
    if let Some(factory) = set_pin_factory(None) {
        if let Err(e) = factory.close() {
            warn!(factory = factory.name(), error = %e, "Failed to close pin factory");
        }
    }
}
