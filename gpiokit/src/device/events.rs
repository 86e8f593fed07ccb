//! Edge event model.
//!
//! [`EdgeEvents`] turns a stream of boolean observations into
//! activated/deactivated transitions:
//!
//! - the first observation only sets the matching wait signal (there is no
//!   previous state, hence no edge)
//! - an observation equal to the previous one is a no-op
//! - a change flips the signals and fires `when_activated` or
//!   `when_deactivated`
//!
//! A device constructed while already active therefore never reports an
//! activation for that initial state.
//!
//! [`HoldDetector`] layers "held for N seconds" events on top.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use super::Device;
use crate::background::{lock, BackgroundTask, Signal};
use crate::error::Result;

/// A user callback for a device event.
///
/// The two variants replace runtime arity inspection: the handler's shape
/// is fixed when it is constructed.
pub enum EventHandler {
    NoArg(Box<dyn Fn() + Send + Sync>),
    WithDevice(Box<dyn Fn(&dyn Device) + Send + Sync>),
}

impl EventHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        EventHandler::NoArg(Box::new(f))
    }

    pub fn with_device<F>(f: F) -> Self
    where
        F: Fn(&dyn Device) + Send + Sync + 'static,
    {
        EventHandler::WithDevice(Box::new(f))
    }

    pub fn call(&self, device: &dyn Device) {
        match self {
            EventHandler::NoArg(f) => f(),
            EventHandler::WithDevice(f) => f(device),
        }
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventHandler::NoArg(_) => write!(f, "EventHandler::NoArg"),
            EventHandler::WithDevice(_) => write!(f, "EventHandler::WithDevice"),
        }
    }
}

/// Result of feeding one observation to [`EdgeEvents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// First observation; signals set, no callback.
    Initial,
    /// Same state as before.
    Unchanged,
    Activated,
    Deactivated,
}

#[derive(Debug)]
struct EdgeState {
    last_active: Option<bool>,
    last_changed: Instant,
    when_activated: Option<Arc<EventHandler>>,
    when_deactivated: Option<Arc<EventHandler>>,
}

/// Per-device activation state machine with blocking waits.
#[derive(Debug)]
pub struct EdgeEvents {
    state: Mutex<EdgeState>,
    active: Signal,
    inactive: Signal,
}

impl Default for EdgeEvents {
    fn default() -> Self {
        Self {
            state: Mutex::new(EdgeState {
                last_active: None,
                last_changed: Instant::now(),
                when_activated: None,
                when_deactivated: None,
            }),
            active: Signal::new(),
            inactive: Signal::new(),
        }
    }
}

impl EdgeEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_when_activated(&self, handler: Option<EventHandler>) {
        lock(&self.state).when_activated = handler.map(Arc::new);
    }

    pub fn set_when_deactivated(&self, handler: Option<EventHandler>) {
        lock(&self.state).when_deactivated = handler.map(Arc::new);
    }

    pub fn has_when_activated(&self) -> bool {
        lock(&self.state).when_activated.is_some()
    }

    pub fn has_when_deactivated(&self) -> bool {
        lock(&self.state).when_deactivated.is_some()
    }

    /// Feed an observation made at `at` and run any resulting callback
    /// with `device`.
    ///
    /// Callbacks run on the caller's thread with no lock held.
    pub fn fire(&self, device: &dyn Device, active: bool, at: Instant) -> Transition {
        let (transition, handler) = {
            let mut state = lock(&self.state);
            let previous = state.last_active.replace(active);
            if previous == Some(active) {
                return Transition::Unchanged;
            }
            // Signals follow last_active while the state is still locked
            if active {
                self.inactive.clear();
                self.active.set();
            } else {
                self.active.clear();
                self.inactive.set();
            }
            state.last_changed = at;
            match (previous, active) {
                (None, _) => (Transition::Initial, None),
                (Some(_), true) => (Transition::Activated, state.when_activated.clone()),
                (Some(_), false) => (Transition::Deactivated, state.when_deactivated.clone()),
            }
        };

        if let Some(handler) = handler {
            handler.call(device);
        }
        transition
    }

    /// Last observed state, `None` before the first observation.
    pub fn last_active(&self) -> Option<bool> {
        lock(&self.state).last_active
    }

    /// Block until active. Returns `false` on timeout.
    pub fn wait_for_active(&self, timeout: Option<Duration>) -> bool {
        self.active.wait(timeout)
    }

    /// Block until inactive. Returns `false` on timeout.
    pub fn wait_for_inactive(&self, timeout: Option<Duration>) -> bool {
        self.inactive.wait(timeout)
    }

    pub(crate) fn inactive_signal(&self) -> &Signal {
        &self.inactive
    }

    /// How long the device has been active, `None` if it is not.
    pub fn active_time(&self) -> Option<Duration> {
        let state = lock(&self.state);
        match state.last_active {
            Some(true) => Some(state.last_changed.elapsed()),
            _ => None,
        }
    }

    /// How long the device has been inactive, `None` if it is not.
    pub fn inactive_time(&self) -> Option<Duration> {
        let state = lock(&self.state);
        match state.last_active {
            Some(false) => Some(state.last_changed.elapsed()),
            _ => None,
        }
    }
}

// How often the hold task checks for a new activation.
const HOLD_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct HoldState {
    hold_time: Duration,
    hold_repeat: bool,
    when_held: Option<Arc<EventHandler>>,
    held_from: Option<Instant>,
}

#[derive(Debug)]
struct HoldShared {
    state: Mutex<HoldState>,
    holding: Signal,
}

/// Fires `when_held` once a device has stayed active for `hold_time`,
/// and again every `hold_time` while held if `hold_repeat` is set.
#[derive(Debug)]
pub struct HoldDetector {
    shared: Arc<HoldShared>,
    _task: BackgroundTask,
}

impl HoldDetector {
    /// Start watching `events`; handlers receive `target`.
    pub fn start(
        name: impl Into<String>,
        events: Arc<EdgeEvents>,
        target: Weak<dyn Device>,
        hold_time: Duration,
        hold_repeat: bool,
    ) -> Result<Self> {
        let shared = Arc::new(HoldShared {
            state: Mutex::new(HoldState {
                hold_time,
                hold_repeat,
                when_held: None,
                held_from: None,
            }),
            holding: Signal::new(),
        });

        let hold = Arc::clone(&shared);
        let task = BackgroundTask::spawn(name, move |stop| {
            while !stop.is_set() {
                if !hold.holding.wait(Some(HOLD_POLL)) {
                    continue;
                }
                hold.holding.clear();
                while hold_expired(&hold, &events, stop) {
                    let (handler, repeat) = {
                        let mut state = lock(&hold.state);
                        state.held_from.get_or_insert_with(Instant::now);
                        (state.when_held.clone(), state.hold_repeat)
                    };
                    let Some(device) = target.upgrade() else {
                        return Ok(());
                    };
                    if let Some(handler) = handler {
                        handler.call(device.as_ref());
                    }
                    if !repeat {
                        break;
                    }
                }
            }
            Ok(())
        })?;

        Ok(Self {
            shared,
            _task: task,
        })
    }

    /// Feed the device's transition so holds start and end with it.
    pub fn on_transition(&self, transition: Transition) {
        match transition {
            Transition::Activated => self.shared.holding.set(),
            Transition::Deactivated => lock(&self.shared.state).held_from = None,
            Transition::Initial | Transition::Unchanged => {}
        }
    }

    pub fn set_when_held(&self, handler: Option<EventHandler>) {
        lock(&self.shared.state).when_held = handler.map(Arc::new);
    }

    pub fn hold_time(&self) -> Duration {
        lock(&self.shared.state).hold_time
    }

    pub fn set_hold_time(&self, hold_time: Duration) {
        lock(&self.shared.state).hold_time = hold_time;
    }

    pub fn hold_repeat(&self) -> bool {
        lock(&self.shared.state).hold_repeat
    }

    pub fn set_hold_repeat(&self, repeat: bool) {
        lock(&self.shared.state).hold_repeat = repeat;
    }

    /// How long the current hold has lasted, counted from when `when_held`
    /// first fired.
    pub fn held_time(&self) -> Option<Duration> {
        lock(&self.shared.state).held_from.map(|t| t.elapsed())
    }

    pub fn is_held(&self) -> bool {
        lock(&self.shared.state).held_from.is_some()
    }
}

// Wait out one hold period. True if the device stayed active for all of it.
fn hold_expired(hold: &HoldShared, events: &EdgeEvents, stop: &Signal) -> bool {
    let hold_time = lock(&hold.state).hold_time;
    let deadline = Instant::now() + hold_time;
    loop {
        if stop.is_set() {
            return false;
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return true;
        }
        if events.inactive_signal().wait(Some(remaining.min(HOLD_POLL))) {
            return false;
        }
    }
}
