//! In-memory pin backend for tests and demos.
//!
//! [`MockPin`] records every state change with the time elapsed since the
//! previous change, so timing-sensitive behavior (blink, fades, sources)
//! can be asserted deterministically. Input pins are driven externally with
//! [`MockPin::drive_high`] / [`MockPin::drive_low`]; a connected output pin
//! drives its target input on every write.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use super::debounce::{DebounceWorker, StableFilter};
use super::{
    BoardInfo, ChangedCallback, Edges, FactoryCore, Pin, PinFactory, PinFunction, PinRef, PinSpec,
    Pull, StaticBoardInfo,
};
use crate::background::lock;
use crate::error::{GpioError, Result};
use crate::tracing::prelude::*;

/// Timing tolerance used by the assertion helpers.
const TIME_TOLERANCE: f64 = 0.05;

/// One recorded state change.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinState {
    /// Time since the previous recorded change (zero for the first entry).
    pub timestamp: Duration,
    pub state: f64,
}

struct MockState {
    function: PinFunction,
    state: f64,
    pull: Pull,
    frequency: Option<f64>,
    bounce: Option<Duration>,
    edges: Edges,
    when_changed: Option<ChangedCallback>,
    history: Vec<PinState>,
    last_change: Instant,
}

impl MockState {
    // Record `value` if it differs from the current state.
    fn change(&mut self, value: f64) -> bool {
        if self.state == value {
            return false;
        }
        let now = Instant::now();
        self.history.push(PinState {
            timestamp: now.saturating_duration_since(self.last_change),
            state: value,
        });
        self.last_change = now;
        self.state = value;
        true
    }
}

/// A simulated pin.
///
/// Plain pins accept 0/1 states; PWM-capable pins (see
/// [`MockFactory::with_pwm`]) also accept a duty cycle while a frequency
/// is set.
pub struct MockPin {
    number: u32,
    me: Weak<MockPin>,
    pwm: bool,
    fixed_pull: Option<Pull>,
    connected: Option<Weak<MockPin>>,
    state: Mutex<MockState>,
    debounce: Mutex<Option<Arc<DebounceWorker>>>,
}

impl fmt::Debug for MockPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MockPin")
            .field("number", &self.number)
            .field("function", &state.function)
            .field("state", &state.state)
            .field("pull", &state.pull)
            .field("frequency", &state.frequency)
            .finish()
    }
}

impl MockPin {
    fn new(
        number: u32,
        pwm: bool,
        fixed_pull: Option<Pull>,
        connected: Option<Weak<MockPin>>,
    ) -> Arc<Self> {
        let pull = fixed_pull.unwrap_or_default();
        let state = if pull == Pull::Up { 1.0 } else { 0.0 };
        Arc::new_cyclic(|me| MockPin {
            number,
            me: me.clone(),
            pwm,
            fixed_pull,
            connected,
            state: Mutex::new(MockState {
                function: PinFunction::Input,
                state,
                pull,
                frequency: None,
                bounce: None,
                edges: Edges::BOTH,
                when_changed: None,
                history: vec![PinState {
                    timestamp: Duration::ZERO,
                    state,
                }],
                last_change: Instant::now(),
            }),
            debounce: Mutex::new(None),
        })
    }

    /// Simulate the input being pulled high externally.
    pub fn drive_high(&self) -> Result<()> {
        self.drive(true)
    }

    /// Simulate the input being pulled low externally.
    pub fn drive_low(&self) -> Result<()> {
        self.drive(false)
    }

    fn drive(&self, high: bool) -> Result<()> {
        let callback = {
            let mut state = lock(&self.state);
            if state.function != PinFunction::Input {
                return Err(GpioError::PinInvalidFunction {
                    pin: Some(self.number),
                    function: format!("cannot drive {} pin", state.function),
                });
            }
            if !state.change(if high { 1.0 } else { 0.0 }) {
                return Ok(());
            }
            trace!(pin = self.number, high, "Mock input driven");
            if state.bounce.is_some() {
                None
            } else if state.edges.matches(high) {
                state.when_changed.clone()
            } else {
                None
            }
        };

        let debounce = lock(&self.debounce).clone();
        if let Some(worker) = debounce {
            worker.observe(high, Instant::now());
        } else if let Some(callback) = callback {
            callback(Instant::now(), high);
        }
        Ok(())
    }

    // Delivery from the debounce worker.
    fn fire_debounced(&self, at: Instant, high: bool) {
        let callback = {
            let state = lock(&self.state);
            if state.edges.matches(high) {
                state.when_changed.clone()
            } else {
                None
            }
        };
        if let Some(callback) = callback {
            callback(at, high);
        }
    }

    fn drive_connected(&self, value: f64) {
        let Some(target) = self.connected.as_ref().and_then(Weak::upgrade) else {
            return;
        };
        if let Err(e) = target.drive(value != 0.0) {
            debug!(pin = self.number, target = target.number, error = %e, "Connected pin not driven");
        }
    }

    // Drive an input to the level its pull implies.
    fn settle_pull(&self) -> Result<()> {
        let pull = lock(&self.state).pull;
        match pull {
            Pull::Up => self.drive(true),
            Pull::Down => self.drive(false),
            Pull::Floating => Ok(()),
        }
    }

    fn check_pull(&self, pull: Pull) -> Result<()> {
        match self.fixed_pull {
            Some(fixed) if fixed != pull => Err(GpioError::PinFixedPull {
                pin: self.number,
                reason: format!("physical pull-{} resistor", fixed),
            }),
            _ => Ok(()),
        }
    }

    fn stop_debounce(&self) {
        let worker = lock(&self.debounce).take();
        drop(worker);
    }

    /// Recorded state values, oldest first.
    pub fn states(&self) -> Vec<f64> {
        lock(&self.state).history.iter().map(|s| s.state).collect()
    }

    /// Full recorded history.
    pub fn history(&self) -> Vec<PinState> {
        lock(&self.state).history.clone()
    }

    /// Restart the history from the current state.
    pub fn clear_states(&self) {
        let mut state = lock(&self.state);
        state.last_change = Instant::now();
        let current = state.state;
        state.history = vec![PinState {
            timestamp: Duration::ZERO,
            state: current,
        }];
    }

    /// Panic unless the recorded states equal `expected`.
    pub fn assert_states(&self, expected: &[f64]) {
        let actual = self.states();
        assert_eq!(
            actual.len(),
            expected.len(),
            "pin {} states {:?}, expected {:?}",
            self.number,
            actual,
            expected
        );
        for (a, e) in actual.iter().zip(expected) {
            assert!(
                (a - e).abs() < 1e-9,
                "pin {} states {:?}, expected {:?}",
                self.number,
                actual,
                expected
            );
        }
    }

    /// Panic unless the history matches `(seconds since previous, state)`
    /// pairs, with a 50 ms tolerance on times.
    pub fn assert_states_and_times(&self, expected: &[(f64, f64)]) {
        let history = self.history();
        assert_eq!(
            history.len(),
            expected.len(),
            "pin {} history {:?}, expected {:?}",
            self.number,
            history,
            expected
        );
        for (actual, (time, state)) in history.iter().zip(expected) {
            assert!(
                (actual.state - state).abs() < 1e-9
                    && (actual.timestamp.as_secs_f64() - time).abs() <= TIME_TOLERANCE,
                "pin {} history {:?}, expected {:?}",
                self.number,
                history,
                expected
            );
        }
    }
}

impl Pin for MockPin {
    fn number(&self) -> u32 {
        self.number
    }

    fn function(&self) -> PinFunction {
        lock(&self.state).function
    }

    fn set_function(&self, function: PinFunction) -> Result<()> {
        {
            let mut state = lock(&self.state);
            match function {
                PinFunction::Alt(_) => {
                    return Err(GpioError::PinInvalidFunction {
                        pin: Some(self.number),
                        function: function.to_string(),
                    })
                }
                PinFunction::Output => {
                    state.function = PinFunction::Output;
                    state.pull = self.fixed_pull.unwrap_or_default();
                    return Ok(());
                }
                PinFunction::Input => {
                    state.function = PinFunction::Input;
                    state.frequency = None;
                }
            }
        }
        self.settle_pull()
    }

    fn state(&self) -> Result<f64> {
        Ok(lock(&self.state).state)
    }

    fn set_state(&self, value: f64) -> Result<()> {
        let applied = {
            let mut state = lock(&self.state);
            if state.function == PinFunction::Input {
                return Err(GpioError::PinSetInput(self.number));
            }
            if !(0.0..=1.0).contains(&value) {
                return Err(GpioError::PinInvalidState {
                    pin: self.number,
                    state: value,
                });
            }
            let applied = match state.frequency {
                Some(_) => value,
                None if value != 0.0 => 1.0,
                None => 0.0,
            };
            state.change(applied);
            applied
        };
        self.drive_connected(applied);
        Ok(())
    }

    fn pull(&self) -> Pull {
        lock(&self.state).pull
    }

    fn set_pull(&self, pull: Pull) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if state.function != PinFunction::Input {
                return Err(GpioError::PinFixedPull {
                    pin: self.number,
                    reason: "pin is not an input".to_string(),
                });
            }
            self.check_pull(pull)?;
            state.pull = pull;
        }
        self.settle_pull()
    }

    fn frequency(&self) -> Option<f64> {
        lock(&self.state).frequency
    }

    fn set_frequency(&self, frequency: Option<f64>) -> Result<()> {
        let mut state = lock(&self.state);
        match frequency {
            None => {
                if state.frequency.take().is_some() {
                    state.change(0.0);
                }
                Ok(())
            }
            Some(_) if !self.pwm => Err(GpioError::PinPwmUnsupported(self.number)),
            Some(_) if state.function != PinFunction::Output => {
                Err(GpioError::PinPwmFixedValue(self.number))
            }
            Some(hz) if !hz.is_finite() || hz <= 0.0 => Err(GpioError::PinInvalidFrequency {
                pin: self.number,
                frequency: hz,
            }),
            Some(hz) => {
                state.frequency = Some(hz);
                Ok(())
            }
        }
    }

    fn bounce(&self) -> Option<Duration> {
        lock(&self.state).bounce
    }

    fn set_bounce(&self, bounce: Option<Duration>) -> Result<()> {
        let bounce = bounce.filter(|b| !b.is_zero());
        let initial = {
            let mut state = lock(&self.state);
            state.bounce = bounce;
            state.state != 0.0
        };

        self.stop_debounce();
        if let Some(window) = bounce {
            let pin = self.me.clone();
            let worker = DebounceWorker::start(
                format!("debounce-{}", self.number),
                StableFilter::new(window, Some(initial)),
                move |at, high| {
                    if let Some(pin) = pin.upgrade() {
                        pin.fire_debounced(at, high);
                    }
                },
            )?;
            *lock(&self.debounce) = Some(Arc::new(worker));
        }
        Ok(())
    }

    fn edges(&self) -> Edges {
        lock(&self.state).edges
    }

    fn set_edges(&self, edges: Edges) -> Result<()> {
        lock(&self.state).edges = edges;
        Ok(())
    }

    fn set_when_changed(&self, callback: Option<ChangedCallback>) -> Result<()> {
        lock(&self.state).when_changed = callback;
        Ok(())
    }

    fn output_with_state(&self, value: f64) -> Result<()> {
        let applied = {
            let mut state = lock(&self.state);
            if !(0.0..=1.0).contains(&value) {
                return Err(GpioError::PinInvalidState {
                    pin: self.number,
                    state: value,
                });
            }
            state.function = PinFunction::Output;
            state.pull = self.fixed_pull.unwrap_or_default();
            let applied = match state.frequency {
                Some(_) => value,
                None if value != 0.0 => 1.0,
                None => 0.0,
            };
            state.change(applied);
            applied
        };
        self.drive_connected(applied);
        Ok(())
    }

    fn input_with_pull(&self, pull: Pull) -> Result<()> {
        self.check_pull(pull)?;
        {
            let mut state = lock(&self.state);
            state.function = PinFunction::Input;
            state.frequency = None;
            state.pull = pull;
        }
        self.settle_pull()
    }

    fn close(&self) -> Result<()> {
        self.stop_debounce();
        {
            let mut state = lock(&self.state);
            state.when_changed = None;
            state.bounce = None;
            state.edges = Edges::BOTH;
            if state.frequency.take().is_some() {
                state.change(0.0);
            }
            state.function = PinFunction::Input;
            state.pull = self.fixed_pull.unwrap_or_default();
        }
        self.settle_pull()
    }
}

/// Factory producing [`MockPin`]s.
///
/// Pins are held strongly so a test can inspect a pin after the device that
/// used it has been closed; [`MockFactory::reset`] forgets them.
pub struct MockFactory {
    core: FactoryCore,
    board: StaticBoardInfo,
    pwm: bool,
    pins: Mutex<HashMap<u32, Arc<MockPin>>>,
}

impl fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFactory")
            .field("board", &self.board.revision())
            .field("pwm", &self.pwm)
            .field("pins", &lock(&self.pins).len())
            .finish()
    }
}

impl Default for MockFactory {
    fn default() -> Self {
        Self::with_board(StaticBoardInfo::raspberry_pi(), false)
    }
}

impl MockFactory {
    /// Plain (non-PWM) pins on a simulated Raspberry Pi header.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// PWM-capable pins on a simulated Raspberry Pi header.
    pub fn with_pwm() -> Arc<Self> {
        Arc::new(Self::with_board(StaticBoardInfo::raspberry_pi(), true))
    }

    pub fn with_board(board: StaticBoardInfo, pwm: bool) -> Self {
        Self {
            core: FactoryCore::new(),
            board,
            pwm,
            pins: Mutex::new(HashMap::new()),
        }
    }

    fn make_pin(&self, number: u32, connected: Option<Weak<MockPin>>) -> Arc<MockPin> {
        let fixed = self.board.pulled_up(number).then_some(Pull::Up);
        MockPin::new(number, self.pwm, fixed, connected)
    }

    /// Typed access to the pin for `spec`, creating it on first use.
    pub fn mock_pin(&self, spec: impl Into<PinSpec>) -> Result<Arc<MockPin>> {
        let number = spec.into().resolve(Some(&self.board))?;
        let mut pins = lock(&self.pins);
        let pin = pins
            .entry(number)
            .or_insert_with(|| self.make_pin(number, None));
        Ok(Arc::clone(pin))
    }

    /// Create the pin for `spec` wired to drive `input` on every write.
    ///
    /// Fails if the pin already exists unconnected, since pin identity
    /// cannot change once handed out.
    pub fn connected_pin(
        &self,
        spec: impl Into<PinSpec>,
        input: &Arc<MockPin>,
    ) -> Result<Arc<MockPin>> {
        let number = spec.into().resolve(Some(&self.board))?;
        let mut pins = lock(&self.pins);
        if let Some(existing) = pins.get(&number) {
            let wired = existing
                .connected
                .as_ref()
                .is_some_and(|w| w.as_ptr() == Arc::as_ptr(input));
            if !wired {
                return Err(GpioError::PinInvalidPin(format!(
                    "GPIO{} already exists without this connection",
                    number
                )));
            }
            return Ok(Arc::clone(existing));
        }
        let pin = self.make_pin(number, Some(Arc::downgrade(input)));
        pins.insert(number, Arc::clone(&pin));
        Ok(pin)
    }

    /// Close and forget every pin and reservation.
    pub fn reset(&self) {
        let pins: Vec<Arc<MockPin>> = lock(&self.pins).drain().map(|(_, p)| p).collect();
        for pin in pins {
            let _ = pin.close();
        }
        self.core.clear_reservations();
    }
}

impl PinFactory for MockFactory {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn core(&self) -> &FactoryCore {
        &self.core
    }

    fn pin(&self, spec: &PinSpec) -> Result<PinRef> {
        let pin: PinRef = self.mock_pin(spec.clone())?;
        Ok(pin)
    }

    fn board_info(&self) -> Option<&dyn BoardInfo> {
        Some(&self.board)
    }

    fn close(&self) -> Result<()> {
        let pins: Vec<Arc<MockPin>> = lock(&self.pins).values().cloned().collect();
        for pin in pins {
            pin.close()?;
        }
        self.core.clear_reservations();
        debug!("Mock factory closed");
        Ok(())
    }
}
