//! Bit-banged SPI.
//!
//! A [`SoftwareSpiBus`] drives the clock and data lines; it is shared by
//! every [`SpiInterface`] on the same clock/MOSI/MISO pins and serialises
//! their transfers with a lock. Each interface owns its own select line.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use crate::background::lock;
use crate::device::{factory_or_default, Device};
use crate::error::{GpioError, Result};
use crate::input::InputDevice;
use crate::output::DigitalOutputDevice;
use crate::pins::{PinFactory, PinSpec};
use crate::tracing::prelude::*;

/// Pins identifying a shared bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpiBusKey {
    pub clock: u32,
    pub mosi: Option<u32>,
    pub miso: Option<u32>,
}

impl fmt::Display for SpiBusKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "clock=GPIO{}", self.clock)?;
        if let Some(mosi) = self.mosi {
            write!(f, ", mosi=GPIO{}", mosi)?;
        }
        if let Some(miso) = self.miso {
            write!(f, ", miso=GPIO{}", miso)?;
        }
        Ok(())
    }
}

/// Per-interface transfer settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SpiSettings {
    clock_mode: u8,
    lsb_first: bool,
    select_high: bool,
    bits_per_word: u8,
}

impl SpiSettings {
    fn polarity(self) -> bool {
        self.clock_mode & 0b10 != 0
    }

    fn phase(self) -> bool {
        self.clock_mode & 0b01 != 0
    }
}

fn check_clock_mode(mode: u8) -> Result<u8> {
    if mode > 3 {
        return Err(GpioError::SpiInvalidClockMode(mode));
    }
    Ok(mode)
}

fn check_word_size(bits: u8) -> Result<u8> {
    if !(1..=32).contains(&bits) {
        return Err(GpioError::SpiInvalidWordSize(bits));
    }
    Ok(bits)
}

/// Clock, MOSI and MISO lines of one software bus.
#[derive(Debug)]
pub struct SoftwareSpiBus {
    key: SpiBusKey,
    clock: DigitalOutputDevice,
    mosi: Option<DigitalOutputDevice>,
    miso: Option<InputDevice>,
    lock: Mutex<()>,
}

impl SoftwareSpiBus {
    fn open(factory: &Arc<dyn PinFactory>, key: SpiBusKey) -> Result<Self> {
        let clock = DigitalOutputDevice::builder(key.clock)
            .kind("SPI clock")
            .pin_factory(Arc::clone(factory))
            .build()?;
        let mosi = match key.mosi {
            Some(pin) => Some(
                DigitalOutputDevice::builder(pin)
                    .kind("SPI MOSI")
                    .pin_factory(Arc::clone(factory))
                    .build()?,
            ),
            None => None,
        };
        let miso = match key.miso {
            Some(pin) => Some(
                InputDevice::builder(pin)
                    .kind("SPI MISO")
                    .pin_factory(Arc::clone(factory))
                    .build()?,
            ),
            None => None,
        };
        debug!(bus = %key, "SPI bus opened");
        Ok(Self {
            key,
            clock,
            mosi,
            miso,
            lock: Mutex::new(()),
        })
    }

    /// Fetch the bus for `key` from the factory's table, opening it if no
    /// live interface holds it.
    fn shared(factory: &Arc<dyn PinFactory>, key: SpiBusKey) -> Result<Arc<Self>> {
        let mut buses = lock(factory.core().spi_buses());
        buses.retain(|_, bus| bus.strong_count() > 0);
        if let Some(bus) = buses.get(&key).and_then(Weak::upgrade) {
            return Ok(bus);
        }
        let bus = Arc::new(Self::open(factory, key)?);
        buses.insert(key, Arc::downgrade(&bus));
        Ok(bus)
    }

    pub fn key(&self) -> SpiBusKey {
        self.key
    }

    fn sample(&self) -> Result<bool> {
        match &self.miso {
            Some(miso) => miso.is_high(),
            None => Ok(false),
        }
    }

    /// Exchange `words` with `select` asserted, holding the bus lock.
    fn exchange(
        &self,
        select: &DigitalOutputDevice,
        words: &[u32],
        settings: SpiSettings,
    ) -> Result<Vec<u32>> {
        let _guard = lock(&self.lock);
        // Idle level for this interface's mode
        self.clock.set_active_high(!settings.polarity());
        self.clock.off()?;

        select.on()?;
        let result = self.shift(words, settings);
        let released = select.off();
        let read = result?;
        released?;
        Ok(read)
    }

    fn shift(&self, words: &[u32], settings: SpiSettings) -> Result<Vec<u32>> {
        let bits = settings.bits_per_word;
        let phase = settings.phase();
        let mut read_words = Vec::with_capacity(words.len());

        for &word in words {
            let mut mask: u32 = if settings.lsb_first { 1 } else { 1 << (bits - 1) };
            let mut read = 0u32;
            for _ in 0..bits {
                if let Some(mosi) = &self.mosi {
                    mosi.set_value((word & mask != 0).into())?;
                }
                self.clock.on()?;
                if !phase && self.sample()? {
                    read |= mask;
                }
                self.clock.off()?;
                if phase && self.sample()? {
                    read |= mask;
                }
                mask = if settings.lsb_first { mask << 1 } else { mask >> 1 };
            }
            read_words.push(read);
        }

        trace!(bus = %self.key, words = words.len(), bits, "SPI transfer");
        Ok(read_words)
    }
}

/// One chip on a software SPI bus.
pub struct SpiInterface {
    bus: Mutex<Option<Arc<SoftwareSpiBus>>>,
    select: DigitalOutputDevice,
    settings: Mutex<SpiSettings>,
}

pub struct SpiInterfaceBuilder {
    clock: PinSpec,
    select: PinSpec,
    mosi: Option<PinSpec>,
    miso: Option<PinSpec>,
    clock_mode: u8,
    lsb_first: bool,
    select_high: bool,
    bits_per_word: u8,
    factory: Option<Arc<dyn PinFactory>>,
}

impl SpiInterfaceBuilder {
    pub fn mosi(mut self, pin: impl Into<PinSpec>) -> Self {
        self.mosi = Some(pin.into());
        self
    }

    pub fn miso(mut self, pin: impl Into<PinSpec>) -> Self {
        self.miso = Some(pin.into());
        self
    }

    /// SPI mode 0 to 3: bit 1 is the clock polarity, bit 0 the phase.
    pub fn clock_mode(mut self, mode: u8) -> Self {
        self.clock_mode = mode;
        self
    }

    pub fn lsb_first(mut self, lsb_first: bool) -> Self {
        self.lsb_first = lsb_first;
        self
    }

    /// Assert select by driving it high (default: low).
    pub fn select_high(mut self, select_high: bool) -> Self {
        self.select_high = select_high;
        self
    }

    pub fn bits_per_word(mut self, bits: u8) -> Self {
        self.bits_per_word = bits;
        self
    }

    pub fn pin_factory(mut self, factory: Arc<dyn PinFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    pub fn build(self) -> Result<SpiInterface> {
        let settings = SpiSettings {
            clock_mode: check_clock_mode(self.clock_mode)?,
            lsb_first: self.lsb_first,
            select_high: self.select_high,
            bits_per_word: check_word_size(self.bits_per_word)?,
        };
        if self.mosi.is_none() && self.miso.is_none() {
            return Err(GpioError::SpiBadArgs(
                "at least one of mosi and miso is required".into(),
            ));
        }

        let factory = factory_or_default(self.factory)?;
        let board = factory.board_info();
        let key = SpiBusKey {
            clock: self.clock.resolve(board)?,
            mosi: self.mosi.map(|p| p.resolve(board)).transpose()?,
            miso: self.miso.map(|p| p.resolve(board)).transpose()?,
        };
        let select_pin = self.select.resolve(board)?;
        if select_pin == key.clock
            || key.mosi == Some(select_pin)
            || key.miso == Some(select_pin)
        {
            return Err(GpioError::SpiBadArgs(format!(
                "select pin GPIO{} is also a bus pin",
                select_pin
            )));
        }

        let bus = SoftwareSpiBus::shared(&factory, key)?;
        let select = DigitalOutputDevice::builder(select_pin)
            .kind("SPI select")
            .active_high(settings.select_high)
            .pin_factory(factory)
            .build()?;

        Ok(SpiInterface {
            bus: Mutex::new(Some(bus)),
            select,
            settings: Mutex::new(settings),
        })
    }
}

impl SpiInterface {
    /// Mode 0, MSB first, active-low select, 8-bit words.
    pub fn builder(clock: impl Into<PinSpec>, select: impl Into<PinSpec>) -> SpiInterfaceBuilder {
        SpiInterfaceBuilder {
            clock: clock.into(),
            select: select.into(),
            mosi: None,
            miso: None,
            clock_mode: 0,
            lsb_first: false,
            select_high: false,
            bits_per_word: 8,
            factory: None,
        }
    }

    fn bus(&self) -> Result<Arc<SoftwareSpiBus>> {
        let bus = lock(&self.bus).clone();
        bus.ok_or_else(|| GpioError::DeviceClosed(self.describe()))
    }

    fn check_open(&self) -> Result<()> {
        self.bus().map(drop)
    }

    fn settings(&self) -> SpiSettings {
        *lock(&self.settings)
    }

    /// Write `words` while reading the same number back.
    pub fn transfer(&self, words: &[u32]) -> Result<Vec<u32>> {
        let settings = self.settings();
        let bits = settings.bits_per_word;
        if let Some(&word) = words.iter().find(|&&w| bits < 32 && w >> bits != 0) {
            return Err(GpioError::SpiBadWord { word, bits });
        }
        self.bus()?.exchange(&self.select, words, settings)
    }

    /// Read `n` words, writing zeros.
    pub fn read(&self, n: usize) -> Result<Vec<u32>> {
        self.transfer(&vec![0; n])
    }

    /// Write `words`, discarding what comes back. Returns the count written.
    pub fn write(&self, words: &[u32]) -> Result<usize> {
        Ok(self.transfer(words)?.len())
    }

    pub fn clock_mode(&self) -> u8 {
        self.settings().clock_mode
    }

    pub fn set_clock_mode(&self, mode: u8) -> Result<()> {
        self.check_open()?;
        lock(&self.settings).clock_mode = check_clock_mode(mode)?;
        Ok(())
    }

    /// Clock idles high.
    pub fn clock_polarity(&self) -> bool {
        self.settings().polarity()
    }

    /// Data is sampled on the trailing clock edge.
    pub fn clock_phase(&self) -> bool {
        self.settings().phase()
    }

    pub fn lsb_first(&self) -> bool {
        self.settings().lsb_first
    }

    pub fn set_lsb_first(&self, lsb_first: bool) -> Result<()> {
        self.check_open()?;
        lock(&self.settings).lsb_first = lsb_first;
        Ok(())
    }

    pub fn select_high(&self) -> bool {
        self.settings().select_high
    }

    /// Change the select polarity and leave the line deasserted.
    pub fn set_select_high(&self, select_high: bool) -> Result<()> {
        self.check_open()?;
        let mut settings = lock(&self.settings);
        self.select.set_active_high(select_high);
        self.select.off()?;
        settings.select_high = select_high;
        Ok(())
    }

    pub fn bits_per_word(&self) -> u8 {
        self.settings().bits_per_word
    }

    pub fn set_bits_per_word(&self, bits: u8) -> Result<()> {
        self.check_open()?;
        lock(&self.settings).bits_per_word = check_word_size(bits)?;
        Ok(())
    }

    pub fn describe(&self) -> String {
        let bus = lock(&self.bus).as_ref().map(|b| b.key());
        match bus {
            Some(key) => format!("SPI({}, select=GPIO{})", key, self.select.pin_number()),
            None => format!("SPI(select=GPIO{}) (closed)", self.select.pin_number()),
        }
    }

    /// Release the select line and this interface's hold on the bus. The
    /// bus pins are released once the last interface on them closes.
    pub fn close(&self) {
        let bus = lock(&self.bus).take();
        if bus.is_none() {
            return;
        }
        self.select.close();
        drop(bus);
    }

    pub fn closed(&self) -> bool {
        lock(&self.bus).is_none()
    }
}

impl fmt::Debug for SpiInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl Drop for SpiInterface {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::mock::{MockFactory, MockPin};
    use crate::pins::{ChangedCallback, Pin};
    use std::collections::VecDeque;
    use std::thread;
    use test_case::test_case;

    const CLOCK: u32 = 11;
    const MOSI: u32 = 10;
    const MISO: u32 = 9;
    const SELECT: u32 = 8;

    /// MOSI wired straight back into MISO.
    fn loopback() -> (Arc<MockFactory>, Arc<MockPin>) {
        let factory = MockFactory::new();
        let miso = factory.mock_pin(MISO).unwrap();
        factory.connected_pin(MOSI, &miso).unwrap();
        (factory, miso)
    }

    fn interface(factory: &Arc<MockFactory>) -> SpiInterfaceBuilder {
        let factory: Arc<dyn PinFactory> = factory.clone();
        SpiInterface::builder(CLOCK, SELECT)
            .mosi(MOSI)
            .miso(MISO)
            .pin_factory(factory)
    }

    #[test_case(0; "mode 0")]
    #[test_case(1; "mode 1")]
    #[test_case(2; "mode 2")]
    #[test_case(3; "mode 3")]
    fn test_loopback(mode: u8) {
        let (factory, _miso) = loopback();
        let spi = interface(&factory).clock_mode(mode).build().unwrap();
        let words = [0x00, 0x5A, 0xFF, 0x81];
        assert_eq!(spi.transfer(&words).unwrap(), words);

        let clock = factory.mock_pin(CLOCK).unwrap();
        let idle = if mode >= 2 { 1.0 } else { 0.0 };
        assert_eq!(clock.state().unwrap(), idle);
    }

    #[test]
    fn test_loopback_wide_lsb_first() {
        let (factory, _miso) = loopback();
        let spi = interface(&factory)
            .bits_per_word(12)
            .lsb_first(true)
            .build()
            .unwrap();
        assert_eq!(spi.transfer(&[0xABC, 0x001]).unwrap(), vec![0xABC, 0x001]);
    }

    #[test]
    fn test_miso_held_high_reads_ones() {
        let factory = MockFactory::new();
        let miso = factory.mock_pin(MISO).unwrap();
        let dyn_factory: Arc<dyn PinFactory> = factory.clone();
        let spi = SpiInterface::builder(CLOCK, SELECT)
            .miso(MISO)
            .pin_factory(dyn_factory)
            .build()
            .unwrap();
        miso.drive_high().unwrap();
        assert_eq!(spi.read(2).unwrap(), vec![0xFF, 0xFF]);

        spi.set_bits_per_word(12).unwrap();
        assert_eq!(spi.read(1).unwrap(), vec![0xFFF]);
    }

    // MISO follows a bit pattern, advanced on every rising clock edge.
    fn patterned(factory: &Arc<MockFactory>, bits: &[bool]) -> Arc<MockPin> {
        let miso = factory.mock_pin(MISO).unwrap();
        let watcher = factory.mock_pin(20).unwrap();
        factory.connected_pin(CLOCK, &watcher).unwrap();

        let pattern = Arc::new(Mutex::new(bits.iter().copied().collect::<VecDeque<_>>()));
        let target = Arc::clone(&miso);
        let callback: ChangedCallback = Arc::new(move |_, high| {
            if !high {
                return;
            }
            let next = lock(&pattern).pop_front().unwrap_or(false);
            let _ = if next { target.drive_high() } else { target.drive_low() };
        });
        watcher.set_when_changed(Some(callback)).unwrap();
        miso
    }

    #[test_case(false, 0xB2; "msb first")]
    #[test_case(true, 0x4D; "lsb first")]
    fn test_mode0_without_mosi_samples_miso(lsb_first: bool, expected: u32) {
        let factory = MockFactory::new();
        patterned(&factory, &[true, false, true, true, false, false, true, false]);
        let dyn_factory: Arc<dyn PinFactory> = factory.clone();
        let spi = SpiInterface::builder(CLOCK, SELECT)
            .miso(MISO)
            .lsb_first(lsb_first)
            .pin_factory(dyn_factory)
            .build()
            .unwrap();

        assert_eq!(spi.transfer(&[0x00]).unwrap(), vec![expected]);
        // Active-low select: idle high, asserted for the transfer only
        factory
            .mock_pin(SELECT)
            .unwrap()
            .assert_states(&[0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_select_high() {
        let (factory, _miso) = loopback();
        let spi = interface(&factory).select_high(true).build().unwrap();
        let select = factory.mock_pin(SELECT).unwrap();
        spi.write(&[1]).unwrap();
        select.assert_states(&[0.0, 1.0, 0.0]);

        spi.set_select_high(false).unwrap();
        assert_eq!(select.state().unwrap(), 1.0);
        assert!(!spi.select_high());
    }

    #[test]
    fn test_bad_arguments() {
        let factory: Arc<dyn PinFactory> = MockFactory::new();
        let builder = || SpiInterface::builder(CLOCK, SELECT).pin_factory(Arc::clone(&factory));

        assert!(matches!(builder().build(), Err(GpioError::SpiBadArgs(_))));
        assert!(matches!(
            builder().mosi(MOSI).clock_mode(4).build(),
            Err(GpioError::SpiInvalidClockMode(4))
        ));
        assert!(matches!(
            builder().mosi(MOSI).bits_per_word(0).build(),
            Err(GpioError::SpiInvalidWordSize(0))
        ));
        assert!(matches!(
            builder().mosi(MOSI).bits_per_word(33).build(),
            Err(GpioError::SpiInvalidWordSize(33))
        ));
        assert!(matches!(
            builder().mosi(SELECT).build(),
            Err(GpioError::SpiBadArgs(_))
        ));
        // Nothing stayed reserved
        assert!(!factory.core().is_reserved(CLOCK));

        let spi = builder().mosi(MOSI).build().unwrap();
        assert!(matches!(
            spi.transfer(&[0x100]),
            Err(GpioError::SpiBadWord { word: 0x100, bits: 8 })
        ));
        assert!(matches!(spi.set_clock_mode(7), Err(GpioError::SpiInvalidClockMode(7))));
        spi.set_clock_mode(3).unwrap();
        assert!(spi.clock_polarity() && spi.clock_phase());
    }

    #[test]
    fn test_setters_fail_after_close() {
        let (factory, _miso) = loopback();
        let spi = interface(&factory).build().unwrap();
        spi.set_lsb_first(true).unwrap();
        spi.close();

        assert!(matches!(spi.set_clock_mode(1), Err(GpioError::DeviceClosed(_))));
        assert!(matches!(spi.set_bits_per_word(12), Err(GpioError::DeviceClosed(_))));
        assert!(matches!(spi.set_lsb_first(false), Err(GpioError::DeviceClosed(_))));
        assert!(matches!(spi.set_select_high(true), Err(GpioError::DeviceClosed(_))));
        assert!(matches!(spi.transfer(&[1]), Err(GpioError::DeviceClosed(_))));
        // Settings are left as they were
        assert_eq!(spi.clock_mode(), 0);
        assert_eq!(spi.bits_per_word(), 8);
        assert!(spi.lsb_first());
    }

    #[test]
    fn test_interfaces_share_one_bus() {
        let (factory, _miso) = loopback();
        let dyn_factory: Arc<dyn PinFactory> = factory.clone();
        let a = interface(&factory).build().unwrap();
        let b = SpiInterface::builder(CLOCK, 7)
            .mosi(MOSI)
            .miso(MISO)
            .clock_mode(2)
            .pin_factory(Arc::clone(&dyn_factory))
            .build()
            .unwrap();
        assert!(Arc::ptr_eq(&a.bus().unwrap(), &b.bus().unwrap()));
        assert_eq!(a.transfer(&[0x3C]).unwrap(), vec![0x3C]);
        assert_eq!(b.transfer(&[0xC3]).unwrap(), vec![0xC3]);

        // Same clock, different data pins: the clock is taken
        let other = SpiInterface::builder(CLOCK, 6)
            .miso(5)
            .pin_factory(Arc::clone(&dyn_factory))
            .build();
        assert!(matches!(other, Err(GpioError::PinInUse { pin: CLOCK, .. })));

        a.close();
        assert!(dyn_factory.core().is_reserved(CLOCK));
        assert!(matches!(a.read(1), Err(GpioError::DeviceClosed(_))));
        drop(b);
        assert!(!dyn_factory.core().is_reserved(CLOCK));
        assert!(!dyn_factory.core().is_reserved(SELECT));
    }

    #[test]
    fn test_concurrent_transfers_do_not_interleave() {
        let (factory, _miso) = loopback();
        let a = interface(&factory).build().unwrap();
        let b = SpiInterface::builder(CLOCK, 7)
            .mosi(MOSI)
            .miso(MISO)
            .pin_factory(factory.clone())
            .build()
            .unwrap();

        thread::scope(|s| {
            s.spawn(|| {
                for _ in 0..20 {
                    assert_eq!(a.transfer(&[0xAA, 0x55]).unwrap(), vec![0xAA, 0x55]);
                }
            });
            s.spawn(|| {
                for _ in 0..20 {
                    assert_eq!(b.transfer(&[0x0F, 0xF0]).unwrap(), vec![0x0F, 0xF0]);
                }
            });
        });
    }
}
