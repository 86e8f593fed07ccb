//! Configuration from environment variables.
//!
//! The default pin factory is built from [`Config::from_env`] the first
//! time a device is created without an explicit factory.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GpioError, Result};
use crate::pins::mock::MockFactory;
use crate::pins::sysfs::{SysfsFactory, DEFAULT_ROOT};
use crate::pins::PinFactory;
use crate::tracing::prelude::*;

/// Default sysfs edge polling interval in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1;

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T
where
    T: std::fmt::Display + Copy,
{
    match std::env::var(name) {
        Ok(val) => match val.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(value = %val, default = %default, "Invalid {}, using default", name);
                default
            }
        },
        Err(_) => default,
    }
}

/// Pin backend selection.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Backend name: `mock` or `sysfs`.
    pub pin_factory: String,

    /// Root of the sysfs GPIO tree.
    pub sysfs_root: PathBuf,

    /// How often the sysfs backend polls inputs with edge callbacks.
    pub poll_interval: Duration,

    /// Whether mock pins support PWM.
    pub mock_pwm: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pin_factory: "mock".to_string(),
            sysfs_root: PathBuf::from(DEFAULT_ROOT),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            mock_pwm: false,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `GPIOKIT_PIN_FACTORY`: `mock` (default) or `sysfs`
    /// - `GPIOKIT_SYSFS_ROOT`: sysfs GPIO root (default: `/sys/class/gpio`)
    /// - `GPIOKIT_POLL_INTERVAL_MS`: edge polling interval (default: 1,
    ///   clamped to 1-1000)
    /// - `GPIOKIT_MOCK_PWM`: `1`/`true` for PWM-capable mock pins
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let pin_factory = std::env::var("GPIOKIT_PIN_FACTORY")
            .map(|s| s.trim().to_ascii_lowercase())
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.pin_factory);

        let sysfs_root = std::env::var_os("GPIOKIT_SYSFS_ROOT")
            .map(PathBuf::from)
            .unwrap_or(defaults.sysfs_root);

        let poll_ms = env_number("GPIOKIT_POLL_INTERVAL_MS", DEFAULT_POLL_INTERVAL_MS).clamp(1, 1000);

        Self {
            pin_factory,
            sysfs_root,
            poll_interval: Duration::from_millis(poll_ms),
            mock_pwm: env_flag("GPIOKIT_MOCK_PWM"),
        }
    }

    /// Create the configured pin factory.
    pub fn build_factory(&self) -> Result<Arc<dyn PinFactory>> {
        match self.pin_factory.as_str() {
            "mock" => Ok(self.build_mock()),
            "sysfs" => Ok(Arc::new(SysfsFactory::new(
                self.sysfs_root.clone(),
                self.poll_interval,
            ))),
            other => Err(GpioError::BadPinFactory(other.to_string())),
        }
    }

    /// A mock factory with the configured PWM support, whatever backend
    /// is selected.
    pub fn build_mock(&self) -> Arc<MockFactory> {
        if self.mock_pwm {
            MockFactory::with_pwm()
        } else {
            MockFactory::new()
        }
    }
}

/// Settings of the `gpiokit` demo binary.
#[derive(Debug, Clone, PartialEq)]
pub struct BlinkDemoConfig {
    pub pin: u32,
    pub count: usize,
    pub on_time: Duration,
    pub off_time: Duration,
}

impl BlinkDemoConfig {
    /// # Environment Variables
    ///
    /// - `GPIOKIT_BLINK_PIN`: GPIO number (default: 17)
    /// - `GPIOKIT_BLINK_COUNT`: blinks before exiting (default: 3)
    /// - `GPIOKIT_BLINK_ON_MS` / `GPIOKIT_BLINK_OFF_MS`: (default: 500)
    pub fn from_env() -> Self {
        Self {
            pin: env_number("GPIOKIT_BLINK_PIN", 17),
            count: env_number("GPIOKIT_BLINK_COUNT", 3),
            on_time: Duration::from_millis(env_number("GPIOKIT_BLINK_ON_MS", 500)),
            off_time: Duration::from_millis(env_number("GPIOKIT_BLINK_OFF_MS", 500)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pins::{PinFunction, PinSpec};
    use serial_test::serial;

    const VARS: [&str; 8] = [
        "GPIOKIT_PIN_FACTORY",
        "GPIOKIT_SYSFS_ROOT",
        "GPIOKIT_POLL_INTERVAL_MS",
        "GPIOKIT_MOCK_PWM",
        "GPIOKIT_BLINK_PIN",
        "GPIOKIT_BLINK_COUNT",
        "GPIOKIT_BLINK_ON_MS",
        "GPIOKIT_BLINK_OFF_MS",
    ];

    fn clear_env() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_not_set() {
        clear_env();
        let config = Config::from_env();
        assert_eq!(config, Config::default());
        assert_eq!(config.build_factory().unwrap().name(), "mock");
    }

    #[test]
    #[serial]
    fn test_sysfs_selection() {
        clear_env();
        let tmp = tempfile::tempdir().unwrap();
        std::env::set_var("GPIOKIT_PIN_FACTORY", " SysFS ");
        std::env::set_var("GPIOKIT_SYSFS_ROOT", tmp.path());
        std::env::set_var("GPIOKIT_POLL_INTERVAL_MS", "5");

        let config = Config::from_env();
        assert_eq!(config.pin_factory, "sysfs");
        assert_eq!(config.sysfs_root, tmp.path());
        assert_eq!(config.poll_interval, Duration::from_millis(5));
        assert_eq!(config.build_factory().unwrap().name(), "sysfs");
        clear_env();
    }

    #[test]
    #[serial]
    fn test_poll_interval_clamped_and_invalid() {
        clear_env();
        std::env::set_var("GPIOKIT_POLL_INTERVAL_MS", "0");
        assert_eq!(Config::from_env().poll_interval, Duration::from_millis(1));

        std::env::set_var("GPIOKIT_POLL_INTERVAL_MS", "5000");
        assert_eq!(Config::from_env().poll_interval, Duration::from_millis(1000));

        std::env::set_var("GPIOKIT_POLL_INTERVAL_MS", "fast");
        assert_eq!(
            Config::from_env().poll_interval,
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unknown_factory_rejected() {
        clear_env();
        std::env::set_var("GPIOKIT_PIN_FACTORY", "rpigpio");
        let err = Config::from_env().build_factory().unwrap_err();
        assert!(matches!(err, GpioError::BadPinFactory(ref name) if name == "rpigpio"));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_mock_pwm_flag() {
        clear_env();
        std::env::set_var("GPIOKIT_MOCK_PWM", "true");
        let factory = Config::from_env().build_factory().unwrap();
        let pin = factory.pin(&PinSpec::Number(4)).unwrap();
        pin.set_function(PinFunction::Output).unwrap();
        pin.set_frequency(Some(100.0)).unwrap();
        assert_eq!(pin.frequency(), Some(100.0));
        clear_env();
    }

    #[test]
    #[serial]
    fn test_blink_demo_settings() {
        clear_env();
        assert_eq!(
            BlinkDemoConfig::from_env(),
            BlinkDemoConfig {
                pin: 17,
                count: 3,
                on_time: Duration::from_millis(500),
                off_time: Duration::from_millis(500),
            }
        );

        std::env::set_var("GPIOKIT_BLINK_PIN", "4");
        std::env::set_var("GPIOKIT_BLINK_COUNT", "10");
        std::env::set_var("GPIOKIT_BLINK_ON_MS", "bogus");
        let config = BlinkDemoConfig::from_env();
        assert_eq!(config.pin, 4);
        assert_eq!(config.count, 10);
        assert_eq!(config.on_time, Duration::from_millis(500));
        clear_env();
    }
}
