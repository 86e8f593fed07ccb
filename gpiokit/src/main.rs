//! Demo: blink an LED on the configured pin factory.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use gpiokit::config::{BlinkDemoConfig, Config};
use gpiokit::tracing::{self, prelude::*};
use gpiokit::{Device, Led, PinFactory};

fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let config = Config::from_env();
    let demo = BlinkDemoConfig::from_env();
    info!(
        factory = %config.pin_factory,
        pin = demo.pin,
        count = demo.count,
        "Starting blink demo"
    );

    // Keep a typed handle on the mock so its history can be reported
    let mock = (config.pin_factory == "mock").then(|| config.build_mock());
    let factory: Arc<dyn PinFactory> = match &mock {
        Some(mock) => mock.clone(),
        None => config
            .build_factory()
            .context("Failed to create pin factory")?,
    };
    gpiokit::set_pin_factory(Some(factory));

    let led = Led::builder(demo.pin)
        .build()
        .with_context(|| format!("Failed to open LED on GPIO{}", demo.pin))?;
    led.blink(demo.on_time, demo.off_time, Some(demo.count), false)?;
    info!(led = %led.describe(), "Blink finished");

    if let Some(mock) = &mock {
        for (i, change) in mock.mock_pin(demo.pin)?.history().iter().enumerate() {
            info!(
                step = i,
                after_ms = change.timestamp.as_millis() as u64,
                state = change.state,
                "Recorded transition"
            );
        }
    }
    led.close();

    let stuck = gpiokit::shutdown(Duration::from_secs(1));
    if stuck > 0 {
        warn!(stuck, "Some background tasks did not stop");
    }
    Ok(())
}
