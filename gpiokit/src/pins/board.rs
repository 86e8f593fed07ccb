//! Board metadata: GPIO count, fixed pulls and header pin names.

use std::collections::{HashMap, HashSet};
use std::fmt;

/// What a factory knows about the board it drives.
pub trait BoardInfo: Send + Sync + fmt::Debug {
    /// Human-readable board revision.
    fn revision(&self) -> &str;

    /// Number of GPIOs, if known. Numbers at or above this are rejected.
    fn gpio_count(&self) -> Option<u32>;

    /// True if `gpio` has a physical pull-up that cannot be changed.
    fn pulled_up(&self, gpio: u32) -> bool;

    /// Map a header name such as `"J8:11"` or `"BOARD11"` to a GPIO number.
    fn resolve_name(&self, name: &str) -> Option<u32>;
}

/// Table-driven [`BoardInfo`].
#[derive(Debug, Clone, Default)]
pub struct StaticBoardInfo {
    revision: String,
    gpio_count: Option<u32>,
    pulled_up: HashSet<u32>,
    // header name (upper case) -> physical pin -> GPIO
    headers: HashMap<String, HashMap<u32, u32>>,
}

impl StaticBoardInfo {
    pub fn new(revision: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            ..Default::default()
        }
    }

    pub fn with_gpio_count(mut self, count: u32) -> Self {
        self.gpio_count = Some(count);
        self
    }

    pub fn with_pulled_up(mut self, gpios: impl IntoIterator<Item = u32>) -> Self {
        self.pulled_up.extend(gpios);
        self
    }

    /// Add a header whose physical pin `p` carries GPIO `g` for each `(p, g)`.
    pub fn with_header(
        mut self,
        name: &str,
        pins: impl IntoIterator<Item = (u32, u32)>,
    ) -> Self {
        self.headers
            .entry(name.to_ascii_uppercase())
            .or_default()
            .extend(pins);
        self
    }

    /// 40-pin Raspberry Pi header layout.
    ///
    /// GPIO2 and GPIO3 (I2C) carry fixed 1.8k pull-ups.
    pub fn raspberry_pi() -> Self {
        const J8: [(u32, u32); 28] = [
            (3, 2),
            (5, 3),
            (7, 4),
            (8, 14),
            (10, 15),
            (11, 17),
            (12, 18),
            (13, 27),
            (15, 22),
            (16, 23),
            (18, 24),
            (19, 10),
            (21, 9),
            (22, 25),
            (23, 11),
            (24, 8),
            (26, 7),
            (27, 0),
            (28, 1),
            (29, 5),
            (31, 6),
            (32, 12),
            (33, 13),
            (35, 19),
            (36, 16),
            (37, 26),
            (38, 20),
            (40, 21),
        ];

        Self::new("Raspberry Pi 40-pin")
            .with_gpio_count(28)
            .with_pulled_up([2, 3])
            .with_header("J8", J8)
            .with_header("BOARD", J8)
    }
}

impl BoardInfo for StaticBoardInfo {
    fn revision(&self) -> &str {
        &self.revision
    }

    fn gpio_count(&self) -> Option<u32> {
        self.gpio_count
    }

    fn pulled_up(&self, gpio: u32) -> bool {
        self.pulled_up.contains(&gpio)
    }

    fn resolve_name(&self, name: &str) -> Option<u32> {
        let upper = name.trim().to_ascii_uppercase();

        // "J8:11"
        if let Some((header, pin)) = upper.split_once(':') {
            let pin = pin.parse::<u32>().ok()?;
            return self.headers.get(header)?.get(&pin).copied();
        }

        // "BOARD11"
        self.headers.iter().find_map(|(header, pins)| {
            let pin = upper.strip_prefix(header.as_str())?.parse::<u32>().ok()?;
            pins.get(&pin).copied()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("J8:11", Some(17); "j8_colon")]
    #[test_case("j8:3", Some(2); "lowercase")]
    #[test_case("BOARD40", Some(21); "board_prefix")]
    #[test_case("J8:1", None; "power_pin")]
    #[test_case("J8:99", None; "no_such_pin")]
    #[test_case("P1:11", None; "unknown_header")]
    fn test_resolve_name(name: &str, expected: Option<u32>) {
        let board = StaticBoardInfo::raspberry_pi();
        assert_eq!(board.resolve_name(name), expected);
    }

    #[test]
    fn test_raspberry_pi_metadata() {
        let board = StaticBoardInfo::raspberry_pi();
        assert_eq!(board.gpio_count(), Some(28));
        assert!(board.pulled_up(2));
        assert!(board.pulled_up(3));
        assert!(!board.pulled_up(4));
    }
}
