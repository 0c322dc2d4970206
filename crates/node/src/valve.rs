//! Valve relay output. The `gpio` feature gates the real rppal driver;
//! without it, a mock relay logs writes.
//!
//! The control loop rewrites the relay every tick, so `set` must be safe to
//! call repeatedly with the same value.

use anyhow::Result;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

/// Anything the decision engine can open and close.
pub trait ValveOutput {
    fn set(&mut self, open: bool);
}

// ---------------------------------------------------------------------------
// Real GPIO relay (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct ValveRelay {
    pin: OutputPin,
    active_low: bool, // LOW = open on the usual relay boards
}

#[cfg(feature = "gpio")]
impl ValveRelay {
    pub(crate) fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().context("failed to open gpio")?;
        let pin = gpio
            .get(gpio_pin)
            .with_context(|| format!("failed to claim gpio {gpio_pin}"))?
            .into_output();

        let mut relay = Self { pin, active_low };
        // Fail-safe: closed at startup
        relay.set(false);
        tracing::info!(gpio = gpio_pin, active_low, "valve relay initialised");
        Ok(relay)
    }
}

#[cfg(feature = "gpio")]
impl ValveOutput for ValveRelay {
    fn set(&mut self, open: bool) {
        // Writing the level the pin already has is harmless.
        if open == self.active_low {
            self.pin.set_low();
        } else {
            self.pin.set_high();
        }
        tracing::trace!(open, "valve written");
    }
}

// ---------------------------------------------------------------------------
// Mock relay (no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct ValveRelay {
    pub(super) open: bool,
    pub(super) writes: u64,
}

#[cfg(not(feature = "gpio"))]
impl ValveRelay {
    pub(crate) fn new(gpio_pin: u8, active_low: bool) -> Result<Self> {
        tracing::info!(
            gpio = gpio_pin,
            active_low,
            "[mock-gpio] valve relay initialised (no hardware)"
        );
        Ok(Self {
            open: false,
            writes: 0,
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl ValveOutput for ValveRelay {
    fn set(&mut self, open: bool) {
        if open != self.open {
            tracing::info!(
                "[mock-gpio] valve {}",
                if open { "OPEN" } else { "CLOSED" }
            );
        }
        self.open = open;
        self.writes += 1;
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;

    #[test]
    fn relay_starts_closed() {
        let relay = ValveRelay::new(17, true).unwrap();
        assert!(!relay.open);
        assert_eq!(relay.writes, 0);
    }

    #[test]
    fn relay_opens_and_closes() {
        let mut relay = ValveRelay::new(17, true).unwrap();
        relay.set(true);
        assert!(relay.open);
        relay.set(false);
        assert!(!relay.open);
    }

    #[test]
    fn repeated_writes_are_idempotent() {
        let mut relay = ValveRelay::new(17, true).unwrap();
        for _ in 0..10 {
            relay.set(true);
        }
        assert!(relay.open);
        assert_eq!(relay.writes, 10);
    }
}
