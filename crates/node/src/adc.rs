//! ADS1115 moisture probe over I2C.
//!
//! Reads one single-ended channel at PGA ±4.096 V, 128 SPS, single-shot, and
//! rescales the 15-bit result onto the 0–1024 analog range the moisture
//! scaling expects.
#![cfg_attr(not(feature = "adc"), allow(dead_code, unused_imports))]

use std::{thread, time::Duration};

use crate::sensor::RAW_MAX;

/// Conversion result register (read-only, 16-bit signed).
const REG_CONVERSION: u8 = 0x00;
/// Configuration register (read/write).
const REG_CONFIG: u8 = 0x01;

/// OS=1 (start), PGA=001 (±4.096 V), MODE=1 (single-shot),
/// DR=100 (128 SPS), COMP_QUE=11 (comparator off).
const CONFIG_BASE: u16 = 0b1_000_001_1_100_0_0_0_11;

/// Single-ended MUX codes, AIN0..AIN3 vs GND.
const MUX_SHIFT: u8 = 12;
const MUX_SINGLE_ENDED: [u16; 4] = [0b100, 0b101, 0b110, 0b111];

pub const MAX_CHANNEL: usize = 3;
const FULL_SCALE: u32 = 32767;

/// ~7.8 ms at 128 SPS.
const CONVERSION_WAIT: Duration = Duration::from_millis(9);

fn config_for_channel(channel: usize) -> u16 {
    CONFIG_BASE | (MUX_SINGLE_ENDED[channel] << MUX_SHIFT)
}

/// Map a signed conversion result onto 0..=RAW_MAX. Negative noise near
/// ground reads as 0.
fn rescale(conversion: i16) -> u16 {
    let v = u32::from(conversion.max(0).unsigned_abs());
    (v * u32::from(RAW_MAX) / FULL_SCALE) as u16
}

#[cfg(feature = "adc")]
pub use driver::Ads1115Moisture;

#[cfg(feature = "adc")]
mod driver {
    use anyhow::Context;
    use rppal::i2c::I2c;

    use super::*;
    use crate::sensor::MoistureProbe;

    pub struct Ads1115Moisture {
        i2c: I2c,
        channel: usize,
        /// Returned when a bus transfer fails; the analog path has no error
        /// channel of its own.
        last: u16,
    }

    impl Ads1115Moisture {
        pub fn new(addr: u16, channel: usize) -> anyhow::Result<Self> {
            anyhow::ensure!(
                channel <= MAX_CHANNEL,
                "ADS1115 channel {channel} out of range (0–{MAX_CHANNEL})"
            );

            let mut i2c = I2c::new().context("failed to open i2c bus")?;
            i2c.set_slave_address(addr)
                .with_context(|| format!("failed to address ads1115 at 0x{addr:02x}"))?;

            tracing::info!(
                addr = format_args!("0x{addr:02x}"),
                channel,
                "ads1115 moisture probe initialised"
            );

            Ok(Self {
                i2c,
                channel,
                // Dry until proven otherwise: never opens the valve by itself.
                last: RAW_MAX,
            })
        }

        fn convert(&mut self) -> anyhow::Result<i16> {
            self.i2c
                .block_write(REG_CONFIG, &config_for_channel(self.channel).to_be_bytes())?;
            thread::sleep(CONVERSION_WAIT);

            let mut buf = [0u8; 2];
            self.i2c.block_read(REG_CONVERSION, &mut buf)?;
            Ok(i16::from_be_bytes(buf))
        }
    }

    impl MoistureProbe for Ads1115Moisture {
        fn read_raw(&mut self) -> u16 {
            match self.convert() {
                Ok(v) => self.last = rescale(v),
                Err(e) => tracing::error!(
                    channel = self.channel,
                    stale = self.last,
                    "adc read failed, reusing last value: {e}"
                ),
            }
            self.last
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
