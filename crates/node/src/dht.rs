//! DHT22 temperature/humidity sensor on a single GPIO line.
//!
//! A read is a 40-bit frame: humidity ×10 (16 bits), temperature ×10 (15 bits
//! plus a sign bit), and an 8-bit checksum. Bits are pulse-width encoded:
//! after a ~50 µs low, a ~27 µs high is a 0 and a ~70 µs high is a 1.
//! The bit-banged driver lives behind the `gpio` feature.
#![cfg_attr(not(feature = "gpio"), allow(dead_code))]

use anyhow::{bail, Result};

use crate::sensor::Climate;

/// Decode a raw 5-byte frame, verifying the checksum.
pub fn decode_frame(frame: &[u8; 5]) -> Result<Climate> {
    let sum = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != frame[4] {
        bail!(
            "dht22 checksum mismatch (computed 0x{sum:02x}, frame 0x{:02x})",
            frame[4]
        );
    }

    let humidity = u16::from_be_bytes([frame[0], frame[1]]) as f32 / 10.0;
    let magnitude = u16::from_be_bytes([frame[2] & 0x7F, frame[3]]) as f32 / 10.0;
    let temperature = if frame[2] & 0x80 != 0 {
        -magnitude
    } else {
        magnitude
    };

    if humidity > 100.0 {
        bail!("dht22 humidity {humidity} out of range");
    }

    Ok(Climate {
        temperature_c: temperature,
        humidity_percent: humidity,
    })
}

#[cfg(feature = "gpio")]
pub use driver::Dht22;

#[cfg(feature = "gpio")]
mod driver {
    use std::thread;
    use std::time::{Duration, Instant};

    use anyhow::{bail, Context, Result};
    use rppal::gpio::{Bias, Gpio, IoPin, Level, Mode};

    use super::decode_frame;
    use crate::sensor::{Climate, ClimateProbe};

    /// Host start signal: hold the line low at least 1 ms.
    const START_LOW: Duration = Duration::from_micros(1_200);
    /// Longest any single level lasts in a healthy exchange.
    const EDGE_TIMEOUT: Duration = Duration::from_micros(200);
    /// High pulses longer than this are 1 bits.
    const ONE_THRESHOLD: Duration = Duration::from_micros(48);

    pub struct Dht22 {
        pin: IoPin,
    }

    impl Dht22 {
        pub fn new(gpio_pin: u8) -> Result<Self> {
            let mut pin = Gpio::new()
                .context("failed to open gpio")?
                .get(gpio_pin)
                .with_context(|| format!("failed to claim gpio {gpio_pin}"))?
                .into_io(Mode::Input);
            pin.set_bias(Bias::PullUp);
            tracing::info!(gpio = gpio_pin, "dht22 initialised");
            Ok(Self { pin })
        }

        /// Spin until the line reaches `level`; returns how long it took.
        fn wait_for(&self, level: Level) -> Result<Duration> {
            let start = Instant::now();
            while self.pin.read() != level {
                if start.elapsed() > EDGE_TIMEOUT {
                    bail!("dht22 timed out waiting for {level:?}");
                }
            }
            Ok(start.elapsed())
        }

        fn read_frame(&mut self) -> Result<[u8; 5]> {
            self.pin.set_mode(Mode::Output);
            self.pin.set_low();
            thread::sleep(START_LOW);
            self.pin.set_high();
            self.pin.set_mode(Mode::Input);

            // Sensor response: low ~80 µs, high ~80 µs, then the first bit.
            self.wait_for(Level::Low)?;
            self.wait_for(Level::High)?;
            self.wait_for(Level::Low)?;

            let mut frame = [0u8; 5];
            for i in 0..40 {
                self.wait_for(Level::High)?;
                let high = self.wait_for(Level::Low)?;
                frame[i / 8] <<= 1;
                if high > ONE_THRESHOLD {
                    frame[i / 8] |= 1;
                }
            }
            Ok(frame)
        }
    }

    impl ClimateProbe for Dht22 {
        fn read(&mut self) -> Result<Climate> {
            let frame = self.read_frame()?;
            decode_frame(&frame)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
