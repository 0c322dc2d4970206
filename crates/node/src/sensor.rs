//! Soil moisture and climate sampling.
//!
//! The analog moisture channel has no failure path: probes always hand back a
//! raw count, which is clamped and inverted onto a 0–100 percent scale. The
//! climate sensor can fail, and a failed read is reported as `None` for
//! temperature and humidity together.

use serde::Serialize;
use tracing::warn;

/// Top of the raw analog range. Raw 0 reads as saturated soil, raw 1024 as
/// bone dry.
pub const RAW_MAX: u16 = 1024;

// ---------------------------------------------------------------------------
// Probe seams
// ---------------------------------------------------------------------------

/// Source of raw analog moisture counts (0–1024).
pub trait MoistureProbe {
    fn read_raw(&mut self) -> u16;

    /// Informs the probe of the valve state just written. Only the simulator
    /// cares; hardware probes ignore it.
    fn notify_valve(&mut self, _open: bool) {}
}

/// Digital temperature + humidity sensor.
pub trait ClimateProbe {
    fn read(&mut self) -> anyhow::Result<Climate>;
}

// ---------------------------------------------------------------------------
// Data
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Climate {
    pub temperature_c: f32,
    pub humidity_percent: f32,
}

impl Climate {
    fn is_numeric(&self) -> bool {
        self.temperature_c.is_finite() && self.humidity_percent.is_finite()
    }
}

/// The most recent view of the greenhouse. `climate` is `None` when the last
/// climate read failed (or none has happened yet).
///
/// Moisture and climate run on different cadences, so each carries the Unix
/// time of the read that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSample {
    pub moisture_percent: u8,
    pub climate: Option<Climate>,
    pub taken_at: i64,
    pub climate_taken_at: Option<i64>,
}

/// Map a raw analog count onto the moisture percent scale, inverted:
/// raw 0 → 100, raw 1024 → 0. Counts above the range clamp to 0.
pub fn moisture_percent(raw: u16) -> u8 {
    let raw = u32::from(raw.min(RAW_MAX));
    (100 - raw * 100 / u32::from(RAW_MAX)) as u8
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct SensorReader {
    moisture: Box<dyn MoistureProbe>,
    climate: Box<dyn ClimateProbe>,
    climate_faults: u64,
}

impl SensorReader {
    pub fn new(moisture: Box<dyn MoistureProbe>, climate: Box<dyn ClimateProbe>) -> Self {
        Self {
            moisture,
            climate,
            climate_faults: 0,
        }
    }

    pub fn read_moisture(&mut self) -> u8 {
        moisture_percent(self.moisture.read_raw())
    }

    /// Read the climate sensor. Failures and non-numeric values are logged
    /// and come back as `None`; they never stop the caller.
    pub fn read_climate(&mut self) -> Option<Climate> {
        match self.climate.read() {
            Ok(c) if c.is_numeric() => Some(c),
            Ok(c) => {
                self.climate_faults += 1;
                warn!(
                    temperature_c = c.temperature_c,
                    humidity_percent = c.humidity_percent,
                    faults = self.climate_faults,
                    "climate sensor returned a non-numeric reading"
                );
                None
            }
            Err(e) => {
                self.climate_faults += 1;
                warn!(faults = self.climate_faults, "climate sensor read failed: {e:#}");
                None
            }
        }
    }

    pub fn notify_valve(&mut self, open: bool) {
        self.moisture.notify_valve(open);
    }

    pub fn climate_faults(&self) -> u64 {
        self.climate_faults
    }
}

// ===========================================================================
// Tests
// ===========================================================================
