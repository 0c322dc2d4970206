//! Simulated greenhouse for development without hardware.
//!
//! - Soil moisture: random walk on the raw analog scale with mean reversion,
//!   a steady drying drift and a wetting response while the valve is open.
//! - Climate: slow sinusoidal day cycle plus noise; the sensor occasionally
//!   fails outright or returns NaN, like a real DHT22 on a long wire.

use std::fmt;

use anyhow::bail;

use crate::sensor::{Climate, ClimateProbe, MoistureProbe, RAW_MAX};

// ---------------------------------------------------------------------------
// Gaussian approximation (no extra dependency)
// ---------------------------------------------------------------------------

/// Irwin-Hall: sum of 12 uniform [0,1) values minus 6.
fn approx_std_normal() -> f64 {
    let mut sum: f64 = 0.0;
    for _ in 0..12 {
        sum += fastrand::f64();
    }
    sum - 6.0
}

fn gaussian(mean: f64, sigma: f64) -> f64 {
    mean + sigma * approx_std_normal()
}

// ---------------------------------------------------------------------------
// Scenario presets
// ---------------------------------------------------------------------------

/// Simulation profiles selectable via `SIM_SCENARIO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// Starts mid-range and dries steadily; Auto mode will start watering.
    Drying,
    /// Hovers near the middle with little noise.
    Stable,
    /// Noisy moisture and a climate sensor that fails one read in five.
    Flaky,
    /// Starts wet and dries slowly.
    Wet,
}

impl Scenario {
    pub fn from_str_lossy(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "stable" => Self::Stable,
            "flaky" => Self::Flaky,
            "wet" => Self::Wet,
            _ => Self::Drying,
        }
    }

    /// (drift, walk sigma, start fraction toward dry, climate fault rate)
    fn params(self) -> (f64, f64, f64, f32) {
        match self {
            Self::Drying => (1.5, 4.0, 0.5, 0.02),
            Self::Stable => (0.1, 1.5, 0.5, 0.0),
            Self::Flaky => (1.0, 12.0, 0.5, 0.20),
            Self::Wet => (0.3, 3.0, 0.15, 0.02),
        }
    }
}

impl fmt::Display for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Drying => write!(f, "drying"),
            Self::Stable => write!(f, "stable"),
            Self::Flaky => write!(f, "flaky"),
            Self::Wet => write!(f, "wet"),
        }
    }
}

// ---------------------------------------------------------------------------
// Moisture
// ---------------------------------------------------------------------------

pub struct SimMoisture {
    /// Current raw count; higher is drier.
    raw: f64,
    drift: f64,
    walk_sigma: f64,
    mean_reversion: f64,
    center: f64,
    watering: bool,
    wet_rate: f64,
}

impl SimMoisture {
    pub fn new(scenario: Scenario) -> Self {
        let (drift, walk_sigma, start_frac, _) = scenario.params();
        let max = f64::from(RAW_MAX);
        Self {
            raw: (start_frac * max + gaussian(0.0, max * 0.02)).clamp(0.0, max),
            drift,
            walk_sigma,
            mean_reversion: 0.005,
            center: max * 0.6,
            watering: false,
            wet_rate: -12.0,
        }
    }
}

impl MoistureProbe for SimMoisture {
    fn read_raw(&mut self) -> u16 {
        let pull = self.mean_reversion * (self.center - self.raw);
        let walk = gaussian(0.0, self.walk_sigma);
        let wet = if self.watering { self.wet_rate } else { 0.0 };

        self.raw = (self.raw + self.drift + pull + walk + wet).clamp(0.0, f64::from(RAW_MAX));
        self.raw.round() as u16
    }

    fn notify_valve(&mut self, open: bool) {
        self.watering = open;
    }
}

// ---------------------------------------------------------------------------
// Climate
// ---------------------------------------------------------------------------

pub struct SimClimate {
    fault_rate: f32,
    /// Seconds per simulated day.
    day_period_s: f64,
}

impl SimClimate {
    pub fn new(scenario: Scenario, day_period_s: f64) -> Self {
        let (_, _, _, fault_rate) = scenario.params();
        Self {
            fault_rate,
            day_period_s,
        }
    }
}

impl ClimateProbe for SimClimate {
    fn read(&mut self) -> anyhow::Result<Climate> {
        if fastrand::f32() < self.fault_rate {
            // Half the faults look like a timeout, half like a garbled frame.
            if fastrand::bool() {
                bail!("no response from climate sensor");
            }
            return Ok(Climate {
                temperature_c: f32::NAN,
                humidity_percent: f32::NAN,
            });
        }

        let now_s = time::OffsetDateTime::now_utc().unix_timestamp() as f64;
        let phase = (2.0 * std::f64::consts::PI * now_s / self.day_period_s).sin();

        let temperature = 22.0 + 6.0 * phase + gaussian(0.0, 0.2);
        // Humidity falls as the greenhouse warms up.
        let humidity = (65.0 - 15.0 * phase + gaussian(0.0, 1.0)).clamp(0.0, 100.0);

        Ok(Climate {
            temperature_c: temperature as f32,
            humidity_percent: humidity as f32,
        })
    }
}

// ===========================================================================
// Tests
// ===========================================================================
