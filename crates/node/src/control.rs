//! Irrigation decision engine and the control state it runs on.
//!
//! Decisions are level-triggered: every tick recomputes the valve state from
//! scratch out of (mode, moisture, threshold). There is no memory of the
//! previous decision.
//!
//! ```text
//! Manual ───────────────────────────────▶ valve OPEN
//! Auto   ──[moisture <  threshold]──────▶ valve OPEN
//! Auto   ──[moisture >= threshold]──────▶ valve CLOSED
//! ```

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::sensor::SensorSample;

pub const DEFAULT_THRESHOLD: u8 = 50;

// ---------------------------------------------------------------------------
// Operating mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    #[default]
    Auto,
    Manual,
}

impl OperatingMode {
    pub fn toggled(self) -> Self {
        match self {
            Self::Auto => Self::Manual,
            Self::Manual => Self::Auto,
        }
    }

    /// Colour token pushed to the mode button and status indicator widgets.
    pub fn color(self) -> &'static str {
        match self {
            Self::Auto => "#23C48E",
            Self::Manual => "#D3435C",
        }
    }
}

// ---------------------------------------------------------------------------
// Threshold
// ---------------------------------------------------------------------------

/// Moisture percent below which Auto mode opens the valve. Always 0–100.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Threshold(u8);

impl Threshold {
    /// Clamp an arbitrary command value into range. The flag reports whether
    /// clamping happened.
    pub fn clamped(value: i64) -> (Self, bool) {
        let v = value.clamp(0, 100);
        (Self(v as u8), v != value)
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

impl Default for Threshold {
    fn default() -> Self {
        Self(DEFAULT_THRESHOLD)
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// Inbound remote commands, already parsed off the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    SetThreshold(i64),
    ToggleMode,
}

// ---------------------------------------------------------------------------
// Actuator state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActuatorState {
    pub valve_open: bool,
    pub indicator_on: bool,
}

impl ActuatorState {
    /// The status indicator always mirrors the valve.
    pub fn valve(open: bool) -> Self {
        Self {
            valve_open: open,
            indicator_on: open,
        }
    }
}

/// Compute the desired outputs. Equal moisture and threshold keeps the valve
/// closed.
pub fn decide(mode: OperatingMode, moisture_percent: u8, threshold: Threshold) -> ActuatorState {
    match mode {
        OperatingMode::Manual => ActuatorState::valve(true),
        OperatingMode::Auto => ActuatorState::valve(moisture_percent < threshold.get()),
    }
}

// ---------------------------------------------------------------------------
// Control state
// ---------------------------------------------------------------------------

/// Everything the control loop owns: the two command-mutated settings, the
/// latest sample, and the outputs last written.
#[derive(Debug, Clone, Default)]
pub struct ControlState {
    threshold: Threshold,
    mode: OperatingMode,
    sample: Option<SensorSample>,
    actuators: ActuatorState,
}

impl ControlState {
    pub fn new(threshold: Threshold) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    pub fn threshold(&self) -> Threshold {
        self.threshold
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn sample(&self) -> Option<&SensorSample> {
        self.sample.as_ref()
    }

    pub fn actuators(&self) -> ActuatorState {
        self.actuators
    }

    /// Overwrite the threshold, clamping out-of-range input.
    pub fn set_threshold(&mut self, value: i64) -> Threshold {
        let (threshold, clamped) = Threshold::clamped(value);
        if clamped {
            warn!(
                requested = value,
                applied = threshold.get(),
                "threshold out of range, clamped"
            );
        }
        info!(from = self.threshold.get(), to = threshold.get(), "threshold set");
        self.threshold = threshold;
        threshold
    }

    pub fn toggle_mode(&mut self) -> OperatingMode {
        self.mode = self.mode.toggled();
        info!(mode = ?self.mode, "mode toggled");
        self.mode
    }

    pub fn record_sample(&mut self, sample: SensorSample) {
        self.sample = Some(sample);
    }

    /// Run the decision against the latest sample. Without a sample only
    /// Manual mode can open the valve; Auto treats it as "no reason to water".
    pub fn evaluate(&mut self) -> ActuatorState {
        self.actuators = match self.sample {
            Some(s) => decide(self.mode, s.moisture_percent, self.threshold),
            None if self.mode == OperatingMode::Manual => ActuatorState::valve(true),
            None => ActuatorState::valve(false),
        };
        self.actuators
    }
}

// ===========================================================================
// Tests
// ===========================================================================
