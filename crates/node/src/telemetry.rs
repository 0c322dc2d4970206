//! Outbound dashboard telemetry: one scalar per publish, fire-and-forget.
//!
//! Transport failures are logged and counted but never surface to the
//! control loop.

use std::fmt;

use tracing::warn;

use crate::control::OperatingMode;
use crate::sensor::Climate;

/// Accepts one outbound message. Must not block.
pub trait Publish {
    fn publish(&mut self, topic: String, payload: String, retain: bool) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Channels
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Temperature,
    Humidity,
    Moisture,
    Threshold,
    Indicator,
    ModeButtonColor,
    IndicatorColor,
}

impl Channel {
    fn suffix(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Moisture => "moisture",
            Self::Threshold => "threshold",
            Self::Indicator => "indicator",
            Self::ModeButtonColor => "mode/color",
            Self::IndicatorColor => "indicator/color",
        }
    }

    /// Widget properties are retained so a dashboard that connects later
    /// still renders the current mode.
    fn retained(self) -> bool {
        matches!(self, Self::ModeButtonColor | Self::IndicatorColor)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.suffix())
    }
}

/// "tele/<node_id>/<channel>"
pub fn topic(node_id: &str, channel: Channel) -> String {
    format!("tele/{node_id}/{}", channel.suffix())
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

pub struct TelemetryPublisher<P> {
    sink: P,
    node_id: String,
    failures: u64,
}

impl<P: Publish> TelemetryPublisher<P> {
    pub fn new(sink: P, node_id: impl Into<String>) -> Self {
        Self {
            sink,
            node_id: node_id.into(),
            failures: 0,
        }
    }

    pub fn publish(&mut self, channel: Channel, value: impl fmt::Display) {
        let topic = topic(&self.node_id, channel);
        if let Err(e) = self
            .sink
            .publish(topic, value.to_string(), channel.retained())
        {
            self.failures += 1;
            warn!(%channel, failures = self.failures, "telemetry publish dropped: {e}");
        }
    }

    pub fn climate(&mut self, c: &Climate) {
        self.publish(Channel::Temperature, format_args!("{:.1}", c.temperature_c));
        self.publish(Channel::Humidity, format_args!("{:.1}", c.humidity_percent));
    }

    pub fn moisture(&mut self, percent: u8) {
        self.publish(Channel::Moisture, percent);
    }

    pub fn threshold(&mut self, value: u8) {
        self.publish(Channel::Threshold, value);
    }

    pub fn indicator(&mut self, on: bool) {
        self.publish(Channel::Indicator, u8::from(on));
    }

    /// Both widgets take the colour of the new mode.
    pub fn mode_colors(&mut self, mode: OperatingMode) {
        self.publish(Channel::ModeButtonColor, mode.color());
        self.publish(Channel::IndicatorColor, mode.color());
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    #[cfg(test)]
    pub(crate) fn sink(&self) -> &P {
        &self.sink
    }
}

// ===========================================================================
// Tests
// ===========================================================================
