//! The control loop.
//!
//! One iteration:
//!
//! 1. drain the inbound command queue (threshold / mode toggle);
//! 2. for each periodic task whose interval has elapsed, in fixed order:
//!    sensor read → irrigation decision → telemetry;
//! 3. refresh the status snapshot and sleep for the poll interval.
//!
//! Tasks are elapsed-time checks, not timers: a slow iteration delays every
//! task equally. Threshold and mode are owned by [`Node`] and only touched
//! from this loop, so the command queue alone serializes writes and reads.

use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::control::{ActuatorState, Command, ControlState, Threshold};
use crate::link::LinkStatus;
use crate::sensor::{SensorReader, SensorSample};
use crate::state::{EventKind, SharedStatus};
use crate::telemetry::{Publish, TelemetryPublisher};
use crate::valve::ValveOutput;

// ---------------------------------------------------------------------------
// Periodic task gate
// ---------------------------------------------------------------------------

/// Fires on the first check, then once per `interval` of elapsed time.
#[derive(Debug, Clone)]
pub struct Every {
    interval: Duration,
    last: Option<Instant>,
}

impl Every {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn due(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// What one tick produced; only these values are published.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TickOutput {
    pub moisture: Option<u8>,
    pub climate_read: bool,
    pub climate_ok: bool,
    pub actuators: Option<ActuatorState>,
}

pub struct Node<V, P> {
    state: ControlState,
    sensors: SensorReader,
    valve: V,
    telemetry: TelemetryPublisher<P>,
    control_every: Every,
    climate_every: Every,
    events: Vec<(EventKind, String)>,
}

impl<V: ValveOutput, P: Publish> Node<V, P> {
    pub fn new(
        threshold: Threshold,
        sensors: SensorReader,
        valve: V,
        telemetry: TelemetryPublisher<P>,
        control_interval: Duration,
        climate_interval: Duration,
    ) -> Self {
        Self {
            state: ControlState::new(threshold),
            sensors,
            valve,
            telemetry,
            control_every: Every::new(control_interval),
            climate_every: Every::new(climate_interval),
            events: Vec::new(),
        }
    }

    pub fn state(&self) -> &ControlState {
        &self.state
    }

    /// Close the valve, then announce the starting threshold and mode.
    pub fn start(&mut self) {
        self.valve.set(false);
        self.announce();
        info!(
            threshold = self.state.threshold().get(),
            mode = ?self.state.mode(),
            "control loop starting"
        );
        self.event(EventKind::System, "node started".into());
    }

    /// Push current threshold and mode colours. Sent at startup and again
    /// whenever the broker link comes back, since publishes made while it was
    /// down were dropped.
    pub fn announce(&mut self) {
        self.telemetry.threshold(self.state.threshold().get());
        self.telemetry.mode_colors(self.state.mode());
    }

    /// Fail-safe on the way out.
    pub fn shutdown(&mut self) {
        self.valve.set(false);
        info!("valve closed for shutdown");
    }

    pub fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::SetThreshold(v) => {
                let applied = self.state.set_threshold(v).get();
                self.telemetry.threshold(applied);
                let detail = if i64::from(applied) == v {
                    format!("threshold set to {applied}")
                } else {
                    format!("threshold {v} clamped to {applied}")
                };
                self.event(EventKind::Command, detail);
            }
            Command::ToggleMode => {
                let mode = self.state.toggle_mode();
                self.telemetry.mode_colors(mode);
                self.event(EventKind::Command, format!("mode toggled to {mode:?}"));
            }
        }
    }

    /// Run whichever periodic tasks are due at `now`.
    pub fn tick(&mut self, now: Instant) -> TickOutput {
        let climate_due = self.climate_every.due(now);
        let control_due = self.control_every.due(now);
        let mut out = TickOutput::default();

        // -- 1. Sensors ------------------------------------------------------
        let climate = if climate_due {
            out.climate_read = true;
            let c = self.sensors.read_climate();
            out.climate_ok = c.is_some();
            if c.is_none() {
                self.event(EventKind::Fault, "climate sensor read failed".into());
            }
            Some(c)
        } else {
            None
        };
        if control_due {
            out.moisture = Some(self.sensors.read_moisture());
        }

        let fresh_climate = climate.flatten();

        if climate.is_some() || out.moisture.is_some() {
            let prev = self.state.sample().copied();
            let ts = now_unix();
            // Each reading keeps the timestamp of the read that produced it.
            let (moisture_percent, taken_at) = match (out.moisture, prev) {
                (Some(m), _) => (m, ts),
                (None, Some(p)) => (p.moisture_percent, p.taken_at),
                (None, None) => (0, ts),
            };
            let (climate, climate_taken_at) = match climate {
                Some(Some(c)) => (Some(c), Some(ts)),
                Some(None) => (None, None),
                None => (
                    prev.and_then(|p| p.climate),
                    prev.and_then(|p| p.climate_taken_at),
                ),
            };
            let sample = SensorSample {
                moisture_percent,
                climate,
                taken_at,
                climate_taken_at,
            };
            // A climate-only tick before the first moisture read has nothing
            // worth keeping.
            if out.moisture.is_some() || prev.is_some() {
                self.state.record_sample(sample);
            }
        }

        // -- 2. Decision -----------------------------------------------------
        if control_due {
            let before = self.state.actuators();
            let act = self.state.evaluate();
            // Rewritten every tick, changed or not.
            self.valve.set(act.valve_open);
            self.sensors.notify_valve(act.valve_open);
            if act != before {
                let detail = format!(
                    "valve {}",
                    if act.valve_open { "OPEN" } else { "CLOSED" }
                );
                info!(
                    valve_open = act.valve_open,
                    mode = ?self.state.mode(),
                    moisture = ?out.moisture,
                    threshold = self.state.threshold().get(),
                    "valve changed"
                );
                self.event(EventKind::Valve, detail);
            }
            out.actuators = Some(act);
        }

        // -- 3. Telemetry ----------------------------------------------------
        if let Some(c) = fresh_climate {
            self.telemetry.climate(&c);
        }
        if let Some(m) = out.moisture {
            self.telemetry.moisture(m);
        }
        if let Some(act) = out.actuators {
            self.telemetry.indicator(act.indicator_on);
        }

        out
    }

    /// Events accumulated since the last call.
    pub fn take_events(&mut self) -> Vec<(EventKind, String)> {
        std::mem::take(&mut self.events)
    }

    pub fn publish_failures(&self) -> u64 {
        self.telemetry.failures()
    }

    pub fn climate_faults(&self) -> u64 {
        self.sensors.climate_faults()
    }

    fn event(&mut self, kind: EventKind, detail: String) {
        self.events.push((kind, detail));
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// Drive `node` until cancelled. A closed command queue only stops command
/// handling; irrigation keeps running.
pub async fn run<V: ValveOutput, P: Publish>(
    node: &mut Node<V, P>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    link: watch::Receiver<LinkStatus>,
    status: Option<SharedStatus>,
    poll: Duration,
) {
    let mut commands_open = true;
    let mut was_connected = false;
    node.start();

    loop {
        // Nothing else runs while this drains, so it sees exactly the
        // commands that arrived since the previous iteration.
        while commands_open {
            match commands.try_recv() {
                Ok(cmd) => {
                    debug!(?cmd, "applying command");
                    node.handle_command(cmd);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("command queue closed, continuing without remote commands");
                    commands_open = false;
                }
            }
        }

        let connected = link.borrow().is_connected();
        if connected && !was_connected {
            debug!("broker link up, re-announcing threshold and mode");
            node.announce();
        }
        was_connected = connected;

        node.tick(Instant::now());

        if let Some(status) = &status {
            let mut st = status.write().await;
            st.set_link(*link.borrow());
            st.mode = node.state().mode();
            st.threshold = node.state().threshold().get();
            st.sample = node.state().sample().copied();
            st.actuators = node.state().actuators();
            st.publish_failures = node.publish_failures();
            st.climate_faults = node.climate_faults();
            for (kind, detail) in node.take_events() {
                st.record(kind, detail);
            }
        } else {
            node.take_events();
        }

        sleep(poll).await;
    }
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

// ===========================================================================
// Tests
// ===========================================================================
