//! Read-only status snapshot for the status API. The control loop is the
//! only writer; it refreshes the snapshot after every iteration.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::control::{ActuatorState, OperatingMode};
use crate::link::LinkStatus;
use crate::sensor::SensorSample;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 100;

pub type SharedStatus = Arc<RwLock<NodeStatus>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct NodeStatus {
    pub started_at: Instant,
    pub node_id: String,
    pub link: LinkStatus,
    pub mode: OperatingMode,
    pub threshold: u8,
    pub sample: Option<SensorSample>,
    pub actuators: ActuatorState,
    pub publish_failures: u64,
    pub climate_faults: u64,
    pub events: VecDeque<NodeEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Command,
    Valve,
    Fault,
    Link,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub node_id: String,
    pub uptime_secs: u64,
    pub link: LinkStatus,
    pub mode: OperatingMode,
    pub threshold: u8,
    pub sample: Option<SensorSample>,
    pub actuators: ActuatorState,
    pub publish_failures: u64,
    pub climate_faults: u64,
    pub events: Vec<NodeEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl NodeStatus {
    pub fn new(node_id: impl Into<String>, threshold: u8) -> Self {
        Self {
            started_at: Instant::now(),
            node_id: node_id.into(),
            link: LinkStatus::Disconnected,
            mode: OperatingMode::Auto,
            threshold,
            sample: None,
            actuators: ActuatorState::default(),
            publish_failures: 0,
            climate_faults: 0,
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    pub fn record(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(NodeEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }

    /// Track link transitions; repeated identical statuses are not events.
    pub fn set_link(&mut self, link: LinkStatus) {
        if link != self.link {
            let detail = match link {
                LinkStatus::Disconnected => "broker disconnected".to_string(),
                LinkStatus::Connecting { attempt } => format!("reconnecting (attempt {attempt})"),
                LinkStatus::Connected => "broker connected".to_string(),
            };
            self.link = link;
            self.record(EventKind::Link, detail);
        }
    }

    /// Build the JSON-serialisable snapshot, newest events first.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            node_id: self.node_id.clone(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            link: self.link,
            mode: self.mode,
            threshold: self.threshold,
            sample: self.sample,
            actuators: self.actuators,
            publish_failures: self.publish_failures,
            climate_faults: self.climate_faults,
            events: self.events.iter().rev().cloned().collect(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_status_is_disconnected_auto() {
        let st = NodeStatus::new("gh", 50);
        let s = st.to_status();
        assert_eq!(s.link, LinkStatus::Disconnected);
        assert_eq!(s.mode, OperatingMode::Auto);
        assert_eq!(s.threshold, 50);
        assert!(s.events.is_empty());
    }

    #[test]
    fn ring_buffer_drops_oldest() {
        let mut st = NodeStatus::new("gh", 50);
        for i in 0..(MAX_EVENTS + 5) {
            st.record(EventKind::System, format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.events.front().unwrap().detail, "e5");
    }

    #[test]
    fn status_lists_newest_first() {
        let mut st = NodeStatus::new("gh", 50);
        st.record(EventKind::Command, "first".into());
        st.record(EventKind::Command, "second".into());
        let s = st.to_status();
        assert_eq!(s.events[0].detail, "second");
        assert_eq!(s.events[1].detail, "first");
    }

    #[test]
    fn link_change_recorded_once() {
        let mut st = NodeStatus::new("gh", 50);
        st.set_link(LinkStatus::Connected);
        st.set_link(LinkStatus::Connected);
        assert_eq!(st.events.len(), 1);
        assert_eq!(st.events[0].kind, EventKind::Link);
    }

    #[test]
    fn event_serializes_with_rfc3339_timestamp() {
        let mut st = NodeStatus::new("gh", 50);
        st.record(EventKind::Valve, "valve OPEN".into());
        let v = serde_json::to_value(&st.events[0]).unwrap();
        assert_eq!(v["kind"], "valve");
        assert!(v["ts"].as_str().unwrap().contains('T'));
    }
}
