//! Broker session: inbound command parsing and the non-blocking outbound
//! publish handle.
//!
//! Commands arrive on `cmd/<node_id>/threshold` (integer payload) and
//! `cmd/<node_id>/mode` (button edge: `1` on press, `0` on release). They are
//! forwarded, in arrival order, to the control loop's command queue.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::control::Command;
use crate::link::{Backoff, LinkStatus};
use crate::telemetry::Publish;

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

pub(crate) fn threshold_topic(node_id: &str) -> String {
    format!("cmd/{node_id}/threshold")
}

pub(crate) fn mode_topic(node_id: &str) -> String {
    format!("cmd/{node_id}/mode")
}

/// Extract (node_id, command kind) from "cmd/<node_id>/<kind>".
pub(crate) fn split_command_topic(topic: &str) -> Option<(&str, &str)> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "cmd" && !parts[1].is_empty() {
        Some((parts[1], parts[2]))
    } else {
        None
    }
}

/// Parse a threshold payload. Integers are taken as-is; a decimal is
/// rounded. Range enforcement happens in the control state.
pub(crate) fn parse_threshold(payload: &[u8]) -> Result<i64, String> {
    let s = String::from_utf8_lossy(payload);
    let s = s.trim();
    if let Ok(v) = s.parse::<i64>() {
        return Ok(v);
    }
    match s.parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v.round() as i64),
        _ => Err(format!("invalid threshold payload '{s}'")),
    }
}

/// Parse a mode-button payload. `Ok(true)` is a press edge, `Ok(false)` a
/// release.
pub(crate) fn parse_button(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "1" | "ON" | "PRESS" => Ok(true),
        "0" | "OFF" | "RELEASE" => Ok(false),
        _ => Err(format!("unknown button payload '{s}'")),
    }
}

/// Turn an inbound publish into a command. `Ok(None)` means the message was
/// valid but carries no command (a button release).
pub(crate) fn parse_command(
    node_id: &str,
    topic: &str,
    payload: &[u8],
) -> Result<Option<Command>, String> {
    match split_command_topic(topic) {
        Some((node, _)) if node != node_id => Err(format!("command for other node '{node}'")),
        Some((_, "threshold")) => parse_threshold(payload).map(|v| Some(Command::SetThreshold(v))),
        Some((_, "mode")) => parse_button(payload).map(|pressed| pressed.then_some(Command::ToggleMode)),
        _ => Err(format!("unhandled topic={topic}")),
    }
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Publish handle for the control loop. Uses the client's non-blocking path
/// so a stalled broker can never hold up a tick, and refuses outright while
/// the link is down so nothing stale piles up in the request queue.
pub(crate) struct MqttSink {
    client: AsyncClient,
    link: watch::Receiver<LinkStatus>,
}

impl MqttSink {
    pub(crate) fn new(client: AsyncClient, link: watch::Receiver<LinkStatus>) -> Self {
        Self { client, link }
    }
}

impl Publish for MqttSink {
    fn publish(&mut self, topic: String, payload: String, retain: bool) -> Result<(), String> {
        if !self.link.borrow().is_connected() {
            return Err("link down".into());
        }
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload)
            .map_err(|e| e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// What the event loop task does after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Continue,
    /// Fresh connection: (re)subscribe to the command topics.
    Subscribe,
    /// Wait this long before polling again.
    Retry(Duration),
    /// The control loop is gone.
    Close,
}

/// Session bookkeeping, separate from the socket so every event can be
/// replayed in tests.
pub(crate) struct Session {
    node_id: String,
    commands: mpsc::UnboundedSender<Command>,
    link: watch::Sender<LinkStatus>,
    backoff: Backoff,
}

impl Session {
    pub(crate) fn new(
        node_id: String,
        commands: mpsc::UnboundedSender<Command>,
        link: watch::Sender<LinkStatus>,
        backoff: Backoff,
    ) -> Self {
        Self {
            node_id,
            commands,
            link,
            backoff,
        }
    }

    pub(crate) fn topics(&self) -> [String; 2] {
        [threshold_topic(&self.node_id), mode_topic(&self.node_id)]
    }

    pub(crate) fn on_event(&mut self, event: Result<Event, ConnectionError>) -> Step {
        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                self.backoff.reset();
                self.link.send_replace(LinkStatus::Connected);
                info!(node = %self.node_id, "mqtt connected");
                Step::Subscribe
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                match parse_command(&self.node_id, &p.topic, &p.payload) {
                    Ok(Some(cmd)) => {
                        debug!(topic = %p.topic, ?cmd, "command received");
                        if self.commands.send(cmd).is_err() {
                            info!("control loop gone, closing mqtt session");
                            return Step::Close;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => warn!(topic = %p.topic, "rejected command: {e}"),
                }
                Step::Continue
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                self.link.send_replace(LinkStatus::Disconnected);
                warn!("mqtt disconnected by broker");
                Step::Continue
            }
            Ok(_) => Step::Continue,
            Err(e) => {
                let delay = self.backoff.next_delay();
                self.link.send_replace(self.backoff.status());
                warn!(
                    failures = self.backoff.failures(),
                    retry_in_sec = delay.as_secs(),
                    "mqtt error: {e}. reconnecting..."
                );
                Step::Retry(delay)
            }
        }
    }
}

/// Drive the broker event loop forever, reconnecting with backoff. Returns
/// only when the control loop has dropped its command queue.
pub(crate) async fn run_session(client: AsyncClient, mut eventloop: EventLoop, mut session: Session) {
    let topics = session.topics();

    loop {
        match session.on_event(eventloop.poll().await) {
            Step::Continue => {}
            Step::Subscribe => {
                // The request queue is drained by this same task, so never
                // await on it here.
                for t in &topics {
                    if let Err(e) = client.try_subscribe(t.as_str(), QoS::AtLeastOnce) {
                        warn!(topic = %t, "mqtt subscribe failed: {e}");
                    }
                }
            }
            Step::Retry(delay) => sleep(delay).await,
            Step::Close => return,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- split_command_topic ------------------------------------------------

    #[test]
    fn split_valid_topic() {
        assert_eq!(
            split_command_topic("cmd/greenhouse/threshold"),
            Some(("greenhouse", "threshold"))
        );
    }

    #[test]
    fn split_wrong_prefix() {
        assert_eq!(split_command_topic("tele/greenhouse/threshold"), None);
    }

    #[test]
    fn split_wrong_segment_count() {
        assert_eq!(split_command_topic("cmd/threshold"), None);
        assert_eq!(split_command_topic("cmd/a/b/mode"), None);
        assert_eq!(split_command_topic(""), None);
    }

    #[test]
    fn split_empty_node() {
        assert_eq!(split_command_topic("cmd//mode"), None);
    }

    #[test]
    fn topics_round_trip_through_split() {
        assert_eq!(
            split_command_topic(&threshold_topic("gh")),
            Some(("gh", "threshold"))
        );
        assert_eq!(split_command_topic(&mode_topic("gh")), Some(("gh", "mode")));
    }

    // -- parse_threshold ----------------------------------------------------

    #[test]
    fn threshold_integer() {
        assert_eq!(parse_threshold(b"35"), Ok(35));
    }

    #[test]
    fn threshold_with_whitespace() {
        assert_eq!(parse_threshold(b" 42\n"), Ok(42));
    }

    #[test]
    fn threshold_decimal_rounds() {
        assert_eq!(parse_threshold(b"41.6"), Ok(42));
    }

    #[test]
    fn threshold_out_of_range_passes_through() {
        assert_eq!(parse_threshold(b"250"), Ok(250));
        assert_eq!(parse_threshold(b"-3"), Ok(-3));
    }

    #[test]
    fn threshold_garbage_rejected() {
        assert!(parse_threshold(b"wet").is_err());
        assert!(parse_threshold(b"").is_err());
        assert!(parse_threshold(b"NaN").is_err());
    }

    // -- parse_button -------------------------------------------------------

    #[test]
    fn button_press_and_release() {
        assert_eq!(parse_button(b"1"), Ok(true));
        assert_eq!(parse_button(b"0"), Ok(false));
        assert_eq!(parse_button(b"press"), Ok(true));
        assert_eq!(parse_button(b" off "), Ok(false));
    }

    #[test]
    fn button_garbage_rejected() {
        assert!(parse_button(b"2").is_err());
        assert!(parse_button(b"").is_err());
    }

    // -- parse_command ------------------------------------------------------

    #[test]
    fn command_threshold() {
        assert_eq!(
            parse_command("gh", "cmd/gh/threshold", b"20"),
            Ok(Some(Command::SetThreshold(20)))
        );
    }

    #[test]
    fn command_press_toggles() {
        assert_eq!(
            parse_command("gh", "cmd/gh/mode", b"1"),
            Ok(Some(Command::ToggleMode))
        );
    }

    #[test]
    fn command_release_is_ignored() {
        assert_eq!(parse_command("gh", "cmd/gh/mode", b"0"), Ok(None));
    }

    #[test]
    fn command_for_other_node_rejected() {
        assert!(parse_command("gh", "cmd/other/mode", b"1").is_err());
    }

    #[test]
    fn command_unknown_kind_rejected() {
        assert!(parse_command("gh", "cmd/gh/reboot", b"1").is_err());
    }

    #[test]
    fn command_unrelated_topic_rejected() {
        assert!(parse_command("gh", "tele/gh/moisture", b"1").is_err());
    }

    // -- MqttSink -----------------------------------------------------------

    fn sink(name: &str, cap: usize, link: LinkStatus) -> (MqttSink, watch::Sender<LinkStatus>) {
        let opts = rumqttc::MqttOptions::new(name, "127.0.0.1", 1883);
        // Event loop is never polled: accepted publishes sit in the request
        // channel.
        let (client, el) = AsyncClient::new(opts, cap);
        // Keep the request receiver alive for the rest of the test.
        std::mem::forget(el);
        let (tx, rx) = watch::channel(link);
        (MqttSink::new(client, rx), tx)
    }

    #[tokio::test]
    async fn sink_queues_while_connected() {
        let (mut sink, _tx) = sink("test-sink", 10, LinkStatus::Connected);
        assert!(sink
            .publish("tele/gh/moisture".into(), "40".into(), false)
            .is_ok());
    }

    #[tokio::test]
    async fn sink_reports_full_queue() {
        let (mut sink, _tx) = sink("test-sink-full", 1, LinkStatus::Connected);
        let results: Vec<bool> = (0..5)
            .map(|_| sink.publish("t".into(), "v".into(), false).is_ok())
            .collect();
        assert!(results.iter().any(|ok| !ok), "expected a dropped publish");
    }

    #[tokio::test]
    async fn sink_refuses_while_link_down() {
        let (mut sink, tx) = sink("test-sink-offline", 1, LinkStatus::Disconnected);
        for _ in 0..10 {
            assert_eq!(
                sink.publish("tele/gh/temperature".into(), "21.0".into(), false),
                Err("link down".to_string())
            );
        }
        tx.send_replace(LinkStatus::Connecting { attempt: 2 });
        assert!(sink.publish("t".into(), "v".into(), false).is_err());

        // Nothing was queued while offline: the single slot is still free.
        tx.send_replace(LinkStatus::Connected);
        assert!(sink.publish("t".into(), "fresh".into(), false).is_ok());
    }

    #[tokio::test]
    async fn offline_climate_reads_are_dropped_not_queued() {
        use crate::sensor::Climate;
        use crate::telemetry::TelemetryPublisher;

        let (sink, tx) = sink("test-sink-climate", 2, LinkStatus::Disconnected);
        let mut telemetry = TelemetryPublisher::new(sink, "gh");
        let c = Climate {
            temperature_c: 20.0,
            humidity_percent: 50.0,
        };
        for _ in 0..10 {
            telemetry.climate(&c);
        }
        assert_eq!(telemetry.failures(), 20);

        tx.send_replace(LinkStatus::Connected);
        telemetry.climate(&c);
        assert_eq!(telemetry.failures(), 20, "queue should be empty on reconnect");
    }

    // -- Session ------------------------------------------------------------

    use rumqttc::{ConnAck, ConnectReturnCode, Publish as PublishPacket};

    struct Harness {
        session: Session,
        commands: mpsc::UnboundedReceiver<Command>,
        link: watch::Receiver<LinkStatus>,
    }

    fn harness() -> Harness {
        let (cmd_tx, commands) = mpsc::unbounded_channel();
        let (link_tx, link) = watch::channel(LinkStatus::Disconnected);
        let backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(60));
        Harness {
            session: Session::new("gh".into(), cmd_tx, link_tx, backoff),
            commands,
            link,
        }
    }

    fn connack() -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        ))))
    }

    fn incoming(topic: &str, payload: &str) -> Result<Event, ConnectionError> {
        Ok(Event::Incoming(Packet::Publish(PublishPacket::new(
            topic,
            QoS::AtLeastOnce,
            payload.as_bytes().to_vec(),
        ))))
    }

    fn refused() -> Result<Event, ConnectionError> {
        Err(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        )))
    }

    #[test]
    fn session_topics() {
        let h = harness();
        assert_eq!(h.session.topics(), ["cmd/gh/threshold", "cmd/gh/mode"]);
    }

    #[test]
    fn errors_back_off_and_report_attempts() {
        let mut h = harness();
        assert_eq!(h.session.on_event(refused()), Step::Retry(Duration::from_secs(2)));
        assert_eq!(*h.link.borrow(), LinkStatus::Connecting { attempt: 2 });
        assert_eq!(h.session.on_event(refused()), Step::Retry(Duration::from_secs(4)));
        assert_eq!(h.session.on_event(refused()), Step::Retry(Duration::from_secs(8)));
        assert_eq!(*h.link.borrow(), LinkStatus::Connecting { attempt: 4 });
    }

    #[test]
    fn connack_connects_subscribes_and_resets_backoff() {
        let mut h = harness();
        h.session.on_event(refused());
        h.session.on_event(refused());

        assert_eq!(h.session.on_event(connack()), Step::Subscribe);
        assert_eq!(*h.link.borrow(), LinkStatus::Connected);

        // The ladder starts over after a good connection.
        assert_eq!(h.session.on_event(refused()), Step::Retry(Duration::from_secs(2)));
    }

    #[test]
    fn broker_disconnect_marks_link_down() {
        let mut h = harness();
        h.session.on_event(connack());
        let step = h.session.on_event(Ok(Event::Incoming(Packet::Disconnect)));
        assert_eq!(step, Step::Continue);
        assert_eq!(*h.link.borrow(), LinkStatus::Disconnected);
    }

    #[test]
    fn commands_forwarded_in_arrival_order() {
        let mut h = harness();
        h.session.on_event(connack());
        for (topic, payload) in [
            ("cmd/gh/threshold", "20"),
            ("cmd/gh/mode", "1"),
            ("cmd/gh/mode", "0"),
            ("cmd/gh/threshold", "oops"),
            ("cmd/other/mode", "1"),
            ("cmd/gh/threshold", "75"),
        ] {
            assert_eq!(h.session.on_event(incoming(topic, payload)), Step::Continue);
        }

        let mut got = Vec::new();
        while let Ok(cmd) = h.commands.try_recv() {
            got.push(cmd);
        }
        assert_eq!(
            got,
            vec![
                Command::SetThreshold(20),
                Command::ToggleMode,
                Command::SetThreshold(75),
            ]
        );
    }

    #[test]
    fn closed_command_queue_ends_session() {
        let mut h = harness();
        drop(h.commands);
        assert_eq!(h.session.on_event(incoming("cmd/gh/mode", "1")), Step::Close);
    }

    #[test]
    fn outgoing_events_are_ignored() {
        let mut h = harness();
        let step = h
            .session
            .on_event(Ok(Event::Outgoing(rumqttc::Outgoing::PingReq)));
        assert_eq!(step, Step::Continue);
        assert_eq!(*h.link.borrow(), LinkStatus::Disconnected);
    }
}
