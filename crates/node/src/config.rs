//! Node configuration: optional TOML file, environment overrides, and
//! validation.

use std::env;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::control::DEFAULT_THRESHOLD;

// ---------------------------------------------------------------------------
// Config file structure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub node_id: String,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub keep_alive_sec: u64,
    pub backoff_min_sec: u64,
    pub backoff_max_sec: u64,

    /// Moisture read + valve decision cadence.
    pub control_interval_ms: u64,
    /// Climate sensor cadence. A DHT22 needs at least 2 s between reads.
    pub climate_interval_ms: u64,
    /// How often the loop wakes to drain commands and check due tasks.
    pub poll_interval_ms: u64,

    pub default_threshold: i64,

    pub relay_active_low: bool,
    pub relay_gpio_pin: i64,
    pub climate_gpio_pin: i64,
    pub adc_address: u16,
    pub adc_channel: usize,

    /// 0 disables the status API.
    pub web_port: u16,

    pub sim_scenario: String,
    pub sim_day_period_sec: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "greenhouse".into(),
            mqtt_host: "127.0.0.1".into(),
            mqtt_port: 1883,
            keep_alive_sec: 30,
            backoff_min_sec: 2,
            backoff_max_sec: 60,
            control_interval_ms: 1_000,
            climate_interval_ms: 2_000,
            poll_interval_ms: 50,
            default_threshold: i64::from(DEFAULT_THRESHOLD),
            relay_active_low: true,
            relay_gpio_pin: 17,
            climate_gpio_pin: 4,
            adc_address: 0x48,
            adc_channel: 0,
            web_port: 8080,
            sim_scenario: "drying".into(),
            sim_day_period_sec: 600,
        }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins on the 40-pin header available for general use. GPIO 0-1
/// are reserved for the ID EEPROM; 28+ are not on the header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

/// Characters that would break the node's MQTT topics.
const TOPIC_RESERVED: &[char] = &['/', '+', '#'];

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl NodeConfig {
    /// Validate every field. Returns an error listing every violation found
    /// (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.node_id.trim().is_empty() {
            errors.push("node_id is empty".into());
        } else if self.node_id.contains(TOPIC_RESERVED) {
            errors.push(format!(
                "node_id '{}' contains an MQTT topic character (/ + #)",
                self.node_id
            ));
        }

        if self.mqtt_host.trim().is_empty() {
            errors.push("mqtt_host is empty".into());
        }
        if self.mqtt_port == 0 {
            errors.push("mqtt_port must be non-zero".into());
        }
        if self.keep_alive_sec < 5 {
            errors.push(format!(
                "keep_alive_sec must be at least 5, got {}",
                self.keep_alive_sec
            ));
        }

        if self.backoff_min_sec == 0 {
            errors.push("backoff_min_sec must be positive".into());
        }
        if self.backoff_max_sec < self.backoff_min_sec {
            errors.push(format!(
                "backoff_max_sec ({}) is below backoff_min_sec ({})",
                self.backoff_max_sec, self.backoff_min_sec
            ));
        }

        for (name, v) in [
            ("control_interval_ms", self.control_interval_ms),
            ("climate_interval_ms", self.climate_interval_ms),
            ("poll_interval_ms", self.poll_interval_ms),
        ] {
            if v == 0 {
                errors.push(format!("{name} must be positive"));
            }
        }
        if self.poll_interval_ms > self.control_interval_ms {
            errors.push(format!(
                "poll_interval_ms ({}) exceeds control_interval_ms ({})",
                self.poll_interval_ms, self.control_interval_ms
            ));
        }

        if !(0..=100).contains(&self.default_threshold) {
            errors.push(format!(
                "default_threshold {} out of range [0, 100]",
                self.default_threshold
            ));
        }

        for (name, pin) in [
            ("relay_gpio_pin", self.relay_gpio_pin),
            ("climate_gpio_pin", self.climate_gpio_pin),
        ] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if self.relay_gpio_pin == self.climate_gpio_pin {
            errors.push(format!(
                "relay_gpio_pin and climate_gpio_pin are both {}",
                self.relay_gpio_pin
            ));
        }

        if !(0x48..=0x4B).contains(&self.adc_address) {
            errors.push(format!(
                "adc_address 0x{:02x} is not an ADS1115 address (0x48-0x4b)",
                self.adc_address
            ));
        }
        if self.adc_channel > 3 {
            errors.push(format!("adc_channel {} out of range (0-3)", self.adc_channel));
        }

        if self.sim_day_period_sec == 0 {
            errors.push("sim_day_period_sec must be positive".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Environment overrides, for the knobs that differ per deployment.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(v) = env::var("NODE_ID") {
            self.node_id = v;
        }
        if let Ok(v) = env::var("MQTT_HOST") {
            self.mqtt_host = v;
        }
        if let Ok(v) = env::var("MQTT_PORT") {
            self.mqtt_port = v
                .parse()
                .with_context(|| format!("MQTT_PORT is not a port number: {v:?}"))?;
        }
        if let Ok(v) = env::var("WEB_PORT") {
            self.web_port = v
                .parse()
                .with_context(|| format!("WEB_PORT is not a port number: {v:?}"))?;
        }
        if let Ok(v) = env::var("RELAY_ACTIVE_LOW") {
            self.relay_active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("SIM_SCENARIO") {
            self.sim_scenario = v;
        }
        Ok(())
    }

    pub fn control_interval(&self) -> Duration {
        Duration::from_millis(self.control_interval_ms)
    }

    pub fn climate_interval(&self) -> Duration {
        Duration::from_millis(self.climate_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse a TOML config string; every field is optional.
pub fn parse(contents: &str) -> Result<NodeConfig> {
    toml::from_str(contents).context("failed to parse config")
}

/// Read the config file if it exists (defaults otherwise), apply environment
/// overrides, then validate.
pub fn load(path: &str) -> Result<NodeConfig> {
    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config: {path}"))?;
        parse(&contents).with_context(|| format!("in {path}"))?
    } else {
        tracing::info!(path, "no config file, using defaults");
        NodeConfig::default()
    };

    config.apply_env()?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &NodeConfig, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_gives_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.node_id, "greenhouse");
        assert_eq!(cfg.default_threshold, 50);
        assert!(cfg.relay_active_low);
        assert_eq!(cfg.control_interval(), Duration::from_secs(1));
    }

    #[test]
    fn parse_partial_config() {
        let cfg = parse(
            r#"
node_id = "bed-2"
mqtt_host = "broker.local"
default_threshold = 35
climate_interval_ms = 5000
relay_active_low = false
"#,
        )
        .unwrap();
        assert_eq!(cfg.node_id, "bed-2");
        assert_eq!(cfg.mqtt_host, "broker.local");
        assert_eq!(cfg.default_threshold, 35);
        assert_eq!(cfg.climate_interval(), Duration::from_secs(5));
        assert!(!cfg.relay_active_low);
        // Untouched fields keep defaults.
        assert_eq!(cfg.mqtt_port, 1883);
    }

    #[test]
    fn parse_wrong_type_fails() {
        assert!(parse("mqtt_port = \"one\"").is_err());
    }

    #[test]
    fn load_missing_file_uses_defaults() {
        let cfg = load("/nonexistent/greenhouse.toml").unwrap();
        assert_eq!(cfg.backoff_max_sec, 60);
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn defaults_pass() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn empty_node_id_rejected() {
        let cfg = NodeConfig {
            node_id: " ".into(),
            ..Default::default()
        };
        assert_validation_err(&cfg, "node_id is empty");
    }

    #[test]
    fn node_id_with_wildcard_rejected() {
        let cfg = NodeConfig {
            node_id: "bed/#".into(),
            ..Default::default()
        };
        assert_validation_err(&cfg, "MQTT topic character");
    }

    #[test]
    fn threshold_out_of_range_rejected() {
        let cfg = NodeConfig {
            default_threshold: 101,
            ..Default::default()
        };
        assert_validation_err(&cfg, "default_threshold 101 out of range");
    }

    #[test]
    fn threshold_boundaries_accepted() {
        for t in [0, 100] {
            let cfg = NodeConfig {
                default_threshold: t,
                ..Default::default()
            };
            cfg.validate().unwrap();
        }
    }

    #[test]
    fn zero_interval_rejected() {
        let cfg = NodeConfig {
            climate_interval_ms: 0,
            ..Default::default()
        };
        assert_validation_err(&cfg, "climate_interval_ms must be positive");
    }

    #[test]
    fn poll_slower_than_control_rejected() {
        let cfg = NodeConfig {
            poll_interval_ms: 2_000,
            ..Default::default()
        };
        assert_validation_err(&cfg, "exceeds control_interval_ms");
    }

    #[test]
    fn backoff_inverted_rejected() {
        let cfg = NodeConfig {
            backoff_min_sec: 30,
            backoff_max_sec: 10,
            ..Default::default()
        };
        assert_validation_err(&cfg, "below backoff_min_sec");
    }

    #[test]
    fn gpio_pin_outside_header_rejected() {
        let cfg = NodeConfig {
            relay_gpio_pin: 1,
            ..Default::default()
        };
        assert_validation_err(&cfg, "relay_gpio_pin 1 is not a valid BCM GPIO pin");
    }

    #[test]
    fn gpio_pin_shared_rejected() {
        let cfg = NodeConfig {
            relay_gpio_pin: 4,
            climate_gpio_pin: 4,
            ..Default::default()
        };
        assert_validation_err(&cfg, "are both 4");
    }

    #[test]
    fn adc_settings_checked() {
        let cfg = NodeConfig {
            adc_address: 0x20,
            adc_channel: 4,
            ..Default::default()
        };
        assert_validation_err(&cfg, "not an ADS1115 address");
        assert_validation_err(&cfg, "adc_channel 4 out of range");
    }

    #[test]
    fn multiple_errors_collected() {
        let cfg = NodeConfig {
            node_id: "".into(),
            mqtt_port: 0,
            default_threshold: -1,
            relay_gpio_pin: 40,
            ..Default::default()
        };
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("4 errors"), "got: {msg}");
        assert!(msg.contains("node_id is empty"));
        assert!(msg.contains("mqtt_port"));
        assert!(msg.contains("default_threshold"));
        assert!(msg.contains("relay_gpio_pin 40"));
    }
}
