mod adc;
mod config;
mod control;
mod dht;
mod link;
mod mqtt;
mod scheduler;
mod sensor;
#[cfg(feature = "sim")]
mod sim;
mod state;
mod telemetry;
mod valve;
mod web;

use std::env;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, MqttOptions};
use tokio::sync::{mpsc, watch, RwLock};
use tracing_subscriber::EnvFilter;

use crate::config::NodeConfig;
use crate::control::Threshold;
use crate::link::{Backoff, LinkStatus};
use crate::scheduler::Node;
use crate::sensor::{ClimateProbe, MoistureProbe, SensorReader};
use crate::state::NodeStatus;
use crate::telemetry::TelemetryPublisher;
use crate::valve::ValveRelay;

#[cfg(all(not(feature = "adc"), not(feature = "sim")))]
compile_error!("no moisture backend: enable the `adc` or `sim` feature");
#[cfg(all(not(feature = "gpio"), not(feature = "sim")))]
compile_error!("no climate backend: enable the `gpio` or `sim` feature");

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "greenhouse.toml".to_string());
    let config = config::load(&config_path)?;

    tracing::info!(
        node = %config.node_id,
        broker = %format!("{}:{}", config.mqtt_host, config.mqtt_port),
        "greenhouse node starting"
    );

    // ── Hardware ────────────────────────────────────────────
    let sensors = SensorReader::new(moisture_probe(&config)?, climate_probe(&config)?);
    let valve = ValveRelay::new(gpio_pin(config.relay_gpio_pin)?, config.relay_active_low)?;

    // ── MQTT ────────────────────────────────────────────────
    let client_id = format!("greenhouse-node-{}", config.node_id);
    let mut opts = MqttOptions::new(client_id, config.mqtt_host.clone(), config.mqtt_port);
    opts.set_keep_alive(Duration::from_secs(config.keep_alive_sec));
    let (client, eventloop) = AsyncClient::new(opts, 20);

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (link_tx, link_rx) = watch::channel(LinkStatus::default());
    let backoff = Backoff::new(
        Duration::from_secs(config.backoff_min_sec),
        Duration::from_secs(config.backoff_max_sec),
    );
    let session = mqtt::Session::new(config.node_id.clone(), cmd_tx, link_tx, backoff);
    tokio::spawn(mqtt::run_session(client.clone(), eventloop, session));

    // ── Status API ──────────────────────────────────────────
    let (threshold, clamped) = Threshold::clamped(config.default_threshold);
    if clamped {
        tracing::warn!(
            configured = config.default_threshold,
            applied = threshold.get(),
            "default threshold clamped"
        );
    }

    let status = if config.web_port != 0 {
        let status = Arc::new(RwLock::new(NodeStatus::new(
            config.node_id.clone(),
            threshold.get(),
        )));
        let web_status = status.clone();
        let port = config.web_port;
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_status, port).await {
                tracing::error!("status api stopped: {e:#}");
            }
        });
        Some(status)
    } else {
        tracing::info!("status api disabled");
        None
    };

    // ── Control loop ────────────────────────────────────────
    let telemetry = TelemetryPublisher::new(
        mqtt::MqttSink::new(client, link_rx.clone()),
        config.node_id.clone(),
    );
    let mut node = Node::new(
        threshold,
        sensors,
        valve,
        telemetry,
        config.control_interval(),
        config.climate_interval(),
    );

    tokio::select! {
        _ = scheduler::run(&mut node, cmd_rx, link_rx, status, config.poll_interval()) => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for shutdown signal")?;
            tracing::info!("shutdown requested");
        }
    }

    node.shutdown();
    Ok(())
}

fn gpio_pin(pin: i64) -> Result<u8> {
    u8::try_from(pin).with_context(|| format!("gpio pin {pin} out of range"))
}

#[cfg(feature = "adc")]
fn moisture_probe(config: &NodeConfig) -> Result<Box<dyn MoistureProbe>> {
    Ok(Box::new(adc::Ads1115Moisture::new(
        config.adc_address,
        config.adc_channel,
    )?))
}

#[cfg(all(not(feature = "adc"), feature = "sim"))]
fn moisture_probe(config: &NodeConfig) -> Result<Box<dyn MoistureProbe>> {
    let scenario = sim::Scenario::from_str_lossy(&config.sim_scenario);
    tracing::info!(%scenario, "[sim] simulated moisture probe");
    Ok(Box::new(sim::SimMoisture::new(scenario)))
}

#[cfg(feature = "gpio")]
fn climate_probe(config: &NodeConfig) -> Result<Box<dyn ClimateProbe>> {
    Ok(Box::new(dht::Dht22::new(gpio_pin(config.climate_gpio_pin)?)?))
}

#[cfg(all(not(feature = "gpio"), feature = "sim"))]
fn climate_probe(config: &NodeConfig) -> Result<Box<dyn ClimateProbe>> {
    let scenario = sim::Scenario::from_str_lossy(&config.sim_scenario);
    Ok(Box::new(sim::SimClimate::new(
        scenario,
        config.sim_day_period_sec as f64,
    )))
}
