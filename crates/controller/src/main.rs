mod board;
mod config;
mod mqtt;
mod state;
mod web;

#[cfg(feature = "gpio")]
mod adc;
#[cfg(feature = "gpio")]
mod gpio;
#[cfg(all(feature = "sim", not(feature = "gpio")))]
mod sim;

#[cfg(not(any(feature = "sim", feature = "gpio")))]
compile_error!("enable the `sim` or `gpio` feature to select a board backend");

use anyhow::{Context, Result};
use std::env;
use std::sync::Arc;
use std::time::Instant;
use tracing_subscriber::EnvFilter;

use irrigation_core::{ControlLoop, LogSink};

use state::{StatusBoard, StatusState};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load(&config_path)?;
    let node_id = cfg.controller.node_id.clone();

    if cfg.zones.is_empty() {
        tracing::warn!("no zones configured; the loop will only publish empty batches");
    }

    // ── Shared state (ephemeral, for the status endpoint) ───────────
    let shared = StatusState::shared(node_id.as_str());
    shared
        .write()
        .await
        .record_system(format!("controller {node_id} started"));

    // ── Board + zone registry ───────────────────────────────────────
    // Every valve is driven closed here, before anything else can act.
    let mut board = board::open(&cfg).context("failed to open board")?;
    let assembly = board::assemble(&cfg, &mut board)?;

    // ── Web server ──────────────────────────────────────────────────
    if let Some(web) = &cfg.web {
        let web_state = Arc::clone(&shared);
        let port = web.port;
        tokio::spawn(async move {
            if let Err(e) = web::serve(web_state, port).await {
                tracing::error!("{e:#}");
            }
        });
    }

    // ── MQTT ────────────────────────────────────────────────────────
    let mqtt_sink = match &cfg.mqtt {
        Some(mqtt_cfg) => Some(mqtt::connect(mqtt_cfg, &node_id, Arc::clone(&shared)).await),
        None => {
            tracing::info!("mqtt not configured, telemetry stays local");
            None
        }
    };

    // ── Control loop ────────────────────────────────────────────────
    let mut control = ControlLoop::new(
        assembly.reader,
        assembly.zones,
        cfg.loop_settings(),
        Instant::now(),
    );
    control.add_sink(Box::new(LogSink));
    control.add_sink(Box::new(StatusBoard::new(Arc::clone(&shared))));
    if let Some(sink) = mqtt_sink {
        control.add_sink(Box::new(sink));
    }

    // Blocking reads and sleeps stay off the async workers.
    tokio::task::spawn_blocking(move || control.run())
        .await
        .context("control loop stopped")?;

    // Keeps pins and simulator threads alive for as long as the loop runs.
    drop(board);
    Ok(())
}
