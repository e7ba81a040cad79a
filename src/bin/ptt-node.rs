//! Push-to-talk voice node
//!
//! Opens the default microphone and speaker, joins the talk group and
//! exposes the HTTP control API. Talk bursts are started and stopped
//! through `POST /api/capture/start` and `POST /api/capture/stop`.
//!
//! Usage: `ptt-node [--config <path>] [--list-devices]`

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ptt_voice::{
    audio::{list_devices, CpalBackend},
    config::AppConfig,
    control::ControlServer,
    AudioPipeline,
};

const STATS_INTERVAL: Duration = Duration::from_secs(10);

struct Args {
    config: Option<PathBuf>,
    list_devices: bool,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        list_devices: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config needs a path")?;
                args.config = Some(PathBuf::from(path));
            }
            "--list-devices" => args.list_devices = true,
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(args)
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        let voice_marker = if device.supports_voice_rate { "" } else { " (no 16 kHz)" };
        println!("  {} ({}){}{}:", device.name, device_type, default_marker, voice_marker);
        println!("    ID: {}", device.id);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args()?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }

    tracing::info!("Starting PTT voice node");

    let config = AppConfig::load_or_default(args.config.as_deref()).context("loading configuration")?;
    let control_config = config.control.clone();

    let pipeline = Arc::new(
        AudioPipeline::initialize(config, Arc::new(CpalBackend)).context("initializing audio pipeline")?,
    );
    pipeline.start_playback().context("starting playback")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = if control_config.enabled {
        let server = ControlServer::new(control_config, pipeline.clone());
        Some(tokio::spawn(server.run(async move {
            let _ = shutdown_rx.await;
        })))
    } else {
        None
    };

    let stats_pipeline = pipeline.clone();
    let stats_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(STATS_INTERVAL);
        interval.tick().await;
        loop {
            interval.tick().await;
            let stats = stats_pipeline.stats();
            tracing::info!(
                "Stats: {} sent, {} received, {} lost ({:.1}% loss), {} concealed, jitter {}/{}, latency {:.0} ms",
                stats.session.packets_sent,
                stats.session.packets_received,
                stats.packets_lost,
                stats.loss_rate * 100.0,
                stats.session.frames_concealed,
                stats.jitter.depth,
                stats.jitter.capacity,
                stats.latency_ms
            );
        }
    });

    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;
    tracing::info!("Shutting down");

    stats_task.abort();
    let _ = shutdown_tx.send(());
    if let Some(server) = server {
        match server.await {
            Ok(Err(e)) => tracing::error!("Control API failed: {}", e),
            Err(e) => tracing::error!("Control API task failed: {}", e),
            Ok(Ok(())) => {}
        }
    }

    pipeline.shutdown();
    Ok(())
}
