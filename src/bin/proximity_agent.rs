//! proximity_agent - TF-Luna distance trigger for the kiosk hub.
//!
//! Reads the distance sensor, fires one `lidarDistance` per approaching
//! visitor and stays locked until the hub ends the session.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiosk_gate::config::KioskConfig;
use kiosk_gate::runtime::{hub_transport, run_proximity, PROXIMITY_CLIENT_ID};
use kiosk_gate::ui::{Ui, UiMode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Kiosk proximity trigger agent")]
struct Args {
    /// Config file (.toml or .json).
    #[arg(long, env = "KIOSK_CONFIG")]
    config: Option<PathBuf>,

    /// Hub broker address, overriding the config file.
    #[arg(long)]
    hub_addr: Option<String>,

    /// Allow a non-loopback hub broker.
    #[arg(long)]
    allow_remote: bool,

    /// Sensor device or `stub://d1,d2,...` pattern, overriding the config file.
    #[arg(long)]
    device: Option<PathBuf>,

    /// Startup output style.
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::detect(args.ui);

    let mut config = ui.run_stage("Load configuration", || {
        KioskConfig::load_from(args.config.as_deref())
    })?;
    if let Some(addr) = args.hub_addr {
        config.hub.addr = addr;
    }
    if let Some(device) = args.device {
        config.proximity.device = device;
    }
    config.hub.allow_remote |= args.allow_remote;
    if config.hub.allow_remote {
        log::warn!("remote hub enabled; ensure the broker is on a trusted network");
    }

    let transport = ui.run_stage("Prepare hub transport", || {
        hub_transport(&config.hub, PROXIMITY_CLIENT_ID)
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal = Arc::clone(&shutdown);
    ctrlc::set_handler(move || signal.store(true, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    log::info!("proximity_agent running (Ctrl-C to stop)");
    run_proximity(&config, transport, shutdown)?;
    Ok(())
}
