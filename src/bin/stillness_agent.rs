//! stillness_agent - basket stillness detection for the kiosk hub.
//!
//! Watches the basket camera during a detection run and sends a single
//! `basketStable` once the scene has stopped moving.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use kiosk_gate::config::KioskConfig;
use kiosk_gate::runtime::{hub_transport, run_stillness, STILLNESS_CLIENT_ID};
use kiosk_gate::session::CoordinatorExit;
use kiosk_gate::ui::{Ui, UiMode};

#[derive(Parser, Debug)]
#[command(author, version, about = "Kiosk basket stillness agent")]
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

    /// Frame producer command (`stub://still` for a synthetic camera).
    #[arg(long, num_args = 1.., allow_hyphen_values = true)]
    camera_cmd: Option<Vec<String>>,

    /// Keep running after `stopVision`.
    #[arg(long)]
    stay_on_stop: bool,

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
    if let Some(command) = args.camera_cmd {
        config.stillness.camera.command = command;
    }
    config.hub.allow_remote |= args.allow_remote;
    if args.stay_on_stop {
        config.exit_on_stop = false;
    }

    let transport = ui.run_stage("Prepare hub transport", || {
        hub_transport(&config.hub, STILLNESS_CLIENT_ID)
    })?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal = Arc::clone(&shutdown);
    ctrlc::set_handler(move || signal.store(true, Ordering::SeqCst))
        .context("failed to install Ctrl-C handler")?;

    log::info!(
        "stillness_agent running: {}x{}@{} (Ctrl-C to stop)",
        config.stillness.camera.width,
        config.stillness.camera.height,
        config.stillness.camera.fps
    );
    if run_stillness(&config, transport, shutdown)? == CoordinatorExit::StopRequested {
        log::info!("stillness_agent exiting on stopVision");
    }
    Ok(())
}
