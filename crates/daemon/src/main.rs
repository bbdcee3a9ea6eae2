//! hwbus daemon
//!
//! Runs the message bus with its timer service, the USB session service, the
//! Trezor/Ledger signer service and a terminal UI until interrupted.

use anyhow::{Context, Result};
use clap::Parser;
use common::{Bus, setup_logging, timer};
use daemon::config::DaemonConfig;
use daemon::signer::SignerService;
use daemon::ui::{self, TerminalUi};
use daemon::usb::{RusbTransport, SessionCore, UsbService};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "hwbus")]
#[command(
    author,
    version,
    about = "hwbus - hardware wallet message bus daemon"
)]
#[command(long_about = "
Exposes Trezor and Ledger hardware wallets to in-process services over a
topic-based message bus, with USB session arbitration and interactive
PIN / passphrase / confirmation prompts on the terminal.

EXAMPLES:
    # Run with default config
    hwbus

    # Run with custom config
    hwbus --config ~/hwbus.toml

    # List supported devices without starting the daemon
    hwbus --list-devices
    hwbus --list-devices --json

    # Run with debug logging
    hwbus --log-level debug

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/hwbus/daemon.toml
    3. /etc/hwbus/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List supported devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Print the device list as JSON
    #[arg(long, requires = "list_devices")]
    json: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        DaemonConfig::load(Some(DaemonConfig::expand_path(path)))
            .context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("hwbus v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let transport = RusbTransport::new(config.usb.filters.clone(), config.usb.read_timeout())
        .context("Failed to initialize libusb")?;
    let core = Arc::new(SessionCore::new(
        Box::new(transport),
        config.usb.core_options(),
    ));

    if args.list_devices {
        return list_devices_mode(core, args.json).await;
    }

    run(config, core).await
}

/// List devices and exit
async fn list_devices_mode(core: Arc<SessionCore>, json: bool) -> Result<()> {
    let entries = tokio::task::spawn_blocking(move || core.enumerate())
        .await
        .context("Enumeration task failed")?
        .context("Failed to enumerate devices")?;

    if json {
        let text =
            serde_json::to_string_pretty(&entries).context("Failed to serialize device list")?;
        println!("{}", text);
        return Ok(());
    }

    if entries.is_empty() {
        println!("No supported devices found.");
    } else {
        println!("Found {} device(s):\n", entries.len());
        for entry in entries {
            println!(
                "  [{}] {:04x}:{:04x}{}",
                entry.id,
                entry.vendor_id,
                entry.product_id,
                if entry.debug { " (debug link)" } else { "" }
            );
        }
    }

    Ok(())
}

async fn run(config: DaemonConfig, core: Arc<SessionCore>) -> Result<()> {
    let bus = Bus::with_config(config.bus_config());

    let timers = timer::spawn_server(&bus);
    let usb = UsbService::spawn(&bus, core);
    let signer = SignerService::spawn(&bus, config.signer_options());
    let lines = ui::stdin_lines().context("Failed to start stdin reader")?;
    let terminal = TerminalUi::new(lines).spawn(&bus);

    info!("Daemon running, press Ctrl+C to stop");
    signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    info!("Shutting down...");
    bus.shutdown();

    for (name, handle) in [
        ("timer", timers),
        ("usb", usb),
        ("signer", signer),
        ("ui", terminal),
    ] {
        if let Err(e) = handle.await {
            error!("{} service panicked: {:?}", name, e);
        }
    }

    info!("Shutdown complete");
    Ok(())
}
