//! aoa-echo host
//!
//! Switches attached Android phones into accessory mode and echoes whatever
//! the accessory app sends back to it.

use anyhow::{Context, Result};
use clap::Parser;
use common::{UsbBackend, setup_logging};
use host::config::{self, HostConfig};
use host::{AccessoryHost, HostOptions, RusbBackend};
use protocol::DeviceClass;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "aoa-echo-host")]
#[command(
    author,
    version,
    about = "AOA echo host - switch phones into accessory mode and echo their data"
)]
#[command(long_about = "
Watches the USB bus for Android phones, negotiates them into Android Open
Accessory mode and echoes every byte the accessory sends straight back.

EXAMPLES:
    # Run with default config
    aoa-echo-host

    # Run with custom config
    aoa-echo-host --config /path/to/host.toml

    # List matching USB devices without starting the host
    aoa-echo-host --list-devices

    # Run with debug logging
    aoa-echo-host --log-level debug

CONFIGURATION:
    The host looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/aoa-echo/host.toml
    3. /etc/aoa-echo/host.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// List devices matching either watch filter and exit
    #[arg(long)]
    list_devices: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = HostConfig::default();
        let path = HostConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        config::load_config(path).context("Failed to load configuration")?
    } else {
        HostConfig::load_or_default()
    };

    let log_level = args.log_level.as_deref().unwrap_or(&config.host.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("aoa-echo host v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    let options = HostOptions::from_config(&config)?;
    let backend = Arc::new(RusbBackend::new().context("Failed to initialize libusb")?);

    if args.list_devices {
        return list_devices_mode(backend.as_ref(), &options);
    }

    run(backend, options).await
}

/// List devices matching either filter and exit
fn list_devices_mode(backend: &dyn UsbBackend, options: &HostOptions) -> Result<()> {
    info!("Listing USB devices...");

    for (label, filter) in [
        ("switchable", options.switchable),
        ("accessory", options.accessory),
    ] {
        let devices = backend
            .list_devices(&filter)
            .with_context(|| format!("Failed to enumerate {} devices", label))?;

        if devices.is_empty() {
            println!("No {} devices ({}) found.", label, filter);
            continue;
        }

        println!("Found {} {} device(s) ({}):\n", devices.len(), label, filter);
        for device in devices {
            let mode = match DeviceClass::classify(&device) {
                DeviceClass::Accessory => "accessory mode",
                DeviceClass::Switchable => "not in accessory mode",
            };
            println!(
                "  {:04x}:{:04x} - serial {} ({})",
                device.vendor_id,
                device.product_id,
                device.serial_or_unknown(),
                mode
            );
            println!("      Bus {:03} Path {}", device.bus_number, device.device_path);
            println!();
        }
    }

    Ok(())
}

/// Run the host until Ctrl+C
async fn run(backend: Arc<RusbBackend>, options: HostOptions) -> Result<()> {
    let host = Arc::new(AccessoryHost::new(backend, options).context("Invalid accessory strings")?);
    host.start().context("Failed to start accessory host")?;

    info!("Press Ctrl+C to shutdown");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        Err(e) => {
            error!("Error waiting for Ctrl+C: {}", e);
        }
    }

    // Stopping joins device threads; keep it off the async workers
    let stopped = tokio::task::spawn_blocking(move || host.stop())
        .await
        .context("Shutdown task failed")?;

    match stopped {
        Ok(count) => info!("Host shutdown complete, {} devices released", count),
        Err(e) => error!("Error stopping host: {}", e),
    }
    Ok(())
}
