//! Peripheral GW - command line gateway
//!
//! Loads the device configuration, keeps every configured peripheral alive and
//! logs the triggers they produce.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peripheral_gw::config::{self, ConfigWatcher};
use peripheral_gw::devices::hid;
use peripheral_gw::{midi, DeviceTrigger, Manager};

/// Peripheral Gateway - bridge control-surface hardware to trigger events
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available MIDI ports and HID devices
    #[arg(long)]
    list_ports: bool,

    /// Print the configuration manifest of every device type
    #[arg(long)]
    manifest: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    init_logging(&args.log_level)?;

    if args.list_ports {
        list_ports_formatted();
        return Ok(());
    }

    if args.manifest {
        let manifests = Manager::config_manifests();
        println!("{}", serde_json::to_string_pretty(&manifests)?);
        return Ok(());
    }

    info!("Starting Peripheral GW...");
    info!("Configuration file: {}", args.config);

    // Load configuration with hot-reload watcher
    let (config_watcher, initial_config) = ConfigWatcher::new(args.config.clone()).await?;
    info!("Configuration loaded successfully with hot-reload enabled");

    let manager = start_manager((*initial_config).clone()).await?;

    run_app(manager, config_watcher, shutdown_signal()).await?;

    info!("Peripheral GW shutdown complete");
    Ok(())
}

async fn start_manager(config: config::AppConfig) -> Result<Manager> {
    let manager = Manager::new(config);
    manager.subscribe_triggers(Arc::new(|trigger: &DeviceTrigger| {
        match &trigger.event.arguments {
            Some(args) => info!(
                "Trigger {}/{} {:?}",
                trigger.device_id, trigger.event.trigger_id, args
            ),
            None => info!("Trigger {}/{}", trigger.device_id, trigger.event.trigger_id),
        }
    }));
    manager.init().await?;
    Ok(manager)
}

async fn run_app(
    mut manager: Manager,
    mut config_watcher: ConfigWatcher,
    shutdown: impl std::future::Future<Output = ()>,
) -> Result<()> {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(new_config) = config_watcher.next_config() => {
                info!("Configuration file changed, restarting devices...");
                manager.destroy().await;
                match start_manager(new_config).await {
                    Ok(next) => {
                        manager = next;
                        info!("Configuration reloaded ({} device(s) active)", manager.device_ids().len());
                    }
                    Err(e) => {
                        warn!("Failed to restart device manager: {:#}", e);
                        break;
                    }
                }
            }

            _ = &mut shutdown => {
                info!("Shutdown signal received, stopping");
                break;
            }
        }
    }

    info!("Shutting down...");
    if let Err(e) = manager.clear_feedback_all().await {
        warn!("{}", e);
    }
    manager.destroy().await;
    info!("All devices released");

    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
}

fn list_ports_formatted() {
    use colored::*;

    println!("\n{}", "=== Available MIDI Ports ===".bold().cyan());

    for (title, ports) in [
        ("Input Ports:", midi::input_port_names()),
        ("Output Ports:", midi::output_port_names()),
    ] {
        println!("\n{}", title.bold());
        match ports {
            Ok(ports) if ports.is_empty() => println!("  {}", "No ports found".dimmed()),
            Ok(ports) => {
                for port in ports {
                    println!("  {}", port);
                }
            }
            Err(e) => println!("  {} {}", "[ERROR]".red(), e),
        }
    }

    println!("\n{}", "=== Available HID Devices ===".bold().cyan());

    match hid::list_devices() {
        Ok(devices) if devices.is_empty() => println!("  {}", "No HID devices found".dimmed()),
        Ok(devices) => {
            for device in devices {
                let vid = device.vendor_id;
                let marker = if vid == peripheral_gw::devices::streamdeck::ELGATO_VENDOR_ID {
                    "[STREAMDECK]".green()
                } else if vid == peripheral_gw::devices::xkeys::XKEYS_VENDOR_ID {
                    "[XKEYS]".green()
                } else {
                    "[OTHER]".dimmed()
                };
                println!(
                    "  {} {:04x}:{:04x} {} {}",
                    marker,
                    vid,
                    device.product_id,
                    device.product.as_deref().unwrap_or("unknown").bright_white(),
                    device
                        .serial
                        .as_deref()
                        .map(|s| format!("(serial {})", s))
                        .unwrap_or_default()
                        .dimmed()
                );
            }
        }
        Err(e) => println!("  {} {}", "[ERROR]".red(), e),
    }

    println!();
}
