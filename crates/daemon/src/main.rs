//! usb-tether daemon
//!
//! Binds USB CDC-ECM and RNDIS network functions to host TAP interfaces.
//! USB work runs on its own thread, the sessions on the driver worker
//! thread, and the Tokio runtime only waits for signals and driver events.

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use daemon::config::DaemonConfig;
use daemon::net::TapStack;
use daemon::service;
use daemon::usb::{DeviceManager, spawn_usb_manager};
use driver::{
    DriverBridge, DriverEvent, FramePool, SessionId, create_driver_bridge, spawn_driver_worker,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal;
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tracing::{debug, error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "usb-tetherd")]
#[command(
    author,
    version,
    about = "usb-tether daemon - USB network functions as host interfaces"
)]
#[command(long_about = "
Binds USB CDC-ECM and RNDIS network functions (phones, tethering dongles,
gadget-mode boards) to host TAP interfaces, one per device.

EXAMPLES:
    # Run with default config
    usb-tetherd

    # Run with custom config
    usb-tetherd --config /path/to/daemon.toml

    # Show which attached devices would be bound
    usb-tetherd --list-devices

    # Run with debug logging
    usb-tetherd --log-level debug

CONFIGURATION:
    The daemon looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usb-tether/daemon.toml
    3. /etc/usb-tether/daemon.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Run as systemd service (readiness and watchdog notifications)
    #[arg(long)]
    service: bool,

    /// List USB devices and exit
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
        let config = DaemonConfig::default();
        let path = DaemonConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = if let Some(ref path) = args.config {
        DaemonConfig::load(Some(path.clone())).context("Failed to load configuration")?
    } else {
        DaemonConfig::load_or_default()
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.daemon.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    info!("usb-tether daemon v{}", env!("CARGO_PKG_VERSION"));
    info!("Log level: {}", log_level);

    if args.list_devices {
        return list_devices_mode(&config);
    }

    let service_mode = args.service || config.daemon.service_mode;
    if service_mode && service::is_systemd() {
        info!("Running under systemd");
    }

    run(config, service_mode).await
}

/// Print what a scan finds and exit
fn list_devices_mode(config: &DaemonConfig) -> Result<()> {
    // Scanning never talks to the driver, so no worker is started
    let (bridge, _worker) = create_driver_bridge(1);
    let manager = DeviceManager::new(
        config.device_table(),
        config.usb.filters.clone(),
        config.transport_config(),
        bridge.command_sender(),
    )
    .context("Failed to initialize USB")?;

    let devices = manager.scan().context("Failed to enumerate USB devices")?;
    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  [{}] {:04x}:{:04x} - {} {}",
            device.key,
            device.vendor_id,
            device.product_id,
            device
                .manufacturer
                .as_deref()
                .unwrap_or("Unknown Manufacturer"),
            device.product.as_deref().unwrap_or("Unknown Product")
        );
        match device.function {
            Some((framing, interface)) if device.filtered => println!(
                "      {} on interface {} (excluded by filter)",
                framing, interface
            ),
            Some((framing, interface)) => {
                println!("      {} on interface {}", framing, interface)
            }
            None => println!("      no network function"),
        }
        println!();
    }

    Ok(())
}

async fn run(config: DaemonConfig, service_mode: bool) -> Result<()> {
    let pool = FramePool::new(config.driver.pool_budget_bytes);
    let stack = TapStack::new(
        &config.network.interface_prefix,
        config.network.mtu,
        pool.clone(),
    )
    .context("Failed to initialize network stack")?;

    let (bridge, worker) = create_driver_bridge(config.driver.command_queue);
    let driver_handle = spawn_driver_worker(config.driver_config(), stack, pool.clone(), worker)
        .context("Failed to spawn driver worker")?;

    let manager = DeviceManager::new(
        config.device_table(),
        config.usb.filters.clone(),
        config.transport_config(),
        bridge.command_sender(),
    )
    .context("Failed to initialize USB")?;
    let usb_stop = Arc::new(AtomicBool::new(false));
    let usb_handle =
        spawn_usb_manager(manager, usb_stop.clone()).context("Failed to spawn USB thread")?;

    let watchdog_handle = if service_mode {
        service::spawn_watchdog_task()
    } else {
        None
    };
    service::notify_ready().context("Failed to notify systemd ready")?;
    service::notify_status("Running - waiting for devices")
        .context("Failed to send status to systemd")?;

    info!("Press Ctrl+C to shutdown");
    let result = event_loop(&bridge).await;

    service::notify_stopping().context("Failed to notify systemd stopping")?;
    if let Some(handle) = watchdog_handle {
        handle.abort();
    }

    // USB first so no new attach races the shutdown
    usb_stop.store(true, Ordering::Release);
    let mut manager = tokio::task::spawn_blocking(move || usb_handle.join())
        .await
        .context("USB thread join task failed")?
        .map_err(|_| anyhow::anyhow!("USB thread panicked"))?;

    info!("Draining sessions...");
    if let Err(e) = bridge.shutdown().await {
        warn!("Failed to send driver shutdown: {}", e);
    }
    match tokio::task::spawn_blocking(move || driver_handle.join()).await {
        Ok(Ok(lifecycle)) => {
            if !lifecycle.is_idle() {
                warn!(
                    "Driver stopped with {} transfers still outstanding",
                    lifecycle.outstanding_transfers()
                );
            }
        }
        Ok(Err(_)) => error!("Driver worker panicked"),
        Err(e) => error!("Driver join task failed: {}", e),
    }

    // Transports are gone now, so every handle can be closed
    manager.shutdown();

    let stats = pool.stats();
    info!(
        "Buffer pool: {} allocations, {} outstanding, {} bytes in use",
        stats.allocations,
        stats.outstanding(),
        stats.in_use
    );
    info!("Shutdown complete");
    result
}

/// Log driver events until a shutdown signal arrives
async fn event_loop(bridge: &DriverBridge) -> Result<()> {
    let mut sigterm = unix_signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let mut active: HashSet<SessionId> = HashSet::new();

    loop {
        tokio::select! {
            result = signal::ctrl_c() => {
                match result {
                    Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
                    Err(e) => error!("Error waiting for Ctrl+C: {}", e),
                }
                return Ok(());
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down gracefully...");
                return Ok(());
            }
            event = bridge.recv_event() => {
                let event = event.context("Driver worker stopped unexpectedly")?;
                handle_event(event, &mut active);
                let status = format!("Running - {} active session(s)", active.len());
                if let Err(e) = service::notify_status(&status) {
                    debug!("Failed to send status to systemd: {:#}", e);
                }
            }
        }
    }
}

fn handle_event(event: DriverEvent, active: &mut HashSet<SessionId>) {
    match event {
        DriverEvent::SessionActive {
            session,
            device,
            interface,
        } => {
            info!("{}: {} is up on {}", session, device, interface);
            active.insert(session);
        }
        DriverEvent::SessionFailed {
            session,
            device,
            error,
        } => {
            error!("{}: {} failed: {}", session, device, error);
            active.remove(&session);
        }
        DriverEvent::SessionReleased {
            session,
            device,
            stats,
        } => {
            info!(
                "{}: {} released (rx {} packets / {} bytes, tx {} packets / {} bytes, {} dropped)",
                session,
                device,
                stats.rx_packets,
                stats.rx_bytes,
                stats.tx_packets,
                stats.tx_bytes,
                stats.rx_dropped + stats.tx_dropped
            );
            active.remove(&session);
        }
        DriverEvent::AttachRejected { device, error } => {
            warn!("{}: attach rejected: {}", device, error);
        }
    }
}
