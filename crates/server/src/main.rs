//! usbipd command-line interface
//!
//! `list`, `bind` and `unbind` manage the persisted share table; `server`
//! runs the USB/IP listener attached to the console (or, on Windows, under
//! the Service Control Manager).

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use common::setup_logging;
use protocol::BusId;
use server::config::ServerConfig;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

const LICENSE_TEXT: &str = "\
usbipd - USB/IP device server
Copyright (C) 2025  the usbipd authors

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.";

#[derive(Parser, Debug)]
#[command(name = "usbipd", version, about = "Share USB devices with USB/IP clients")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, value_name = "PATH", global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand, Debug)]
enum CliCommand {
    /// List present devices and persisted shares
    List,

    /// Mark a device shared so clients can import it
    Bind {
        /// Bus id of the device to share
        #[arg(short = 'b', long = "busid", value_name = "BUSID")]
        bus_id: Option<String>,
        /// Share every present device
        #[arg(short = 'a', long = "all", conflicts_with = "bus_id")]
        all: bool,
    },

    /// Remove shares
    Unbind {
        /// Bus id of the share to remove
        #[arg(short = 'b', long = "busid", value_name = "BUSID")]
        bus_id: Option<String>,
        /// GUID of the share to remove
        #[arg(short = 'g', long = "guid", value_name = "GUID", conflicts_with = "bus_id")]
        guid: Option<Uuid>,
        /// Remove every share
        #[arg(short = 'a', long = "all", conflicts_with_all = ["bus_id", "guid"])]
        all: bool,
    },

    /// Run the USB/IP server attached to this console
    Server {
        /// KEY=VALUE pairs layered over the configuration file
        #[arg(value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Run under the Service Control Manager (Windows only)
        #[cfg(windows)]
        #[arg(long)]
        service: bool,

        /// Install the Windows service and exit
        #[cfg(windows)]
        #[arg(long, conflicts_with = "service")]
        install: bool,

        /// Uninstall the Windows service and exit
        #[cfg(windows)]
        #[arg(long, conflicts_with_all = ["service", "install"])]
        uninstall: bool,
    },

    /// Print license information
    License,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.clone())?;

    match args.command {
        CliCommand::License => {
            println!("{}", LICENSE_TEXT);
            Ok(())
        }
        CliCommand::List => {
            setup_logging(&config.server.log_level)?;
            list(&config)
        }
        CliCommand::Bind { bus_id, all } => {
            setup_logging(&config.server.log_level)?;
            bind(&config, bus_id, all)
        }
        CliCommand::Unbind { bus_id, guid, all } => {
            setup_logging(&config.server.log_level)?;
            unbind(&config, bus_id, guid, all)
        }
        #[cfg(windows)]
        CliCommand::Server {
            overrides,
            service,
            install,
            uninstall,
        } => {
            config.apply_overrides(&overrides)?;
            if install {
                return server::windows::service::install();
            }
            if uninstall {
                return server::windows::service::uninstall();
            }
            if service {
                // The SCM dispatcher blocks its thread and hosts its own
                // runtime inside service_main.
                return tokio::task::spawn_blocking(move || {
                    server::windows::service::run_as_service(config)
                })
                .await?;
            }
            setup_logging(&config.server.log_level)?;
            run_server(config).await
        }
        #[cfg(not(windows))]
        CliCommand::Server { overrides } => {
            config.apply_overrides(&overrides)?;
            setup_logging(&config.server.log_level)?;
            run_server(config).await
        }
    }
}

/// `usbipd server`: run until Ctrl+C, then detach everything in order
async fn run_server(config: ServerConfig) -> Result<()> {
    info!("usbipd {} starting", env!("CARGO_PKG_VERSION"));

    let token = CancellationToken::new();
    let mut serve_task = tokio::spawn(server::serve(config, token.clone()));

    tokio::select! {
        finished = &mut serve_task => finished??,
        _ = signal::ctrl_c() => {
            info!("shutdown requested, detaching clients");
            token.cancel();
            serve_task.await??;
        }
    }
    Ok(())
}

/// `usbipd list`
fn list(config: &ServerConfig) -> Result<()> {
    let registry = server::open_registry(config)?;
    let present = enumerate_host()?;

    println!("Present devices:");
    if present.is_empty() {
        println!("  (none)");
    }
    for dev in &present {
        let marker = if registry.attached_to(&dev.bus_id).is_some() {
            "attached"
        } else if registry.is_shared(&dev.bus_id) {
            "shared"
        } else {
            "not shared"
        };
        println!(
            "  {:<12} {:04x}:{:04x}  {}",
            dev.bus_id.as_str(),
            dev.vendor_id,
            dev.product_id,
            marker
        );
    }

    let absent: Vec<_> = registry
        .all_shared()
        .into_iter()
        .filter(|s| !present.iter().any(|d| d.bus_id == s.bus_id))
        .collect();
    if !absent.is_empty() {
        println!("\nPersisted shares (device not present):");
        for share in absent {
            println!("  {:<12} {}", share.bus_id.as_str(), share.guid);
        }
    }
    Ok(())
}

/// `usbipd bind`
fn bind(config: &ServerConfig, bus_id: Option<String>, all: bool) -> Result<()> {
    let registry = server::open_registry(config)?;
    let present = enumerate_host()?;

    let targets: Vec<protocol::ExportedDevice> = if all {
        present
    } else {
        let bus_id: BusId = bus_id
            .context("either --busid or --all is required")?
            .parse()?;
        match present.into_iter().find(|d| d.bus_id == bus_id) {
            Some(dev) => vec![dev],
            None => bail!("bus id {} not found", bus_id),
        }
    };

    for dev in targets {
        let name = format!("{:04x}:{:04x}", dev.vendor_id, dev.product_id);
        let guid = registry.bind(dev.bus_id.clone(), name)?;
        println!("{}: shared ({})", dev.bus_id, guid);
    }
    Ok(())
}

/// `usbipd unbind`
fn unbind(
    config: &ServerConfig,
    bus_id: Option<String>,
    guid: Option<Uuid>,
    all: bool,
) -> Result<()> {
    let registry = server::open_registry(config)?;

    if all {
        let count = registry.unbind_all()?;
        println!("{} share(s) removed", count);
        return Ok(());
    }
    if let Some(guid) = guid {
        match registry.unbind_guid(&guid)? {
            Some(bus_id) => println!("{}: unshared", bus_id),
            None => bail!("no share with guid {}", guid),
        }
        return Ok(());
    }
    let bus_id: BusId = bus_id
        .context("one of --busid, --guid or --all is required")?
        .parse()?;
    if registry.unbind(&bus_id)? {
        println!("{}: unshared", bus_id);
        Ok(())
    } else {
        bail!("bus id {} not found", bus_id)
    }
}

#[cfg(windows)]
fn enumerate_host() -> Result<Vec<protocol::ExportedDevice>> {
    use server::enumerator::DeviceEnumerator;
    Ok(server::windows::WinEnumerator::new().enumerate()?)
}

#[cfg(not(windows))]
fn enumerate_host() -> Result<Vec<protocol::ExportedDevice>> {
    bail!("device enumeration requires a Windows host")
}
