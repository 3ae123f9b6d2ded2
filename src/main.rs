//! rust_visa command-line tool
//!
//! Lists attached instruments and sends one-off SCPI commands.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};

use rust_visa::config::{Settings, DEFAULT_CONFIG_PATH};
use rust_visa::transport::TransportOptions;
use rust_visa::{logging, ResourceManager, ScpiTransportExt};

#[derive(Parser)]
#[command(name = "rust_visa", version, about = "Talk to VISA instruments over USB-TMC, serial and TCP/IP")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List attached resources
    List {
        /// VISA glob, e.g. `USB?*::INSTR`
        query: Option<String>,
    },
    /// Send a command and print the reply
    Query { resource: String, command: String },
    /// Print the instrument identity (`*IDN?`)
    Idn { resource: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    logging::init(&settings.logging);
    debug!(config = %cli.config.display(), "Settings loaded");

    let options = TransportOptions {
        serial: settings.serial.clone(),
        ..TransportOptions::with_settings(settings.transport.clone())
    };
    let manager = ResourceManager::new(options);

    match cli.command {
        Command::List { query } => {
            for resource in manager.list_resources(query.as_deref()).await? {
                println!("{}", resource);
            }
        }
        Command::Query { resource, command } => {
            let transport = manager.open(&resource).await?;
            let reply = transport.lock().await.query(&command, None).await;
            manager.close_all().await;
            println!("{}", reply.with_context(|| format!("querying {}", resource))?);
        }
        Command::Idn { resource } => {
            let transport = manager.open(&resource).await?;
            let identity = transport.lock().await.identify().await;
            manager.close_all().await;
            let identity = identity.with_context(|| format!("identifying {}", resource))?;
            info!(resource = %resource, model = %identity.model, "Identified instrument");
            println!("manufacturer: {}", identity.manufacturer);
            println!("model:        {}", identity.model);
            println!("serial:       {}", identity.serial_number);
            println!("firmware:     {}", identity.firmware);
        }
    }

    Ok(())
}
