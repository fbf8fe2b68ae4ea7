mod host;
mod link_config;
mod peer;

use std::net::IpAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{error, info};

use link_config::CliConfig;

#[derive(Parser)]
#[command(name = "gba-link", about = "GBA link cable bridge for the SI bus")]
struct Args {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write the effective config back to the config file
    #[arg(long, global = true)]
    save_config: bool,

    /// Enable debug logging of every transfer
    #[arg(long, global = true)]
    debug: bool,

    /// Data channel TCP port
    #[arg(long, global = true)]
    data_port: Option<u16>,

    /// Clock sync channel TCP port
    #[arg(long, global = true)]
    clock_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Listen for peers and drive the SI ports with a minimal poll loop
    Host {
        /// Address to bind the listeners to
        #[arg(long)]
        bind: Option<IpAddr>,

        /// SI ports to drive (repeatable)
        #[arg(long = "port")]
        ports: Vec<u8>,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Play the handheld side of one port
    Peer {
        /// SI port to attach to
        #[arg(long, default_value_t = 0)]
        port: u8,

        /// Host to connect to
        #[arg(long)]
        host: Option<String>,

        /// Stop after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let config_path = args.config.clone().unwrap_or_else(link_config::default_config_path);
    let mut config = link_config::load_from_file(&config_path);
    apply_overrides(&mut config, &args);

    if args.save_config {
        match link_config::save_to_file(&config_path, &config) {
            Ok(()) => info!("Saved config to {}", config_path.display()),
            Err(e) => error!("Failed to save config {}: {e}", config_path.display()),
        }
    }

    let result = match args.command {
        Command::Host { seconds, .. } => host::run(&config, seconds),
        Command::Peer { port, seconds, .. } => peer::run(&config, port, seconds),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn apply_overrides(config: &mut CliConfig, args: &Args) {
    if let Some(port) = args.data_port {
        config.link.data_port = port;
    }
    if let Some(port) = args.clock_port {
        config.link.clock_port = port;
    }
    match &args.command {
        Command::Host { bind, ports, .. } => {
            if let Some(bind) = bind {
                config.link.bind_address = *bind;
            }
            if !ports.is_empty() {
                config.ports = ports.clone();
            }
        }
        Command::Peer { host, .. } => {
            if let Some(host) = host {
                config.host = host.clone();
            }
        }
    }
}
