#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bifrost_lb_lib::runtime::StaticInterfaceResolver;
use bifrost_lb_lib::{load_from_path, ControlPlane, MapSet};

#[derive(Parser, Debug)]
#[command(author, version, about = "eBPF L4 load balancer control plane")]
struct Cli {
    /// Path to configuration TOML file
    #[arg(short, long, value_name = "FILE", default_value = "config/bifrost.toml")]
    config: PathBuf,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    let config = match load_from_path(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(%err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    info!(proxies = config.proxies.len(), "configuration loaded");
    if cli.check {
        info!("configuration is valid");
        return;
    }

    // The eBPF loader wires the real kernel maps in here; without it the
    // control plane runs against in-process maps.
    let maps = MapSet::in_memory();
    let plane = match ControlPlane::new(config, maps, Arc::new(StaticInterfaceResolver::new())) {
        Ok(plane) => plane,
        Err(err) => {
            error!(%err, "control plane construction failed");
            std::process::exit(1);
        }
    };

    if let Err(err) = plane.start().await {
        error!(%err, "control plane start failed");
        std::process::exit(1);
    }

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(%err, "signal wait failed");
    }
    plane.shutdown().await;
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
