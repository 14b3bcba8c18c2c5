mod bot;
mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use bot::Bot;
use config::ClientConfig;
use steelnet::{ClientGameLoop, ClientState, UdpTransport};

#[derive(Parser)]
#[command(name = "steelnet-client")]
#[command(about = "Headless Steelnet replication client")]
struct Args {
    #[arg(
        short,
        long,
        help = "Server address to connect to (e.g., 127.0.0.1:27015)"
    )]
    server: Option<String>,

    #[arg(short, long, help = "TOML file with client and network settings")]
    config: Option<PathBuf>,

    #[arg(long, help = "Log network stats every N frames")]
    stats_interval: Option<u32>,

    #[arg(long, help = "Leave after this many seconds")]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::default(),
    };
    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(interval) = args.stats_interval {
        config.network.stats_interval = interval;
    }

    config.validate()?;

    let server: SocketAddr = config
        .server
        .parse()
        .with_context(|| format!("invalid server address {}", config.server))?;
    let transport = UdpTransport::client(server, config.udp.clone());
    let mut game = ClientGameLoop::new(
        Bot::new(config.report_interval),
        Box::new(transport),
        config.network.clone(),
        config.reconciliation.clone(),
    )?;

    info!("Connecting to {server}");
    let started = Instant::now();
    let deadline = args.duration.map(Duration::from_secs);
    game.start(0);
    loop {
        let elapsed = started.elapsed();
        if deadline.is_some_and(|d| elapsed >= d) {
            info!("Time is up");
            break;
        }
        game.update(elapsed.as_millis() as u64);
        if game.state() == Some(ClientState::Leaving) {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }

    game.shutdown();
    info!("Client stopped");
    Ok(())
}
