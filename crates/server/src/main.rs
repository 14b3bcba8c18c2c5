mod config;
mod simulation;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use config::ServerConfig;
use simulation::Arena;
use steelnet::{ServerGameLoop, UdpTransport};

#[derive(Parser)]
#[command(name = "steelnet-server")]
#[command(about = "Steelnet replication demo server")]
struct Args {
    #[arg(short, long, help = "TOML file with server and network settings")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    bind: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    tick_rate: Option<u32>,

    #[arg(long, help = "Log network stats every N frames")]
    stats_interval: Option<u32>,

    #[arg(long, help = "Disable three-baseline prediction in snapshots")]
    no_prediction: bool,

    #[arg(long, help = "Stop after this many seconds")]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(tick_rate) = args.tick_rate {
        config.network.server_tick_rate = tick_rate;
    }
    if let Some(interval) = args.stats_interval {
        config.network.stats_interval = interval;
    }
    if args.no_prediction {
        config.network.network_prediction = false;
    }

    config.validate()?;

    let bind: SocketAddr = format!("{}:{}", config.bind, config.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", config.bind, config.port))?;
    let transport = UdpTransport::host(bind, config.udp.clone());
    info!("Hosting on {bind}");

    let arena = Arena::new(
        config.level.clone(),
        config.orb_count,
        config.projectile_interval_ticks,
        config.network.server_tick_rate,
    );
    let mut game = ServerGameLoop::new(arena, Box::new(transport), config.network.clone())?;

    let started = Instant::now();
    let deadline = args.duration.map(Duration::from_secs);
    game.start(0);
    loop {
        let elapsed = started.elapsed();
        if deadline.is_some_and(|d| elapsed >= d) {
            break;
        }
        game.update(elapsed.as_millis() as u64);
        thread::sleep(Duration::from_millis(1));
    }

    info!(
        "Server shutting down at tick {} with {} players",
        game.tick(),
        game.game().player_count()
    );
    game.shutdown();
    Ok(())
}
