//! radio-gateway: a local HTTP server that turns segmented radio playlists
//! (m3u8) into continuous MP3 streams.
//!
//! Clients that only understand plain HTTP audio — in-game radio players,
//! preview widgets — fetch `http://127.0.0.1:{port}/stream/{station_id}`;
//! the gateway keeps one FFmpeg pipeline per station and fans its output out
//! to every listener.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};

mod config;
mod gateway;
mod logging;
mod metrics;
mod registry;
mod stream;
mod web;

use config::{StreamConfig, TranscoderConfig, DEFAULT_PORT};
use gateway::StreamGateway;
use registry::{Station, StationRegistry};
use stream::SessionManager;

/// radio-gateway - playlist-to-MP3 streaming gateway
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to serve streams on
    #[arg(short, long)]
    port: Option<u16>,

    /// Stations JSON file produced by the catalog crawler
    #[arg(short, long)]
    stations: Option<PathBuf>,

    /// Path to the FFmpeg binary (auto-detected when omitted)
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Seconds a stream with no listeners is kept alive
    #[arg(long)]
    idle_grace: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    transcoder: TranscoderSection,
    #[serde(default)]
    stream: StreamSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    port: Option<u16>,
    stations: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct TranscoderSection {
    program: Option<String>,
    /// Full argument template; `{url}` is replaced with the upstream URL.
    args: Option<Vec<String>>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct StreamSection {
    idle_grace_secs: Option<u64>,
    spawn_attempts: Option<u32>,
    backoff_base_ms: Option<u64>,
    backoff_max_ms: Option<u64>,
    broadcast_capacity: Option<usize>,
    max_sessions: Option<usize>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

fn load_stations(path: &PathBuf) -> Result<Vec<Station>, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let stations: Vec<Station> = serde_json::from_str(&contents)?;
    Ok(stations)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file: explicit path > auto-detect > defaults.
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("radio-gateway.toml");
        default_path.exists().then_some(default_path)
    });
    let file_config = if let Some(config_path) = &config_path {
        match load_config(config_path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", config_path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        }
    } else {
        ConfigFile::default()
    };

    // Command line takes precedence over the config file.
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    logging::init(
        &log_dir,
        log_retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let mut stream_config = StreamConfig::default();
    if let Some(secs) = args.idle_grace.or(file_config.stream.idle_grace_secs) {
        stream_config.idle_grace = Duration::from_secs(secs);
    }
    if let Some(attempts) = file_config.stream.spawn_attempts {
        stream_config.spawn_attempts = attempts.max(1);
    }
    if let Some(ms) = file_config.stream.backoff_base_ms {
        stream_config.backoff_base = Duration::from_millis(ms);
    }
    if let Some(ms) = file_config.stream.backoff_max_ms {
        stream_config.backoff_max = Duration::from_millis(ms);
    }
    if let Some(capacity) = file_config.stream.broadcast_capacity {
        stream_config.broadcast_capacity = capacity.max(1);
    }
    if let Some(max) = file_config.stream.max_sessions {
        stream_config.max_sessions = max.max(1);
    }

    let ffmpeg = args
        .ffmpeg
        .or(file_config.transcoder.program.map(PathBuf::from))
        .or_else(|| TranscoderConfig::detect(None))
        .unwrap_or_else(|| {
            warn!("[Main] FFmpeg not found, falling back to 'ffmpeg' in PATH");
            PathBuf::from("ffmpeg")
        });
    let mut transcoder = TranscoderConfig::ffmpeg(ffmpeg);
    if let Some(custom_args) = file_config.transcoder.args {
        transcoder.args = custom_args;
    }

    let registry = Arc::new(StationRegistry::new());
    let stations_path = args
        .stations
        .or(file_config.server.stations.map(PathBuf::from));
    match &stations_path {
        Some(path) => match load_stations(path) {
            Ok(stations) => registry.load(stations).await,
            Err(e) => {
                warn!("[Main] failed to load stations from {:?}: {}", path, e);
            }
        },
        None => warn!("[Main] no stations file given; every stream request will 404"),
    }

    let port = args.port.or(file_config.server.port).unwrap_or(DEFAULT_PORT);
    let manager = SessionManager::new(Arc::clone(&registry), stream_config, transcoder);
    let mut gateway = StreamGateway::new(port, Arc::clone(&registry), manager);

    gateway.start().await?;
    let status = gateway.status().await;
    info!(
        "[Main] serving {} station(s) on http://127.0.0.1:{}",
        status.total_stations, status.port
    );

    tokio::signal::ctrl_c().await?;
    info!("[Main] shutting down");
    gateway.stop().await?;

    Ok(())
}
