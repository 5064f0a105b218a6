//! Logging: console plus daily-rotated file output with retention cleanup.
//!
//! Code throughout the gateway uses the `log` macros; they are bridged into
//! `tracing` so both sinks share one subscriber.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_PREFIX: &str = "radio-gateway.log";

/// Initialize logging.
///
/// `verbose` forces debug level; otherwise `level` (from the config file)
/// applies, and `RUST_LOG` overrides both.
pub fn init(
    log_dir: &Path,
    retention_days: u64,
    verbose: bool,
    level: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    fs::create_dir_all(log_dir)?;
    clean_old_logs(log_dir, retention_days)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    // The guard must outlive the process or buffered lines are lost.
    let _ = Box::leak(Box::new(Arc::new(guard)));

    let default_level = if verbose {
        "debug"
    } else {
        level.unwrap_or("info")
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(io::stdout)
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_timer(LocalTimer),
        )
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_timer(LocalTimer),
        );

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| format!("failed to set default subscriber: {}", e))?;
    tracing_log::LogTracer::init().map_err(|e| format!("failed to initialize LogTracer: {}", e))?;

    Ok(())
}

/// Delete rotated log files older than `retention_days`.
fn clean_old_logs(log_dir: &Path, retention_days: u64) -> io::Result<()> {
    if !log_dir.exists() {
        return Ok(());
    }

    let cutoff = Local::now() - chrono::Duration::days(retention_days as i64);
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        let path = entry.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.contains(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !path.is_file() || !is_log {
            continue;
        }

        let modified = match entry.metadata().and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(_) => continue,
        };
        let modified: chrono::DateTime<Local> = modified.into();
        if modified < cutoff {
            if let Err(e) = fs::remove_file(&path) {
                eprintln!("failed to remove old log file {:?}: {}", path, e);
            }
        }
    }

    Ok(())
}

/// Local-time timestamps in both sinks.
#[derive(Debug, Clone, Copy)]
struct LocalTimer;

impl fmt::time::FormatTime for LocalTimer {
    fn format_time(&self, w: &mut fmt::format::Writer) -> std::fmt::Result {
        write!(w, "{}", Local::now().format("%Y-%m-%dT%H:%M:%S%.6f"))
    }
}
