//! Runtime configuration: lifecycle policy knobs and the transcoder command.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use log::info;

/// Default port the HTTP gateway binds to.
///
/// `http://127.0.0.1:{port}/stream/{id}` is baked into generated player
/// configuration, so the default is part of the external contract.
pub const DEFAULT_PORT: u16 = 3000;

/// Placeholder in the transcoder argument template that is replaced with the
/// upstream playlist URL.
const URL_PLACEHOLDER: &str = "{url}";

/// Policy knobs for session lifecycle and fan-out buffering.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// How long a session with zero subscribers is kept alive before its
    /// pipeline is torn down. A reconnect within this window reuses the
    /// running pipeline without an audible gap.
    pub idle_grace: Duration,
    /// Maximum subprocess (re)start attempts before a pipeline is failed.
    pub spawn_attempts: u32,
    /// Base delay between restart attempts, doubled per attempt.
    pub backoff_base: Duration,
    /// Upper bound on the restart delay.
    pub backoff_max: Duration,
    /// A pipeline that has produced output for at least this long gets its
    /// attempt counter reset, so a long-lived stream is not condemned by
    /// failures from hours ago.
    pub retry_reset_after: Duration,
    /// Fan-out channel capacity, in chunks. A subscriber that falls this far
    /// behind is disconnected instead of stalling the others.
    pub broadcast_capacity: usize,
    /// Maximum number of concurrent sessions (stations being transcoded).
    pub max_sessions: usize,
    /// How long to wait for a killed subprocess to be reaped.
    pub stop_grace: Duration,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            idle_grace: Duration::from_secs(30),
            spawn_attempts: 5,
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_secs(10),
            retry_reset_after: Duration::from_secs(30),
            broadcast_capacity: 256,
            max_sessions: 16,
            stop_grace: Duration::from_secs(3),
        }
    }
}

/// The external transcoder command line.
///
/// `{url}` in the argument template is substituted with the upstream playlist
/// URL at spawn time. The default template tells FFmpeg to read the playlist,
/// drop video, and emit a continuous 128k MP3 stream on stdout with
/// low-latency flags.
#[derive(Debug, Clone)]
pub struct TranscoderConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl TranscoderConfig {
    /// Standard FFmpeg invocation for playlist-to-MP3 transcoding.
    pub fn ffmpeg(program: PathBuf) -> Self {
        let args = [
            "-reconnect",
            "1",
            "-reconnect_streamed",
            "1",
            "-reconnect_delay_max",
            "5",
            "-i",
            URL_PLACEHOLDER,
            "-vn",
            "-acodec",
            "libmp3lame",
            "-ab",
            "128k",
            "-ar",
            "44100",
            "-ac",
            "2",
            "-f",
            "mp3",
            "-fflags",
            "+nobuffer+discardcorrupt",
            "-flags",
            "low_delay",
            "-flush_packets",
            "1",
            "pipe:1",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        Self { program, args }
    }

    /// Argument vector with the upstream URL substituted in.
    pub fn build_args(&self, upstream_url: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| {
                if a == URL_PLACEHOLDER {
                    upstream_url.to_string()
                } else {
                    a.clone()
                }
            })
            .collect()
    }

    /// Locate an FFmpeg binary: a bundled directory first, then `PATH`.
    pub fn detect(bundled_dir: Option<&Path>) -> Option<PathBuf> {
        #[cfg(windows)]
        let binary = "ffmpeg.exe";
        #[cfg(not(windows))]
        let binary = "ffmpeg";

        if let Some(dir) = bundled_dir {
            for candidate in [dir.join("binaries").join(binary), dir.join(binary)] {
                if candidate.exists() {
                    info!("[Config] using bundled FFmpeg: {:?}", candidate);
                    return Some(candidate);
                }
            }
        }

        if ffmpeg_in_path(binary) {
            info!("[Config] using FFmpeg from PATH");
            return Some(PathBuf::from(binary));
        }

        None
    }
}

/// Check whether `ffmpeg -version` runs from `PATH`.
fn ffmpeg_in_path(binary: &str) -> bool {
    Command::new(binary)
        .arg("-version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}
