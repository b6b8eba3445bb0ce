// src/logging.rs
//
// Subscriber setup for the bridge.
// Every line carries an `HH:MM:SS.mmm` local timestamp. With a log directory
// configured, output goes to both stderr and a timestamped file, and a
// `canbridge.log` symlink (Unix only) points at the newest file.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

use crate::error::{BridgeError, Result};

const LOG_LINK_NAME: &str = "canbridge.log";
const TIME_FORMAT: &str = "%H:%M:%S%.3f";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Level or filter directives; `RUST_LOG` wins when set
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            log_dir: None,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Result<()> {
        level_filter(&self.level).map(|_| ())
    }
}

fn level_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level)
        .map_err(|e| BridgeError::config(format!("invalid log level {:?}: {}", level, e)))
}

/// Install the global subscriber. Returns the log file path when file
/// logging is enabled. Fails if a subscriber is already installed.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<PathBuf>> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => level_filter(&config.level)?,
    };
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()));

    let Some(dir) = config.log_dir.as_deref() else {
        builder
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| BridgeError::config(format!("failed to install logger: {}", e)))?;
        return Ok(None);
    };

    let log_file = open_log_file(dir)?;
    builder
        .with_ansi(false)
        .with_writer(std::io::stderr.and(Mutex::new(log_file.file)))
        .try_init()
        .map_err(|e| BridgeError::config(format!("failed to install logger: {}", e)))?;

    if let Some(e) = log_file.link_error {
        warn!(error = %e, "failed to update {} symlink", LOG_LINK_NAME);
    }
    info!(path = %log_file.path.display(), "file logging started");
    Ok(Some(log_file.path))
}

struct LogFile {
    file: File,
    path: PathBuf,
    link_error: Option<std::io::Error>,
}

fn open_log_file(dir: &Path) -> Result<LogFile> {
    std::fs::create_dir_all(dir)
        .map_err(|e| BridgeError::config(format!("failed to create log dir {}: {}", dir.display(), e)))?;

    let filename = chrono::Local::now()
        .format("%Y%m%d-%H%M%S-canbridge.log")
        .to_string();
    let path = dir.join(&filename);

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| BridgeError::config(format!("failed to create log file {}: {}", path.display(), e)))?;

    #[cfg(unix)]
    let link_error = {
        let link_path = dir.join(LOG_LINK_NAME);
        let _ = std::fs::remove_file(&link_path);
        std::os::unix::fs::symlink(&filename, &link_path).err()
    };
    #[cfg(not(unix))]
    let link_error = None;

    Ok(LogFile {
        file,
        path,
        link_error,
    })
}
