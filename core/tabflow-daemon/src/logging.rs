//! Logging setup: stderr plus a daily-rolling file under `~/.tabflow/logs/`.

use std::env;
use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

const DEBUG_ENV: &str = "TABFLOW_DEBUG_LOG";
const LOG_FILE_PREFIX: &str = "daemon.log";

/// Installs the global subscriber. Keep the returned guard alive for the
/// lifetime of the process or buffered file output is lost.
pub fn init() -> Option<WorkerGuard> {
    let file_layer = log_dir().and_then(|dir| {
        fs_err::create_dir_all(&dir).ok()?;
        let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
        Some(tracing_appender::non_blocking(appender))
    });

    match file_layer {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(env_filter())
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stderr)
                .init();
            None
        }
    }
}

fn env_filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn log_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".tabflow").join("logs"))
}
