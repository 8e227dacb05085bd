//! Structured logging setup (console + optional daily rolling file).

use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LogConfig;

/// Prefix of the rolling log files (`cart-sync.YYYY-MM-DD`).
pub const LOG_FILE_PREFIX: &str = "cart-sync";

fn is_log_file(name: &str) -> bool {
    name == LOG_FILE_PREFIX || name.starts_with(&format!("{LOG_FILE_PREFIX}."))
}

/// Delete the oldest log files so at most `keep` remain. Returns the number
/// of files removed.
pub fn prune_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = entries
        .flatten()
        .filter(|entry| entry.path().is_file())
        .filter(|entry| entry.file_name().to_str().is_some_and(is_log_file))
        .map(|entry| {
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    if log_files.len() <= keep {
        return 0;
    }

    // Newest first; everything past `keep` goes.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(&a.0)));
    log_files
        .into_iter()
        .skip(keep)
        .filter(|(path, _)| fs::remove_file(path).is_ok())
        .count()
}

/// Install the global subscriber. Keep the returned guard alive for the
/// life of the process; dropping it flushes the file writer.
///
/// Returns `None` for the guard when no log directory is configured.
/// Calling this twice is harmless: the second install is ignored.
pub fn init_logging(config: &LogConfig) -> Option<WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.default_filter));
    let console_layer = fmt::layer().with_target(true);

    let (file_layer, guard) = match config.dir.as_deref() {
        Some(dir) if fs::create_dir_all(dir).is_ok() => {
            prune_old_logs(dir, config.retained_files);
            let file_appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}
