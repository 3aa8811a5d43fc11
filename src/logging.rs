use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::{fmt, EnvFilter};

use super::{AuditError, AuditResult};

fn env_filter(verbose: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "debug" } else { "info" }))
}

/// Install the global subscriber: appending to `log_file` when given,
/// otherwise writing to stderr.
pub(crate) fn init_logging(log_file: Option<&Path>, verbose: bool) -> AuditResult<()> {
    let builder = fmt().with_env_filter(env_filter(verbose)).with_target(false);

    let result = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| {
                    AuditError::Config(format!("cannot create log directory {}: {e}", parent.display()))
                })?;
            }
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|e| AuditError::Config(format!("cannot open log {}: {e}", path.display())))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(std::io::stderr).try_init(),
    };

    if result.is_err() {
        tracing::warn!("tracing subscriber already set; keeping the existing one");
    }
    Ok(())
}
