//! Tracing subscriber setup: optional console output plus an append-only
//! per-pair log file written by a background worker.

use std::io;
use std::path::Path;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Settings;
use crate::error::{Error, Result};

/// Keeps the file writer alive; buffered lines are flushed when dropped.
#[must_use]
pub struct LogGuard {
    _guard: Option<WorkerGuard>,
}

impl LogGuard {
    fn new(guard: Option<WorkerGuard>) -> Self {
        Self { _guard: guard }
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the level.
pub fn init(settings: &Settings, logfile: Option<&Path>) -> Result<LogGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("zettabee={}", level(settings))));

    let console = settings.verbose.then(|| {
        fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
    });

    let (file, guard) = match logfile {
        Some(path) => {
            let (writer, guard) = file_writer(path)?;
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    // Ignore a second initialization (tests, repeated calls).
    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init();
    Ok(LogGuard::new(guard))
}

fn level(settings: &Settings) -> &'static str {
    if settings.debug {
        "debug"
    } else {
        "info"
    }
}

fn file_writer(path: &Path) -> Result<(NonBlocking, WorkerGuard)> {
    let invalid = || Error::Configuration(format!("invalid log file path: {}", path.display()));
    let directory = path.parent().ok_or_else(invalid)?;
    let name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(invalid)?;
    let appender = RollingFileAppender::builder()
        .rotation(Rotation::NEVER)
        .filename_prefix(name)
        .build(directory)
        .map_err(|e| Error::Configuration(format!("{}: {}", path.display(), e)))?;
    Ok(tracing_appender::non_blocking(appender))
}
