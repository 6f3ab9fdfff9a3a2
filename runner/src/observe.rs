use crate::config::ConfigErrors;
use std::{fs::OpenOptions, path::Path, sync::Mutex};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initializes a `tracing_subscriber` using `HIVE_LOG` first, then `RUST_LOG`, then a default.
///
/// Events are written with timestamps to stderr and, if `log_file` is given, appended to
/// that file as well. The file is never truncated, so consecutive runs share one log.
pub fn init_tracing(log_file: Option<&Path>) -> Result<(), ConfigErrors> {
    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;

            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .try_init()?;

    Ok(())
}

pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env("HIVE_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}
