use std::env;
use std::io;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{Local, SecondsFormat};
use log::LevelFilter;

const LEVEL_ENV: &str = "IMAGE_GUARD_LOG";

static LOGGER_INIT: OnceLock<()> = OnceLock::new();

/// Timestamped line format shared by every output.
fn dispatch(level: LevelFilter) -> fern::Dispatch {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} {:<5} {}: {}",
                Local::now().to_rfc3339_opts(SecondsFormat::Millis, false),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level)
}

fn level_from(value: Option<String>) -> LevelFilter {
    value
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(LevelFilter::Info)
}

/// Installs the process logger: stderr plus the append-only log file.
/// Only the first call has any effect.
pub fn init(log_path: &Path) {
    LOGGER_INIT.get_or_init(|| {
        let level = level_from(env::var(LEVEL_ENV).ok());
        let mut root = dispatch(level).chain(io::stderr());
        let open_error = match fern::log_file(log_path) {
            Ok(file) => {
                root = root.chain(file);
                None
            }
            Err(err) => Some(err),
        };

        if let Err(err) = root.apply() {
            eprintln!("failed to install logger: {err}");
            return;
        }
        if let Some(err) = open_error {
            log::warn!(
                "Could not open log file {}: {err}; logging to stderr only",
                log_path.display()
            );
        }
    });
}
