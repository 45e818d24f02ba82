//! Logging bootstrap: dated log file, `fuzzer.log` symlink, runtime-tunable
//! level.
//!
//! Every run logs to `./log/gadfly_<day>-<month>_<hour>:<minute>.log`, with
//! `./fuzzer.log` symlinked at the latest run for ease of access. The
//! `-v` occurrences raise the level from ERROR up to TRACE, and the interrupt
//! menu can retune it mid-run through the returned reload handle.

use std::path::Path;
use std::sync::Mutex;

use chrono::{Datelike, Timelike};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{reload, EnvFilter, Layer, Registry};

/// Handle for retuning the log level at runtime.
pub type LevelHandle = reload::Handle<EnvFilter, Registry>;

/// Verbosity steps selected by repeating `-v`.
const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// The level name for a `-v` count.
pub fn level_for(verbose: u8) -> &'static str {
    LEVELS[usize::from(verbose).min(LEVELS.len() - 1)]
}

/// The filter directive applied for a level name.
pub fn filter_for(level: &str) -> EnvFilter {
    EnvFilter::new(format!("gadfly={level},gadfly_core={level},warn"))
}

/// The dated log file name for a run starting now.
pub fn log_file_name(now: &chrono::DateTime<chrono::Local>) -> String {
    format!(
        "./log/gadfly_{}-{}_{}:{:02}.log",
        now.day(),
        now.month(),
        now.hour(),
        now.minute()
    )
}

/// Create the log file, refresh the symlink and install the subscriber.
///
/// Returns the reload handle the interrupt menu uses for `debug`/`info`.
pub fn init(verbose: u8) -> anyhow::Result<LevelHandle> {
    std::fs::create_dir_all("./log")?;

    let filename = log_file_name(&chrono::Local::now());
    let file = std::fs::File::create(&filename)?;

    if Path::new("./fuzzer.log").exists() || Path::new("./fuzzer.log").is_symlink() {
        let _ = std::fs::remove_file("./fuzzer.log");
    }
    #[cfg(unix)]
    std::os::unix::fs::symlink(&filename, "./fuzzer.log")?;

    let (filter, handle) = reload::Layer::new(filter_for(level_for(verbose)));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .with_filter(filter),
        )
        .init();

    Ok(handle)
}
