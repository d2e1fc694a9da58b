//! Thin wrapper around `slog` + `sloggers`, following the same init
//! pattern the rest of this workspace uses elsewhere: build a
//! `sloggers::LoggerConfig` and hand back a root `slog::Logger`.

pub use slog::{self, o, Logger};

use sloggers::types::Severity;
use sloggers::Build;

/// Destination for log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde_derive::Serialize, serde_derive::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogDestination {
    Stderr,
    Stdout,
}

pub fn init(level: &str, destination: LogDestination) -> Logger {
    let severity = match level {
        "trace" => Severity::Trace,
        "debug" => Severity::Debug,
        "warning" | "warn" => Severity::Warning,
        "error" => Severity::Error,
        "critical" => Severity::Critical,
        _ => Severity::Info,
    };

    let mut builder = sloggers::terminal::TerminalLoggerBuilder::new();
    builder.level(severity);
    builder.destination(match destination {
        LogDestination::Stderr => sloggers::terminal::Destination::Stderr,
        LogDestination::Stdout => sloggers::terminal::Destination::Stdout,
    });

    builder.build().expect("failed to build root logger")
}

/// A logger that discards everything, used for tests and anywhere a
/// caller doesn't hand us a parent logger.
pub fn discard() -> Logger {
    Logger::root(slog::Discard, o!())
}
