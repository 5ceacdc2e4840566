pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::{Build, Config, LoggerConfig};
use std::path::Path;

/// Builds the default terminal logger writing to stderr.
pub fn init() -> Logger {
    TerminalLoggerBuilder::new()
        .level(Severity::Debug)
        .destination(Destination::Stderr)
        .build()
        .expect("Error building the terminal logger")
}

/// Builds a logger from a TOML logger configuration file. The file uses the
/// `sloggers` configuration schema, e.g.
///
/// ```toml
/// type = "terminal"
/// level = "debug"
/// destination = "stderr"
/// ```
pub fn init_from_file<P: AsRef<Path>>(path: P) -> Result<Logger, String> {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path.as_ref()).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// A logger that drops every record. Used by components constructed without
/// a parent logger, mainly in tests.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
