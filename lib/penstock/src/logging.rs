pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Drain, Logger};

use sloggers::Config;
use sloggers::LoggerConfig;

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the root logger from a TOML logging configuration snippet
/// (see `sloggers::LoggerConfig` for the accepted schema).
pub fn from_toml(config: &str) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(config).expect("Invalid logging configuration");

    config.build_logger().expect("Logger construction failed")
}

/// Default terminal logger for services that carry no logging section in
/// their configuration.
pub fn terminal() -> Logger {
    from_toml(DEFAULT_CONFIG)
}

/// Sink logger for components constructed without a parent.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discard_accepts_records() {
        let log = discard();
        debug!(log, "dropped"; "context" => "test");
    }

    #[test]
    fn test_from_toml_terminal() {
        let log = from_toml(DEFAULT_CONFIG);
        trace!(log, "built"; "context" => "test");
    }
}
