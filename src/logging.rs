//! Terminal logging setup.

use log::LevelFilter;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

/// Level for the `-v` / `-q` combination; quiet wins.
pub fn level_for(verbose: bool, quiet: bool) -> LevelFilter {
    match (verbose, quiet) {
        (_, true) => LevelFilter::Warn,
        (true, false) => LevelFilter::Debug,
        (false, false) => LevelFilter::Info,
    }
}

/// Install the stderr logger. A second call is a no-op.
pub fn init(verbose: bool, quiet: bool) {
    let config = ConfigBuilder::new()
        .set_time_level(LevelFilter::Off)
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    let _ = TermLogger::init(
        level_for(verbose, quiet),
        config,
        TerminalMode::Stderr,
        ColorChoice::Auto,
    );
}

/// Initializes a terminal logger for tests, ignoring an already-set logger.
pub fn initialize_for_tests() {
    let level = if cfg!(debug_assertions) {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let _ = TermLogger::init(
        level,
        simplelog::Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quiet_overrides_verbose() {
        assert_eq!(level_for(true, true), LevelFilter::Warn);
        assert_eq!(level_for(true, false), LevelFilter::Debug);
        assert_eq!(level_for(false, false), LevelFilter::Info);
    }
}
