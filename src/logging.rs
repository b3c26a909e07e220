//! # Logging module
//!
//! This module provides logging facilities and helpers

use tracing::Level;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to set global default subscriber, {0}")]
    GlobalDefaultSubscriber(tracing::subscriber::SetGlobalDefaultError),
}

// -----------------------------------------------------------------------------
// helpers

pub const fn level(verbosity: usize) -> Level {
    match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// initialize the global subscriber from the verbosity count, the `debug`
/// configuration key raises the floor to [`Level::DEBUG`]
pub fn initialize(verbosity: usize, debug: bool) -> Result<(), Error> {
    let level = if debug && verbosity < 3 {
        Level::DEBUG
    } else {
        level(verbosity)
    };

    tracing::subscriber::set_global_default(
        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_thread_names(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .finish(),
    )
    .map_err(Error::GlobalDefaultSubscriber)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_should_saturate_on_trace() {
        assert_eq!(level(0), Level::ERROR);
        assert_eq!(level(2), Level::INFO);
        assert_eq!(level(4), Level::TRACE);
        assert_eq!(level(42), Level::TRACE);
    }
}
