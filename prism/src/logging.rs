//! Logger construction for the binaries and the re-export surface the rest of
//! the crate logs through (`logging::debug!(log, ...)`).

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Level, Logger};

use slog::Drain;

/// Builds the terminal root logger. `verbosity` raises the severity filter
/// one level per step above `Info`; `color` selects the ANSI decorator.
pub fn terminal(verbosity: u8, color: bool) -> Logger {
    let level = match verbosity {
        0 => Level::Info,
        1 => Level::Debug,
        _ => Level::Trace,
    };

    let format: Box<dyn Drain<Ok = (), Err = slog::Never> + Send> = if color {
        let decorator = slog_term::TermDecorator::new().stderr().build();
        Box::new(slog_term::FullFormat::new(decorator).build().fuse())
    } else {
        let decorator = slog_term::PlainDecorator::new(std::io::stderr());
        Box::new(slog_term::FullFormat::new(decorator).build().fuse())
    };

    let drain = slog::LevelFilter::new(format, level).ignore_res();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

/// A logger that swallows everything; components take `Option<&Logger>` at
/// construction and fall back to this, so tests run silent.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
