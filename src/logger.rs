//! Logging setup for programs built on apex-nlls.
//!
//! The library itself only emits `tracing` events: per-iteration progress at `debug!` (or
//! `info!` with `LoggingType::PerMinimizerIteration`), fallbacks at `warn!` and errors at
//! `error!` as they are constructed. Installing a subscriber is left to the application;
//! [`init_logger`] installs a compact, coloured one.

use std::fmt;

use chrono::Local;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    EnvFilter,
    fmt::{FmtContext, FormatEvent, FormatFields, format::Writer},
    registry::LookupSpan,
};

/// Install the apex-nlls subscriber at INFO level.
///
/// Lines look like `[INFO 2025-01-31 12:00:00 apex_nlls::optimizer::solver] message`; DEBUG and
/// TRACE lines show `file:line` instead of the module. `RUST_LOG` overrides the level.
///
/// ```no_run
/// apex_nlls::init_logger();
/// tracing::info!("Fitting started");
/// ```
pub fn init_logger() {
    init_logger_with_level(Level::INFO)
}

/// Install the apex-nlls subscriber with `default_level` unless `RUST_LOG` says otherwise.
///
/// A subscriber that is already installed is left in place, so calling this from several
/// tests or entry points is harmless.
///
/// ```no_run
/// use tracing::Level;
///
/// apex_nlls::init_logger_with_level(Level::DEBUG);
/// tracing::debug!("Iteration tables enabled");
/// ```
pub fn init_logger_with_level(default_level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(BracketFormatter)
        .try_init();
}

/// `[LEVEL timestamp location] message`
struct BracketFormatter;

fn level_label(level: Level) -> &'static str {
    match level {
        Level::ERROR => "\x1b[31mERROR\x1b[0m",
        Level::WARN => "\x1b[33mWARN\x1b[0m",
        Level::INFO => "\x1b[32mINFO\x1b[0m",
        Level::DEBUG => "\x1b[34mDEBUG\x1b[0m",
        Level::TRACE => "\x1b[35mTRACE\x1b[0m",
    }
}

impl<S, N> FormatEvent<S, N> for BracketFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let level = *metadata.level();
        write!(
            writer,
            "[{} {} ",
            level_label(level),
            Local::now().format("%Y-%m-%d %H:%M:%S")
        )?;

        let verbose = level == Level::DEBUG || level == Level::TRACE;
        match (verbose, metadata.file()) {
            (true, Some(file)) => {
                let filename = file.rsplit('/').next().unwrap_or(file);
                match metadata.line() {
                    Some(line) => write!(writer, "{filename}:{line}")?,
                    None => write!(writer, "{filename}")?,
                }
            }
            _ => write!(writer, "{}", metadata.target())?,
        }
        write!(writer, "] ")?;

        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}
