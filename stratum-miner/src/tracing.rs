//! Logging setup for the miner.
//!
//! Call [`init_journald_or_stdout`] once at startup. Everything else uses
//! `use crate::tracing::prelude::*` for the `trace!()` through `error!()`
//! macros and attaches structured fields (`job_id = %id`, `difficulty = %d`)
//! rather than formatting values into the message.

use std::fmt;
use std::io::IsTerminal;

use time::OffsetDateTime;
use time::macros::format_description;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
    },
    prelude::*,
    registry::LookupSpan,
};

#[cfg(target_os = "linux")]
use nix::libc;

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

#[cfg(target_os = "linux")]
use prelude::*;

const CRATE_PREFIX: &str = "stratum_miner::";

/// Parse `JOURNAL_STREAM`, which systemd sets to `<device>:<inode>`.
fn parse_journal_stream(value: &str) -> Option<(u64, u64)> {
    let (dev, ino) = value.split_once(':')?;
    Some((dev.parse().ok()?, ino.parse().ok()?))
}

/// Whether stderr is the journal stream systemd handed us, rather than a
/// redirect inherited through the environment.
#[cfg(target_os = "linux")]
fn stderr_is_journal_stream() -> bool {
    use std::os::unix::io::AsRawFd;

    let Some((dev, ino)) = std::env::var("JOURNAL_STREAM")
        .ok()
        .and_then(|v| parse_journal_stream(&v))
    else {
        return false;
    };

    let fd = std::io::stderr().as_raw_fd();
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }

    stat.st_dev == dev && stat.st_ino == ino
}

/// Install the global subscriber.
///
/// Under systemd, events go to journald with their fields intact. Otherwise
/// they are printed to stdout, filtered by `RUST_LOG` (default `info`).
pub fn init_journald_or_stdout() {
    #[cfg(target_os = "linux")]
    {
        if stderr_is_journal_stream() {
            match tracing_journald::layer() {
                Ok(layer) => {
                    tracing_subscriber::registry().with(layer).init();
                    return;
                }
                Err(e) => {
                    use_stdout();
                    error!(error = %e, "Failed to initialize journald logging, using stdout");
                    return;
                }
            }
        }
    }

    use_stdout();
}

fn use_stdout() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_timer(LocalTimer)
                .fmt_fields(DefaultFields::new())
                .event_format(LineFormatter {
                    color: std::io::stdout().is_terminal(),
                }),
        )
        .init();
}

/// One event per line: `time level target: message key=value ...`.
struct LineFormatter {
    color: bool,
}

/// Collects the message and fields of an event.
#[derive(Default)]
struct FieldCollector {
    message: Option<String>,
    fields: Vec<(&'static str, String)>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let formatted = format!("{:?}", value);
        if field.name() == "message" {
            self.message = Some(formatted);
        } else {
            self.fields.push((field.name(), unwrap_some(&formatted)));
        }
    }
}

/// `Some(x)` prints as `x`; structured fields are often optional.
fn unwrap_some(formatted: &str) -> String {
    formatted
        .strip_prefix("Some(")
        .and_then(|inner| inner.strip_suffix(')'))
        .unwrap_or(formatted)
        .to_string()
}

/// Our own modules print without the crate name; dependencies keep their
/// full path.
fn short_target(target: &str) -> &str {
    target.strip_prefix(CRATE_PREFIX).unwrap_or(target)
}

fn level_style(level: Level) -> (&'static str, &'static str) {
    match level {
        Level::ERROR => ("\x1b[31m", "ERROR"),
        Level::WARN => ("\x1b[33m", "WARN "),
        Level::INFO => ("\x1b[32m", "INFO "),
        Level::DEBUG => ("\x1b[34m", "DEBUG"),
        Level::TRACE => ("\x1b[35m", "TRACE"),
    }
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldCollector::default();
        event.record(&mut visitor);

        LocalTimer.format_time(&mut writer)?;

        let (color, text) = level_style(*event.metadata().level());
        if self.color {
            write!(writer, " {}{}\x1b[0m ", color, text)?;
        } else {
            write!(writer, " {} ", text)?;
        }

        write!(writer, "{}: ", short_target(event.metadata().target()))?;
        if let Some(message) = &visitor.message {
            write!(writer, "{}", message)?;
        }

        if !visitor.fields.is_empty() {
            if self.color {
                write!(writer, "\x1b[90m")?;
            }
            for (key, value) in &visitor.fields {
                write!(writer, " {}={}", key, value)?;
            }
            if self.color {
                write!(writer, "\x1b[0m")?;
            }
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(format_description!("[hour]:[minute]:[second]"))
            .map_err(|_| fmt::Error)?;
        write!(w, "{}", formatted)
    }
}
