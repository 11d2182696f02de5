//! A logging implementation

use core::fmt;

use crate::sync::IrqSpinLock;

/// Somewhere to write log lines, like the early console.
pub trait Console: Sync {
    /// Write out `s` immediately.
    fn write_str(&self, s: &str);
}

static LOGGER: Logger = Logger {
    console: IrqSpinLock::new(None),
};

/// Install the logger, writing to `console`.
///
/// Calling this again only swaps the console and the level.
pub fn init_logger(level: log::LevelFilter, console: &'static dyn Console) {
    *LOGGER.console.lock() = Some(console);
    match log::set_logger(&LOGGER) {
        Ok(()) => (),
        Err(e) => {
            log::debug!("Logger was already installed: {e}");
        }
    }
    log::set_max_level(level);
}

/// The logger to use.
struct Logger {
    /// Where lines go, if anywhere yet.
    console: IrqSpinLock<Option<&'static dyn Console>>,
}

impl log::Log for Logger {
    fn log(&self, record: &log::Record) {
        use core::fmt::Write as _;

        // A line logged while another is being written (from an interrupt, or from a console
        // that logs) is dropped rather than deadlocking.
        let Some(console) = self.console.try_lock() else {
            return;
        };
        let Some(console) = *console else {
            return;
        };
        _ = writeln!(
            ConsoleWriter(console),
            "{level:>8 } - {source} - {args}",
            level = record.level(),
            source = SourceLogWriter {
                file: record.file(),
                line: record.line()
            },
            args = record.args(),
        );
    }

    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn flush(&self) {
        // We write everything out immediately.
    }
}

/// Adapts a [`Console`] to [`fmt::Write`].
struct ConsoleWriter(&'static dyn Console);
impl fmt::Write for ConsoleWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

struct SourceLogWriter<'a> {
    file: Option<&'a str>,
    line: Option<u32>,
}
impl fmt::Display for SourceLogWriter<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self {
                file,
                line: Some(line),
            } => write!(f, "{}:{line}", file.unwrap_or("<unknown>")),
            Self {
                file: Some(file),
                line: None,
            } => f.write_str(file),
            Self {
                file: None,
                line: None,
            } => f.write_str("<unknown loc>"),
        }
    }
}
