//! Logging setup shared by every crate in the workspace. Re-exports the slog
//! macros so call sites can use `logging::debug!(log, ...)` without naming
//! slog directly.

use sloggers::file::FileLoggerBuilder;
use sloggers::terminal::{Destination, TerminalLoggerBuilder};
use sloggers::types::Severity;
use sloggers::Build;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Level, Logger};

pub struct Settings {
    pub level: Level,
    pub file: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            level: Level::Info,
            file: None,
        }
    }
}

/// Parses a severity name the way the config file spells them.
pub fn parse_level(name: &str) -> Option<Level> {
    match name {
        "critical" => Some(Level::Critical),
        "error" => Some(Level::Error),
        "warning" | "warn" => Some(Level::Warning),
        "info" => Some(Level::Info),
        "debug" => Some(Level::Debug),
        "trace" => Some(Level::Trace),
        _ => None,
    }
}

/// Runtime verbosity adjustments requested over the admin control path.
/// The main loop drains these and applies them on its next tick.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LogControl {
    LevelUp,
    LevelDown,
    SetLevel(Level),
}

static LEVEL_UP_REQUESTED: AtomicBool = AtomicBool::new(false);
static LEVEL_DOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_level_up(_signum: libc::c_int) {
    LEVEL_UP_REQUESTED.store(true, Ordering::Relaxed);
}

extern "C" fn on_level_down(_signum: libc::c_int) {
    LEVEL_DOWN_REQUESTED.store(true, Ordering::Relaxed);
}

/// Installs SIGTTIN/SIGTTOU handlers that raise and lower verbosity. The
/// handlers only record the request; a helper thread forwards it as a
/// `LogControl` for the main loop to apply on its next tick. The thread
/// runs for the life of the process, exiting only once the receiver is
/// gone.
pub fn signal_controls() -> Receiver<LogControl> {
    let (tx, rx) = channel();

    unsafe {
        libc::signal(libc::SIGTTIN, on_level_up as libc::sighandler_t);
        libc::signal(libc::SIGTTOU, on_level_down as libc::sighandler_t);
    }

    thread::Builder::new()
        .name("logctl".into())
        .spawn(move || loop {
            thread::sleep(Duration::from_millis(100));

            if LEVEL_UP_REQUESTED.swap(false, Ordering::Relaxed)
                && tx.send(LogControl::LevelUp).is_err()
            {
                return;
            }
            if LEVEL_DOWN_REQUESTED.swap(false, Ordering::Relaxed)
                && tx.send(LogControl::LevelDown).is_err()
            {
                return;
            }
        })
        .expect("failed to spawn log control thread");

    rx
}

/// Shared handle onto the active log level. Cloneable into the admin path;
/// the filter drain reads it on every record.
#[derive(Clone)]
pub struct LevelHandle {
    level: Arc<AtomicUsize>,
}

impl LevelHandle {
    fn new(level: Level) -> LevelHandle {
        LevelHandle {
            level: Arc::new(AtomicUsize::new(level.as_usize())),
        }
    }

    #[inline]
    pub fn get(&self) -> Level {
        Level::from_usize(self.level.load(Ordering::Relaxed)).unwrap_or(Level::Info)
    }

    #[inline]
    pub fn apply(&self, control: LogControl) {
        match control {
            LogControl::LevelUp => self.set(more_verbose(self.get())),
            LogControl::LevelDown => self.set(less_verbose(self.get())),
            LogControl::SetLevel(level) => self.set(level),
        }
    }

    #[inline]
    fn set(&self, level: Level) {
        self.level.store(level.as_usize(), Ordering::Relaxed);
    }
}

fn more_verbose(level: Level) -> Level {
    Level::from_usize(level.as_usize() + 1).unwrap_or(Level::Trace)
}

fn less_verbose(level: Level) -> Level {
    match level.as_usize() {
        0 | 1 => Level::Critical,
        n => Level::from_usize(n - 1).unwrap_or(Level::Critical),
    }
}

/// Drain wrapper gating records on the shared level. Records below the
/// active level are dropped before they reach the inner drain.
struct RuntimeLevelFilter<D> {
    drain: D,
    handle: LevelHandle,
}

impl<D> Drain for RuntimeLevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = D::Err;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.handle.get()) {
            self.drain.log(record, values).map(Some)
        } else {
            Ok(None)
        }
    }
}

/// Builds the root logger. The sloggers-built logger already carries the
/// async channel and flusher thread; the runtime filter sits in front of it
/// so verbosity changes apply without rebuilding the drain.
pub fn init(settings: &Settings) -> sloggers::Result<(Logger, LevelHandle)> {
    let inner = match &settings.file {
        Some(path) => FileLoggerBuilder::new(path)
            .level(severity(settings.level))
            .build()?,
        None => TerminalLoggerBuilder::new()
            .level(severity(settings.level))
            .destination(Destination::Stderr)
            .build()?,
    };

    let handle = LevelHandle::new(settings.level);
    let filter = RuntimeLevelFilter {
        drain: inner,
        handle: handle.clone(),
    };

    Ok((Logger::root(filter.ignore_res(), o!()), handle))
}

/// The builder-level filter is pinned wide open; the runtime filter is the
/// one that actually gates.
fn severity(_level: Level) -> Severity {
    Severity::Trace
}
