//! User-facing event log.
//!
//! Components receive an [`EventSink`] at construction and report everything the operator should
//! see through it. [`TracingSink`] forwards to [`tracing`]; a host application can provide its own
//! sink to show the log trail and to block interaction on [`Level::Critical`] events.

use std::{fmt, str::FromStr, sync::Arc};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    Debug,
    Info,
    Warning,
    Error,
    /// The host cannot continue without operator intervention.
    Critical,
}

impl Level {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown log level: {0:?}")]
pub struct UnknownLevel(pub String);

impl FromStr for Level {
    type Err = UnknownLevel;

    /// Accepts the plain name (`warning`) as well as the bracketed prefix form (`[WARNING]`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s
            .trim()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_ascii_lowercase();
        match name.as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            _ => Err(UnknownLevel(s.to_string())),
        }
    }
}

/// Destination for user-facing log events. Implementations must be callable from any task.
pub trait EventSink: Send + Sync + fmt::Debug {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message)
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message)
    }

    fn warning(&self, message: &str) {
        self.log(Level::Warning, message)
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message)
    }

    fn critical(&self, message: &str) {
        self.log(Level::Critical, message)
    }
}

/// Forwards events to [`tracing`]. Critical events are emitted as errors with `critical = true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl TracingSink {
    pub fn shared() -> Arc<dyn EventSink> {
        Arc::new(Self)
    }
}

impl EventSink for TracingSink {
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => tracing::debug!("{message}"),
            Level::Info => tracing::info!("{message}"),
            Level::Warning => tracing::warn!("{message}"),
            Level::Error => tracing::error!("{message}"),
            Level::Critical => tracing::error!(critical = true, "{message}"),
        }
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn events(&self) -> Vec<(Level, String)> {
        self.events.lock().clone()
    }

    pub fn count(&self, level: Level) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .count()
    }

    /// Returns `true` if an event with the given level contains `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.events
            .lock()
            .iter()
            .any(|(l, message)| *l == level && message.contains(needle))
    }
}

impl EventSink for MemorySink {
    fn log(&self, level: Level, message: &str) {
        tracing::trace!(%level, message, "captured event");
        self.events.lock().push((level, message.to_string()));
    }
}
