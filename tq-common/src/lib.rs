//! Shared building blocks of the tq crates: external command execution with explicit error
//! policies, the user-facing event sink, and keyed task sets.

pub mod command;
pub mod events;
pub mod task;

pub use command::{Command, Executor, Outcome, Output, Runner};
pub use events::{EventSink, Level, MemorySink, TracingSink};
pub use task::JoinMap;

/// Nanoseconds per second, the time base of every trace and status value.
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Formats a nanosecond duration as `MM:SS`, wrapping at one hour.
pub fn format_mm_ss(nanos: u64) -> String {
    let seconds = nanos / NANOS_PER_SEC;
    format!("{:02}:{:02}", (seconds % 3600) / 60, seconds % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_minutes_and_seconds() {
        assert_eq!(format_mm_ss(0), "00:00");
        assert_eq!(format_mm_ss(61 * NANOS_PER_SEC + 999), "01:01");
        assert_eq!(format_mm_ss(3_725 * NANOS_PER_SEC), "02:05");
    }
}
