use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Lifecycle of a worker. Only moves forward; the last four are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    #[default]
    NotStarted,
    Working,
    Completed,
    Aborted,
    Errored,
    TimedOut,
}

impl WorkerStatus {
    pub fn is_done(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Aborted | Self::Errored | Self::TimedOut
        )
    }

    pub fn is_working(self) -> bool {
        self == Self::Working
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not-started",
            Self::Working => "working",
            Self::Completed => "completed",
            Self::Aborted => "aborted",
            Self::Errored => "errored",
            Self::TimedOut => "timed-out",
        };
        f.write_str(s)
    }
}

/// Scheduling hint passed to the server with a submitted task
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
    Background,
}

/// Per-worker settings
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerOptions {
    pub priority: Priority,
    /// Local deadline; zero means none
    pub timeout: Duration,
    /// Ask the server to stream partial results as they are produced
    pub incremental: bool,
    /// Submit even if the lease has lapsed
    pub ignore_invalid_lease: bool,
}

impl WorkerOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn incremental(mut self, incremental: bool) -> Self {
        self.incremental = incremental;
        self
    }

    pub fn ignore_invalid_lease(mut self, ignore: bool) -> Self {
        self.ignore_invalid_lease = ignore;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        let done: Vec<_> = [
            WorkerStatus::NotStarted,
            WorkerStatus::Working,
            WorkerStatus::Completed,
            WorkerStatus::Aborted,
            WorkerStatus::Errored,
            WorkerStatus::TimedOut,
        ]
        .into_iter()
        .filter(|s| s.is_done())
        .collect();
        assert_eq!(done.len(), 4);
        assert!(!WorkerStatus::Working.is_done());
    }

    #[test]
    fn test_default_options_have_no_deadline() {
        let options = WorkerOptions::default();
        assert!(options.timeout.is_zero());
        assert_eq!(options.priority, Priority::Normal);
        assert!(Priority::Critical < Priority::Background);
    }
}
