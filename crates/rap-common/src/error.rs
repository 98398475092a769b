//! Error types for the task runner and configuration parsing.
//!
//! Filesystem helpers return [`std::io::Error`] unchanged; everything that
//! runs work items reports through [`RunError`].

use std::path::PathBuf;

use thiserror::Error;

/// Error type a task function may return. Anything implementing
/// `std::error::Error + Send + Sync` (and plain strings) converts into it.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Why a single work item did not complete.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task function returned an error in this process.
    #[error("{0}")]
    Failed(BoxError),
    /// The task function panicked.
    #[error("panicked: {0}")]
    Panicked(String),
    /// The task failed inside a worker process; only its message crosses back.
    #[error("{0}")]
    Remote(String),
    /// The worker process running the item exited or broke the protocol.
    #[error("worker process lost: {0}")]
    WorkerLost(String),
}

/// A failed work item, identified by its position in the input sequence.
#[derive(Debug, Error)]
#[error("work item #{index} failed: {error}")]
pub struct TaskFailure {
    pub index: usize,
    pub error: TaskError,
}

/// Errors returned by [`crate::TaskRunner`] entry points.
#[derive(Debug, Error)]
pub enum RunError {
    /// Sequential mode stops at the first failing item.
    #[error(transparent)]
    Task(TaskFailure),
    /// Parallel modes with [`crate::ErrorPolicy::Collect`]: every failure, sorted by index.
    #[error("{} of the submitted tasks failed (first: {})", .0.len(), first_failure(.0))]
    Tasks(Vec<TaskFailure>),
    #[error("failed to build worker thread pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
    #[error("failed to start worker process {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot locate the worker executable: {0}")]
    WorkerProgram(#[source] std::io::Error),
    #[error("work item or arguments cannot be sent to a worker process: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("process mode needs a registered task; a closure cannot cross a process boundary")]
    NotTransferable,
}

fn first_failure(failures: &[TaskFailure]) -> String {
    failures
        .first()
        .map(ToString::to_string)
        .unwrap_or_else(|| "none".to_string())
}

impl RunError {
    /// Failed work items carried by this error, if any.
    pub fn failures(&self) -> &[TaskFailure] {
        match self {
            RunError::Task(failure) => std::slice::from_ref(failure),
            RunError::Tasks(failures) => failures,
            _ => &[],
        }
    }
}

/// A configuration or command-line value that could not be parsed.
#[derive(Debug, Error)]
#[error("invalid {what} {value:?} (expected one of: {expected})")]
pub struct ParseError {
    pub what: &'static str,
    pub value: String,
    pub expected: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_failure_display() {
        let failure = TaskFailure {
            index: 2,
            error: TaskError::Failed("disk full".into()),
        };
        let display = failure.to_string();
        assert!(display.contains("#2"));
        assert!(display.contains("disk full"));
    }

    #[test]
    fn test_tasks_error_reports_count_and_first() {
        let err = RunError::Tasks(vec![
            TaskFailure { index: 0, error: TaskError::Panicked("boom".to_string()) },
            TaskFailure { index: 3, error: TaskError::Remote("exit 1".to_string()) },
        ]);
        let display = err.to_string();
        assert!(display.starts_with("2 of the submitted tasks failed"));
        assert!(display.contains("panicked: boom"));
        assert_eq!(err.failures().len(), 2);
        assert!(RunError::NotTransferable.failures().is_empty());
    }

    #[test]
    fn test_parse_error_display() {
        let err = ParseError { what: "mode", value: "fast".to_string(), expected: "debug, process, thread" };
        assert_eq!(err.to_string(), "invalid mode \"fast\" (expected one of: debug, process, thread)");
    }
}
