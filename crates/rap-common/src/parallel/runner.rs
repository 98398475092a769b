//! The task runner: one contract, three execution strategies.

use std::env;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::str::FromStr;

use rayon::prelude::*;
use tracing::{debug, warn};

use super::process;
use super::worker::{panic_message, Task};
use crate::config::Config;
use crate::error::{BoxError, ParseError, RunError, TaskError, TaskFailure};

/// Where work items run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// In order, on the calling thread; the first failure aborts the run.
    Debug,
    /// One isolated worker process per pool slot; needs a registered [`Task`].
    Process,
    /// A pool of threads sharing this process's memory.
    #[default]
    Thread,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Debug => "debug",
            ExecutionMode::Process => "process",
            ExecutionMode::Thread => "thread",
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "sequential" => Ok(ExecutionMode::Debug),
            "process" | "processes" => Ok(ExecutionMode::Process),
            "thread" | "threads" => Ok(ExecutionMode::Thread),
            _ => Err(ParseError {
                what: "execution mode",
                value: s.to_string(),
                expected: "debug, process, thread",
            }),
        }
    }
}

/// What a parallel run does with items that failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ErrorPolicy {
    /// Log each failure and return `Ok(())` once all items finished.
    #[default]
    Log,
    /// Return every failure as [`RunError::Tasks`] once all items finished.
    Collect,
}

impl ErrorPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorPolicy::Log => "log",
            ErrorPolicy::Collect => "collect",
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorPolicy {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "log" => Ok(ErrorPolicy::Log),
            "collect" => Ok(ErrorPolicy::Collect),
            _ => Err(ParseError {
                what: "error policy",
                value: s.to_string(),
                expected: "log, collect",
            }),
        }
    }
}

/// Applies a function to every item of a sequence and waits for all of them.
///
/// Parallel modes build their pool at the start of each call and release it
/// before returning; nothing is shared between calls.
#[derive(Clone, Debug, Default)]
pub struct TaskRunner {
    mode: ExecutionMode,
    workers: Option<usize>,
    on_error: ErrorPolicy,
    worker_program: Option<PathBuf>,
}

impl TaskRunner {
    pub fn new(mode: ExecutionMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }

    pub fn debug() -> Self {
        Self::new(ExecutionMode::Debug)
    }

    pub fn thread() -> Self {
        Self::new(ExecutionMode::Thread)
    }

    pub fn process() -> Self {
        Self::new(ExecutionMode::Process)
    }

    /// Runner with the mode, pool size and error policy from `config`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.mode.unwrap_or_default(),
            workers: config.workers,
            on_error: config.on_error.unwrap_or_default(),
            worker_program: None,
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Pool size for parallel modes (at least 1).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.on_error = policy;
        self
    }

    /// Executable started for process workers; defaults to the current executable.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn error_policy(&self) -> ErrorPolicy {
        self.on_error
    }

    /// Pool size used by parallel modes: configured value or one per CPU.
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Run `func` on every item. Extra per-call arguments are captured by the closure.
    ///
    /// `Debug` stops at the first error; `Thread` runs everything and applies the
    /// error policy. Closures cannot cross a process boundary, so `Process` mode
    /// returns [`RunError::NotTransferable`]; use [`TaskRunner::execute`] instead.
    pub fn for_each<T, R, E, F, I>(&self, func: F, items: I) -> Result<(), RunError>
    where
        I: IntoIterator<Item = T>,
        T: Send,
        F: Fn(T) -> Result<R, E> + Sync,
        E: Into<BoxError>,
    {
        debug!(mode = %self.mode, "running closure over items");
        match self.mode {
            ExecutionMode::Debug => run_sequential(func, items),
            ExecutionMode::Thread => {
                let failures = self.run_threads(func, items)?;
                self.settle(failures)
            }
            ExecutionMode::Process => Err(RunError::NotTransferable),
        }
    }

    /// Run the registered task `K` on every item with the same `args`, in any mode.
    pub fn execute<K, I>(&self, items: I, args: &K::Args) -> Result<(), RunError>
    where
        K: Task,
        I: IntoIterator<Item = K::Item>,
    {
        debug!(mode = %self.mode, task = K::NAME, "running task over items");
        match self.mode {
            ExecutionMode::Debug => run_sequential(|item| K::run(item, args), items),
            ExecutionMode::Thread => {
                let failures = self.run_threads(|item| K::run(item, args), items)?;
                self.settle(failures)
            }
            ExecutionMode::Process => {
                let program = match &self.worker_program {
                    Some(program) => program.clone(),
                    None => env::current_exe().map_err(RunError::WorkerProgram)?,
                };
                let failures = process::run::<K, I>(&program, self.workers(), items, args)?;
                self.settle(failures)
            }
        }
    }

    fn run_threads<T, R, E, F, I>(&self, func: F, items: I) -> Result<Vec<TaskFailure>, RunError>
    where
        I: IntoIterator<Item = T>,
        T: Send,
        F: Fn(T) -> Result<R, E> + Sync,
        E: Into<BoxError>,
    {
        let batch: Vec<(usize, T)> = items.into_iter().enumerate().collect();
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let threads = self.workers().min(batch.len());
        debug!(threads, items = batch.len(), "thread pool started");

        // the scoped pool joins its threads before `build_scoped` returns
        let failures = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("rap-worker-{}", i))
            .build_scoped(
                |thread| thread.run(),
                |pool| {
                    pool.install(|| {
                        batch
                            .into_par_iter()
                            .with_max_len(1)
                            .filter_map(|(index, item)| run_caught(&func, index, item))
                            .collect::<Vec<_>>()
                    })
                },
            )?;
        Ok(failures)
    }

    fn settle(&self, mut failures: Vec<TaskFailure>) -> Result<(), RunError> {
        if failures.is_empty() {
            return Ok(());
        }
        failures.sort_by_key(|failure| failure.index);
        match self.on_error {
            ErrorPolicy::Log => {
                for failure in &failures {
                    warn!(index = failure.index, error = %failure.error, "task failed");
                }
                warn!(failed = failures.len(), "some tasks failed; continuing");
                Ok(())
            }
            ErrorPolicy::Collect => Err(RunError::Tasks(failures)),
        }
    }
}

fn run_sequential<T, R, E, F, I>(mut func: F, items: I) -> Result<(), RunError>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<R, E>,
    E: Into<BoxError>,
{
    for (index, item) in items.into_iter().enumerate() {
        func(item).map_err(|e| {
            RunError::Task(TaskFailure {
                index,
                error: TaskError::Failed(e.into()),
            })
        })?;
    }
    Ok(())
}

fn run_caught<T, R, E, F>(func: &F, index: usize, item: T) -> Option<TaskFailure>
where
    F: Fn(T) -> Result<R, E>,
    E: Into<BoxError>,
{
    let error = match panic::catch_unwind(AssertUnwindSafe(|| func(item))) {
        Ok(Ok(_)) => return None,
        Ok(Err(e)) => TaskError::Failed(e.into()),
        Err(payload) => TaskError::Panicked(panic_message(payload.as_ref())),
    };
    Some(TaskFailure { index, error })
}

/// Sequential run: `func` on each item in order on this thread. The first error
/// is returned unchanged and the remaining items are not processed.
pub fn dexecute<T, R, E, F, I>(mut func: F, items: I) -> Result<(), E>
where
    I: IntoIterator<Item = T>,
    F: FnMut(T) -> Result<R, E>,
{
    for item in items {
        func(item)?;
    }
    Ok(())
}

/// Thread-parallel run with the default pool size and [`ErrorPolicy::Log`].
pub fn texecute<T, R, E, F, I>(func: F, items: I) -> Result<(), RunError>
where
    I: IntoIterator<Item = T>,
    T: Send,
    F: Fn(T) -> Result<R, E> + Sync,
    E: Into<BoxError>,
{
    TaskRunner::thread().for_each(func, items)
}

/// Process-parallel run of task `K` with the default pool size and [`ErrorPolicy::Log`].
/// The current executable must serve `K` (see [`super::serve_if_worker`]).
pub fn pexecute<K, I>(items: I, args: &K::Args) -> Result<(), RunError>
where
    K: Task,
    I: IntoIterator<Item = K::Item>,
{
    TaskRunner::process().execute::<K, I>(items, args)
}
