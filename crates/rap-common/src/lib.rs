//! Core library for rap: dictionary merge, filesystem helpers, timing, and a task
//! runner that spreads work over threads or worker processes.
//! Used by the `rap` binary; the runner and helpers can be reused by other tools.

pub mod config;
pub mod dictutils;
pub mod error;
pub mod filesystem;
pub mod parallel;
pub mod tasks;
pub mod timeutils;

// Re-export main API for CLI
pub use config::{load_config, Config};
pub use dictutils::{merge, Mapping};
pub use error::{BoxError, ParseError, RunError, TaskError, TaskFailure};
pub use filesystem::{
    abspath, absfiles, copy, copy_with, deepcopy, file_has_extensions, get_filesize,
    pretty_filesize, walk, walk_by_extensions, CopyMode, Walk,
};
pub use parallel::{
    dexecute, pexecute, serve_if_worker, texecute, ErrorPolicy, ExecutionMode, Task,
    TaskRegistry, TaskRunner, WORKER_ENV,
};
pub use timeutils::{timeit, try_timeit};
