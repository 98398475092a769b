//! Run a function over every item of a sequence: sequentially for debugging,
//! or on a worker pool of threads or processes scoped to a single call.
//!
//! Results are discarded. Callers that need per-item values should map/collect
//! themselves; the runner only reports which items failed.

mod process;
mod runner;
mod worker;

pub use runner::{dexecute, pexecute, texecute, ErrorPolicy, ExecutionMode, TaskRunner};
pub use worker::{serve_if_worker, Task, TaskRegistry, WORKER_ENV};
