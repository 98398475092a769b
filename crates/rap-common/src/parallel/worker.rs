//! Worker side of process-parallel runs: named tasks, the registry a binary
//! serves them from, and the line protocol spoken over the worker's stdio.
//!
//! Protocol (one JSON document per line):
//! - parent -> worker: the task arguments, then one work item per line; EOF ends the run.
//! - worker -> parent: one reply per item, prefixed with [`REPLY_MARKER`]. Any other
//!   output on the worker's stdout is the task's own and is passed through.

use std::collections::HashMap;
use std::env;
use std::io::{self, BufRead, Write};
use std::panic::{self, AssertUnwindSafe};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::error::BoxError;

/// Environment variable naming the task a worker process should serve.
pub const WORKER_ENV: &str = "RAP_WORKER_TASK";

/// Prefix of reply lines on a worker's stdout (ASCII record separator + tag).
pub(crate) const REPLY_MARKER: &[u8] = b"\x1erap-reply ";

/// A unit of work that can run in a separate worker process.
///
/// The task is looked up by [`Task::NAME`] on the worker side, so the worker
/// executable must register it (see [`TaskRegistry`] and [`serve_if_worker`]).
/// Items and arguments travel as JSON, so they must be self-contained.
pub trait Task: 'static {
    const NAME: &'static str;
    type Item: Serialize + DeserializeOwned + Send;
    type Args: Serialize + DeserializeOwned + Sync;

    fn run(item: Self::Item, args: &Self::Args) -> Result<(), BoxError>;
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "lowercase")]
pub(crate) enum Reply {
    Done,
    Failed { error: String },
    Panicked { message: String },
}

type Handler = fn(&mut dyn BufRead, &mut dyn Write) -> io::Result<()>;

/// Tasks a worker executable knows how to run, by name.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    handlers: HashMap<&'static str, Handler>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<K: Task>(mut self) -> Self {
        self.handlers.insert(K::NAME, serve::<K>);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered task names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Serve `name` over the given streams until the input is exhausted.
    pub fn serve(&self, name: &str, input: &mut dyn BufRead, output: &mut dyn Write) -> io::Result<()> {
        let handler = self.handlers.get(name).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown task \"{}\"", name))
        })?;
        handler(input, output)
    }
}

/// If this process was started as a worker, serve the requested task on
/// stdin/stdout and return the exit code; otherwise return `None`.
///
/// Binaries used as worker programs call this before parsing their arguments.
pub fn serve_if_worker(registry: &TaskRegistry) -> Option<i32> {
    let name = env::var(WORKER_ENV).ok()?;
    if !registry.contains(&name) {
        error!(task = %name, known = ?registry.names(), "worker started for an unknown task");
        return Some(2);
    }
    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    match registry.serve(&name, &mut input, &mut output) {
        Ok(()) => Some(0),
        Err(e) => {
            error!(task = %name, error = %e, "worker protocol failed");
            Some(1)
        }
    }
}

fn serve<K: Task>(input: &mut dyn BufRead, output: &mut dyn Write) -> io::Result<()> {
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Ok(());
    }
    let args: K::Args = serde_json::from_str(line.trim_end())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    debug!(task = K::NAME, "worker ready");

    loop {
        line.clear();
        if input.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let reply = match serde_json::from_str::<K::Item>(line.trim_end()) {
            Ok(item) => run_caught(|| K::run(item, &args)),
            Err(e) => Reply::Failed {
                error: format!("malformed work item: {}", e),
            },
        };
        write_reply(output, &reply)?;
    }
}

fn run_caught<F>(f: F) -> Reply
where
    F: FnOnce() -> Result<(), BoxError>,
{
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Reply::Done,
        Ok(Err(e)) => Reply::Failed { error: e.to_string() },
        Err(payload) => Reply::Panicked {
            message: panic_message(payload.as_ref()),
        },
    }
}

fn write_reply(output: &mut dyn Write, reply: &Reply) -> io::Result<()> {
    let json = serde_json::to_vec(reply).map_err(io::Error::other)?;
    // Task output may have left a partial line; the parent finds the marker anywhere in a line.
    output.write_all(REPLY_MARKER)?;
    output.write_all(&json)?;
    output.write_all(b"\n")?;
    output.flush()
}

/// Parse a reply out of one line of worker output. Returns the task output that
/// preceded the marker and the reply, or `None` if the line is plain task output.
pub(crate) fn split_reply(line: &[u8]) -> Option<(&[u8], io::Result<Reply>)> {
    let pos = line
        .windows(REPLY_MARKER.len())
        .position(|w| w == REPLY_MARKER)?;
    let body = &line[pos + REPLY_MARKER.len()..];
    let reply = serde_json::from_slice(body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e));
    Some((&line[..pos], reply))
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
