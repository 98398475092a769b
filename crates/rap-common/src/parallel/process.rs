//! Process-backed worker pool. Workers are copies of a worker executable that
//! serve one [`Task`] over stdin/stdout; the pool lives for one call only.

use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;

use tracing::{debug, warn};

use super::worker::{split_reply, Reply, Task, WORKER_ENV};
use crate::error::{RunError, TaskError, TaskFailure};

/// Everything needed to start (or restart) a worker for this call.
struct Launch<'a> {
    program: &'a Path,
    task: &'static str,
    args_line: &'a str,
}

struct WorkerProcess {
    slot: usize,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    fn spawn(launch: &Launch<'_>, slot: usize) -> io::Result<Self> {
        let mut child = Command::new(launch.program)
            .env(WORKER_ENV, launch.task)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let stdin = child.stdin.take();
        let Some(stdout) = child.stdout.take() else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(io::Error::other("worker stdout was not captured"));
        };
        let mut worker = Self {
            slot,
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };
        worker.send(launch.args_line)?;
        debug!(slot, pid = worker.child.id(), task = launch.task, "worker process started");
        Ok(worker)
    }

    fn send(&mut self, line: &str) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "worker stdin is closed"))?;
        stdin.write_all(line.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()
    }

    fn recv(&mut self) -> io::Result<Reply> {
        let mut line = Vec::new();
        loop {
            line.clear();
            if self.stdout.read_until(b'\n', &mut line)? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "worker exited before replying",
                ));
            }
            match split_reply(&line) {
                Some((output, reply)) => {
                    forward(output);
                    return reply;
                }
                None => forward(&line),
            }
        }
    }

    fn call(&mut self, item_line: &str) -> io::Result<Reply> {
        self.send(item_line)?;
        self.recv()
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        // EOF on stdin tells the worker to exit once its current item is done.
        drop(self.stdin.take());
        match self.child.wait() {
            Ok(status) if status.success() => debug!(slot = self.slot, "worker process exited"),
            Ok(status) => warn!(slot = self.slot, %status, "worker process exited abnormally"),
            Err(e) => warn!(slot = self.slot, error = %e, "failed to wait for worker process"),
        }
    }
}

/// Task output relayed from a worker to our own stdout.
fn forward(output: &[u8]) {
    if output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = stdout.write_all(output);
    let _ = stdout.flush();
}

/// Items of one call, shared by every supervisor. Each item is claimed once and
/// settled once; failures are recorded as soon as they happen.
struct Batch {
    lines: Vec<String>,
    next: AtomicUsize,
    settled: Vec<AtomicBool>,
    failures: Mutex<Vec<TaskFailure>>,
}

impl Batch {
    fn new(lines: Vec<String>) -> Self {
        let settled = lines.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            lines,
            next: AtomicUsize::new(0),
            settled,
            failures: Mutex::new(Vec::new()),
        }
    }

    fn len(&self) -> usize {
        self.lines.len()
    }

    fn claim(&self) -> Option<(usize, &str)> {
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.lines.get(index).map(|line| (index, line.as_str()))
    }

    fn settle(&self, index: usize, error: Option<TaskError>) {
        if let Some(error) = error {
            self.failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(TaskFailure { index, error });
        }
        self.settled[index].store(true, Ordering::Release);
    }

    /// Failures sorted by item index. Items nobody settled (every worker slot was
    /// lost, or their supervisor panicked) are reported as lost.
    fn into_failures(self) -> Vec<TaskFailure> {
        let mut failures = self
            .failures
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        for (index, settled) in self.settled.iter().enumerate() {
            if !settled.load(Ordering::Acquire) {
                failures.push(TaskFailure {
                    index,
                    error: TaskError::WorkerLost("no worker process was left to run the item".to_string()),
                });
            }
        }
        failures.sort_by_key(|failure| failure.index);
        failures
    }
}

/// Run every item on a pool of worker processes and wait for all of them.
/// Returns the failed items; an empty input starts no processes.
pub(crate) fn run<K, I>(
    program: &Path,
    workers: usize,
    items: I,
    args: &K::Args,
) -> Result<Vec<TaskFailure>, RunError>
where
    K: Task,
    I: IntoIterator<Item = K::Item>,
{
    let lines = items
        .into_iter()
        .map(|item| serde_json::to_string(&item))
        .collect::<Result<Vec<_>, _>>()?;
    if lines.is_empty() {
        return Ok(Vec::new());
    }
    let args_line = serde_json::to_string(args)?;
    let launch = Launch {
        program,
        task: K::NAME,
        args_line: &args_line,
    };

    let count = workers.clamp(1, lines.len());
    let mut pool = Vec::with_capacity(count);
    for slot in 0..count {
        // on error the workers already in `pool` are dropped, which reaps them
        let worker = WorkerProcess::spawn(&launch, slot).map_err(|source| RunError::Spawn {
            program: program.to_path_buf(),
            source,
        })?;
        pool.push(worker);
    }
    let batch = Batch::new(lines);
    debug!(task = K::NAME, workers = count, items = batch.len(), "process pool started");

    thread::scope(|scope| {
        let handles: Vec<_> = pool
            .into_iter()
            .map(|worker| {
                let (launch, batch) = (&launch, &batch);
                scope.spawn(move || supervise(worker, launch, batch))
            })
            .collect();
        for handle in handles {
            if handle.join().is_err() {
                warn!("worker supervisor thread panicked");
            }
        }
    });
    Ok(batch.into_failures())
}

/// Feed items to one worker until the batch is exhausted. A worker that dies is
/// replaced; if that fails the slot stops taking items and the other slots
/// finish the batch.
fn supervise(worker: WorkerProcess, launch: &Launch<'_>, batch: &Batch) {
    let slot = worker.slot;
    let mut worker = Some(worker);

    while let Some(current) = worker.as_mut() {
        let Some((index, line)) = batch.claim() else {
            break;
        };
        let error = match current.call(line) {
            Ok(Reply::Done) => None,
            Ok(Reply::Failed { error }) => Some(TaskError::Remote(error)),
            Ok(Reply::Panicked { message }) => Some(TaskError::Panicked(message)),
            Err(e) => {
                warn!(slot, index, error = %e, "worker process lost, starting a replacement");
                drop(worker.take());
                worker = WorkerProcess::spawn(launch, slot)
                    .map_err(|e| warn!(slot, error = %e, "could not replace worker process, slot closed"))
                    .ok();
                Some(TaskError::WorkerLost(e.to_string()))
            }
        };
        batch.settle(index, error);
    }
}
