//! Worker processes that die mid-run. Stand-in workers are small shell scripts
//! that speak the reply protocol; this file is its own test binary so no other
//! test forks while the scripts are being written.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use rap_common::tasks::{CommandArgs, RunCommand};
use rap_common::{ErrorPolicy, RunError, TaskError, TaskRunner};

/// Worker that records every item in `log` and exits on the item `"die"`,
/// deleting its own script first when `self_delete` is set.
fn write_worker(dir: &Path, name: &str, log: &Path, self_delete: bool) -> PathBuf {
    let path = dir.join(name);
    let remove = if self_delete { "rm -f \"$0\"" } else { ":" };
    let script = format!(
        r#"#!/bin/sh
read -r args
while read -r item; do
  if [ "$item" = '"die"' ]; then
    {remove}
    exit 3
  fi
  printf '%s\n' "$item" >> '{log}'
  printf '\036rap-reply {{"status":"done"}}\n'
done
"#,
        remove = remove,
        log = log.display()
    );
    fs::write(&path, script).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn items(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

fn logged(log: &Path) -> Vec<String> {
    let mut lines: Vec<String> = fs::read_to_string(log)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect();
    lines.sort();
    lines
}

fn run(worker: &Path, workers: usize, items: Vec<String>) -> Result<(), RunError> {
    let args = CommandArgs { program: "unused".to_string(), args: Vec::new() };
    TaskRunner::process()
        .with_worker_program(worker)
        .with_workers(workers)
        .with_error_policy(ErrorPolicy::Collect)
        .execute::<RunCommand, _>(items, &args)
}

fn lost_indices(err: &RunError) -> Vec<usize> {
    err.failures()
        .iter()
        .inspect(|f| assert!(matches!(f.error, TaskError::WorkerLost(_)), "{}", f))
        .map(|f| f.index)
        .collect()
}

#[test]
fn test_worker_death() {
    let td = tempfile::tempdir().unwrap();
    // scripts are all written before the first worker is spawned
    let replaced_log = td.path().join("replaced.log");
    let replaced = write_worker(td.path(), "replaced.sh", &replaced_log, false);
    let siblings_log = td.path().join("siblings.log");
    let siblings = write_worker(td.path(), "siblings.sh", &siblings_log, true);
    let alone_log = td.path().join("alone.log");
    let alone = write_worker(td.path(), "alone.sh", &alone_log, true);

    // a dead worker is replaced and the next items run on the new process
    let err = run(&replaced, 1, items(&["die", "ok-a", "die", "ok-b"])).unwrap_err();
    assert_eq!(lost_indices(&err), vec![0, 2]);
    assert_eq!(logged(&replaced_log), vec!["\"ok-a\"", "\"ok-b\""]);

    // the slot that cannot respawn closes; the healthy worker runs everything else once
    let names = ["die", "ok-1", "ok-2", "ok-3", "ok-4", "ok-5", "ok-6"];
    let err = run(&siblings, 2, items(&names)).unwrap_err();
    assert_eq!(lost_indices(&err), vec![0]);
    let expected: Vec<String> = names[1..].iter().map(|n| format!("\"{}\"", n)).collect();
    assert_eq!(logged(&siblings_log), expected);

    // with no worker left, the remaining items are reported rather than dropped
    let err = run(&alone, 1, items(&["die", "ok-1", "ok-2"])).unwrap_err();
    assert_eq!(lost_indices(&err), vec![0, 1, 2]);
    assert!(logged(&alone_log).is_empty());
}
