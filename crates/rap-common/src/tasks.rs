//! Built-in tasks the `rap` binary registers for its worker processes.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::BoxError;
use crate::filesystem::{copy_with, CopyMode};
use crate::parallel::{Task, TaskRegistry, WORKER_ENV};

/// Arguments shared by every [`CopyFile`] item.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CopyArgs {
    pub source_root: PathBuf,
    pub dest_root: PathBuf,
    #[serde(default)]
    pub preserve_metadata: bool,
}

/// Copy one file from under `source_root` to the same relative place under `dest_root`.
pub struct CopyFile;

impl Task for CopyFile {
    const NAME: &'static str = "copy-file";
    type Item = PathBuf;
    type Args = CopyArgs;

    fn run(item: PathBuf, args: &CopyArgs) -> Result<(), BoxError> {
        let relative = item.strip_prefix(&args.source_root).map_err(|_| {
            format!(
                "{} is not under {}",
                item.display(),
                args.source_root.display()
            )
        })?;
        let dest = args.dest_root.join(relative);
        let mode = if args.preserve_metadata {
            CopyMode::PreserveMetadata
        } else {
            CopyMode::Contents
        };
        copy_with(&item, &dest, mode).map_err(|e| format!("{}: {}", item.display(), e))?;
        Ok(())
    }
}

/// Program and leading arguments for [`RunCommand`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommandArgs {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Run `program args... item`; a non-zero exit status fails the item.
pub struct RunCommand;

impl Task for RunCommand {
    const NAME: &'static str = "run-command";
    type Item = String;
    type Args = CommandArgs;

    fn run(item: String, args: &CommandArgs) -> Result<(), BoxError> {
        debug!(program = %args.program, %item, "running command");
        let status = Command::new(&args.program)
            .args(&args.args)
            .arg(&item)
            .stdin(Stdio::null())
            .env_remove(WORKER_ENV)
            .status()
            .map_err(|e| format!("failed to run {}: {}", args.program, e))?;
        if !status.success() {
            return Err(format!("{} {} exited with {}", args.program, item, status).into());
        }
        Ok(())
    }
}

/// Registry with every built-in task.
pub fn registry() -> TaskRegistry {
    TaskRegistry::new()
        .register::<CopyFile>()
        .register::<RunCommand>()
}
