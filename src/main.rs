//! Thin CLI layer: parse args, styled output, and call into rap-common.
//! Crash-proof: panic caught and reported; all errors return Result.

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::env;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;
use tracing::debug;

use rap_common::tasks::{self, CommandArgs, CopyArgs, CopyFile, RunCommand};
use rap_common::{
    abspath, copy, deepcopy, get_filesize, load_config, pretty_filesize, serve_if_worker,
    timeit, walk, walk_by_extensions, ErrorPolicy, ExecutionMode, RunError, TaskRunner, Walk,
};

const LOG_ENV: &str = "RAP_LOG";

// ---- UI helpers (no-op when stdout isn't a TTY) ----

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn success(msg: &str) {
    if use_color() {
        println!("{}", msg.green());
    } else {
        println!("{}", msg);
    }
}

fn error(msg: &str) {
    if use_color() {
        eprintln!("{}", msg.red());
    } else {
        eprintln!("{}", msg);
    }
}

fn info(msg: &str) {
    if use_color() {
        println!("{}", msg.cyan());
    } else {
        println!("{}", msg);
    }
}

fn dim(msg: &str) {
    if use_color() {
        println!("{}", msg.dimmed());
    } else {
        println!("{}", msg);
    }
}

/// Run a long-running job; in quiet mode show a spinner until done.
fn run_with_spinner<T, F>(message: &str, quiet: bool, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    if !quiet {
        return f();
    }
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = f();
        let _ = tx.send(result);
    });
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠁⠂⠄⠈⠐⠠⠰⠸⠹")
        .template("{spinner:.dim} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    let tick = Duration::from_millis(80);
    loop {
        match rx.recv_timeout(tick) {
            Ok(res) => {
                spinner.finish_and_clear();
                return res;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => {
                spinner.finish_and_clear();
                return Err("Operation failed.".to_string());
            }
            Err(mpsc::RecvTimeoutError::Timeout) => spinner.tick(),
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

// ---- Shared arguments ----

fn ext_arg() -> Arg {
    Arg::new("ext")
        .long("ext")
        .action(ArgAction::Append)
        .help("Only files with this extension (repeatable, e.g. --ext rs --ext toml)")
}

fn quiet_arg() -> Arg {
    Arg::new("quiet")
        .short('q')
        .long("quiet")
        .action(ArgAction::SetTrue)
        .help("Minimal output; show spinner when busy")
}

fn runner_args() -> [Arg; 3] {
    [
        Arg::new("mode")
            .long("mode")
            .value_parser(["debug", "thread", "process"])
            .help("Execution mode (default: thread, or RAP_MODE / .raprc)"),
        Arg::new("workers")
            .short('j')
            .long("workers")
            .value_parser(value_parser!(usize))
            .help("Number of workers (default: CPU count, or RAP_WORKERS / .raprc)"),
        Arg::new("collect-errors")
            .long("collect-errors")
            .action(ArgAction::SetTrue)
            .help("Report every failed item at the end instead of logging and continuing"),
    ]
}

/// Config file, then env, then flags.
fn build_runner(m: &ArgMatches) -> Result<TaskRunner, String> {
    let cwd = env::current_dir().map_err(|e| e.to_string())?;
    let config = load_config(&cwd).apply_env();
    let mut runner = TaskRunner::from_config(&config);
    if let Some(mode) = m.get_one::<String>("mode") {
        let mode: ExecutionMode = mode.parse().map_err(|e: rap_common::ParseError| e.to_string())?;
        runner = runner.with_mode(mode);
    }
    if let Some(&workers) = m.get_one::<usize>("workers") {
        runner = runner.with_workers(workers);
    }
    if m.get_flag("collect-errors") {
        runner = runner.with_error_policy(ErrorPolicy::Collect);
    }
    debug!(
        mode = %runner.mode(),
        workers = runner.workers(),
        on_error = %runner.error_policy(),
        "runner configured"
    );
    Ok(runner)
}

fn walk_matching(root: PathBuf, m: &ArgMatches) -> Walk {
    match m.get_many::<String>("ext") {
        Some(exts) => walk_by_extensions(root, exts.cloned()),
        None => walk(root),
    }
}

/// Print every collected failure and fold them into one message.
fn report_run_error(e: RunError) -> String {
    let failures = e.failures();
    if failures.len() > 1 {
        for failure in failures {
            error(&format!("  {}", failure));
        }
    }
    e.to_string()
}

// ---- Subcommands ----

fn cmd_walk(m: &ArgMatches) -> Result<(), String> {
    let dir = m.get_one::<String>("dir").map(PathBuf::from).unwrap_or_default();
    if !dir.is_dir() {
        return Err(format!("Not a directory: {}", dir.display()));
    }
    let root = if m.get_flag("absolute") {
        abspath(&dir).map_err(|e| e.to_string())?
    } else {
        dir
    };
    let files: Vec<String> = walk_matching(root, m)
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    if m.get_flag("json") {
        let out = serde_json::to_string_pretty(&files).map_err(|e| e.to_string())?;
        println!("{}", out);
    } else {
        for f in &files {
            println!("{}", f);
        }
    }
    Ok(())
}

fn cmd_size(m: &ArgMatches) -> Result<(), String> {
    let mut total = 0u64;
    for path in m.get_many::<String>("path").into_iter().flatten() {
        let size = get_filesize(path).map_err(|e| format!("{}: {}", path, e))?;
        total += size;
        println!("{}\t{}", pretty_filesize(size), path);
    }
    if m.get_flag("total") {
        success(&format!("{}\ttotal", pretty_filesize(total)));
    }
    Ok(())
}

fn cmd_copy(m: &ArgMatches) -> Result<(), String> {
    let src = m.get_one::<String>("src").cloned().unwrap_or_default();
    let dest = m.get_one::<String>("dest").cloned().unwrap_or_default();
    let result = if m.get_flag("preserve") {
        deepcopy(&src, &dest)
    } else {
        copy(&src, &dest)
    };
    result.map_err(|e| format!("Copy {} -> {} failed: {}", src, dest, e))?;
    success(&format!("Copied {} -> {}", src, dest));
    Ok(())
}

fn cmd_mirror(m: &ArgMatches) -> Result<(), String> {
    let src = m.get_one::<String>("src").map(PathBuf::from).unwrap_or_default();
    let dest = m.get_one::<String>("dest").map(PathBuf::from).unwrap_or_default();
    if !src.is_dir() {
        return Err(format!("Not a directory: {}", src.display()));
    }
    let quiet = m.get_flag("quiet");
    let runner = build_runner(m)?;
    let args = CopyArgs {
        source_root: abspath(&src).map_err(|e| e.to_string())?,
        dest_root: abspath(&dest).map_err(|e| e.to_string())?,
        preserve_metadata: m.get_flag("preserve"),
    };
    let files: Vec<PathBuf> = walk_matching(args.source_root.clone(), m).collect();
    let total: u64 = files.iter().filter_map(|f| get_filesize(f).ok()).sum();
    let count = files.len();
    if !quiet {
        info(&format!(
            "Mirroring {} files ({}) with {} x {} …",
            count,
            pretty_filesize(total),
            runner.workers(),
            runner.mode()
        ));
    }

    let (secs, result) = run_with_spinner("Copying…", quiet, move || {
        Ok(timeit(|| runner.execute::<CopyFile, _>(files, &args)))
    })?;
    result.map_err(report_run_error)?;
    success(&format!(
        "Mirrored {} files ({}) in {:.2}s",
        count,
        pretty_filesize(total),
        secs
    ));
    Ok(())
}

fn cmd_exec(m: &ArgMatches) -> Result<(), String> {
    let dir = m.get_one::<String>("dir").map(PathBuf::from).unwrap_or_default();
    if !dir.is_dir() {
        return Err(format!("Not a directory: {}", dir.display()));
    }
    let mut command = m.get_many::<String>("command").into_iter().flatten().cloned();
    let program = command.next().ok_or("Missing program after --")?;
    let args = CommandArgs { program, args: command.collect() };
    let quiet = m.get_flag("quiet");
    let runner = build_runner(m)?;
    let items: Vec<String> = walk_matching(dir, m)
        .map(|p| p.to_string_lossy().into_owned())
        .collect();
    let count = items.len();
    if !quiet {
        dim(&format!("Running {} on {} files", args.program, count));
    }

    let (secs, result) = run_with_spinner("Running…", quiet, move || {
        Ok(timeit(|| runner.execute::<RunCommand, _>(items, &args)))
    })?;
    result.map_err(report_run_error)?;
    success(&format!("Ran {} items in {:.2}s", count, secs));
    Ok(())
}

fn cmd_config(m: &ArgMatches) -> Result<(), String> {
    let runner = build_runner(m)?;
    let effective = serde_json::json!({
        "mode": runner.mode().as_str(),
        "workers": runner.workers(),
        "onError": runner.error_policy().as_str(),
    });
    let out = serde_json::to_string_pretty(&effective).map_err(|e| e.to_string())?;
    println!("{}", out);
    Ok(())
}

fn cli() -> Command {
    Command::new("rap")
        .version(env!("CARGO_PKG_VERSION"))
        .about("File-tree utilities with a thread/process task runner")
        .after_help(
            "Examples:\n  rap walk src --ext rs\n  rap size Cargo.toml src/main.rs --total\n  rap mirror assets build/assets --mode process -j 4\n  rap exec src --ext rs -- wc -l\n  rap config",
        )
        .subcommand(
            Command::new("walk")
                .about("List files under a directory (files before subdirectories)")
                .arg(Arg::new("dir").required(true).help("Directory to walk"))
                .arg(ext_arg())
                .arg(
                    Arg::new("absolute")
                        .long("absolute")
                        .action(ArgAction::SetTrue)
                        .help("Print absolute paths"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as a JSON array"),
                ),
        )
        .subcommand(
            Command::new("size")
                .about("Show human-readable file sizes")
                .arg(
                    Arg::new("path")
                        .required(true)
                        .num_args(1..)
                        .help("File(s) to measure"),
                )
                .arg(
                    Arg::new("total")
                        .long("total")
                        .action(ArgAction::SetTrue)
                        .help("Also print the sum"),
                ),
        )
        .subcommand(
            Command::new("copy")
                .about("Copy a file, creating parent directories as needed")
                .arg(Arg::new("src").required(true).help("Source file"))
                .arg(Arg::new("dest").required(true).help("Destination file or directory"))
                .arg(
                    Arg::new("preserve")
                        .long("preserve")
                        .action(ArgAction::SetTrue)
                        .help("Also copy permissions and timestamps"),
                ),
        )
        .subcommand(
            Command::new("mirror")
                .about("Copy a directory tree in parallel")
                .arg(Arg::new("src").required(true).help("Source directory"))
                .arg(Arg::new("dest").required(true).help("Destination directory"))
                .arg(ext_arg())
                .arg(
                    Arg::new("preserve")
                        .long("preserve")
                        .action(ArgAction::SetTrue)
                        .help("Also copy permissions and timestamps"),
                )
                .args(runner_args())
                .arg(quiet_arg()),
        )
        .subcommand(
            Command::new("exec")
                .about("Run a program once per file, in parallel")
                .arg(Arg::new("dir").required(true).help("Directory to walk"))
                .arg(ext_arg())
                .args(runner_args())
                .arg(quiet_arg())
                .arg(
                    Arg::new("command")
                        .required(true)
                        .num_args(1..)
                        .last(true)
                        .help("Program and leading arguments; the file path is appended"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective runner configuration as JSON")
                .args(runner_args()),
        )
}

fn run() -> Result<(), String> {
    let matches = cli().get_matches();
    match matches.subcommand() {
        Some(("walk", sub_m)) => cmd_walk(sub_m),
        Some(("size", sub_m)) => cmd_size(sub_m),
        Some(("copy", sub_m)) => cmd_copy(sub_m),
        Some(("mirror", sub_m)) => cmd_mirror(sub_m),
        Some(("exec", sub_m)) => cmd_exec(sub_m),
        Some(("config", sub_m)) => cmd_config(sub_m),
        _ => {
            println!("rap {}", env!("CARGO_PKG_VERSION"));
            dim("\nRun `rap --help` for details.");
            Ok(())
        }
    }
}

fn main() {
    init_tracing();
    if let Some(code) = serve_if_worker(&tasks::registry()) {
        std::process::exit(code);
    }

    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error(&e);
            1
        }
        Err(_) => {
            error("An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}
