//! Optional runner config from `~/.raprc` and `./.raprc` (JSON), then env overrides.
//! CLI flags override both.

use std::env;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::dictutils::merge;
use crate::parallel::{ErrorPolicy, ExecutionMode};

pub const CONFIG_FILE: &str = ".raprc";
pub const MODE_ENV: &str = "RAP_MODE";
pub const WORKERS_ENV: &str = "RAP_WORKERS";

/// Runner settings; `None` means "use the built-in default".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Config {
    pub mode: Option<ExecutionMode>,
    pub workers: Option<usize>,
    pub on_error: Option<ErrorPolicy>,
}

impl Config {
    /// Apply `RAP_MODE` / `RAP_WORKERS`. Invalid values are ignored with a warning.
    pub fn apply_env(mut self) -> Self {
        if let Ok(mode) = env::var(MODE_ENV) {
            match mode.parse() {
                Ok(mode) => self.mode = Some(mode),
                Err(e) => warn!(var = MODE_ENV, error = %e, "ignoring environment override"),
            }
        }
        if let Ok(workers) = env::var(WORKERS_ENV) {
            match parse_workers(&Value::String(workers)) {
                Some(n) => self.workers = Some(n),
                None => warn!(var = WORKERS_ENV, "ignoring environment override: expected a positive integer"),
            }
        }
        self
    }

    fn from_object(obj: &Map<String, Value>) -> Self {
        let mut cfg = Config::default();
        if let Some(v) = obj.get("mode") {
            match v.as_str().map(str::parse::<ExecutionMode>) {
                Some(Ok(mode)) => cfg.mode = Some(mode),
                Some(Err(e)) => warn!(error = %e, "ignoring config key \"mode\""),
                None => warn!("ignoring config key \"mode\": expected a string"),
            }
        }
        if let Some(v) = obj.get("workers") {
            match parse_workers(v) {
                Some(n) => cfg.workers = Some(n),
                None => warn!("ignoring config key \"workers\": expected a positive integer"),
            }
        }
        if let Some(v) = obj.get("onError") {
            match v.as_str().map(str::parse::<ErrorPolicy>) {
                Some(Ok(policy)) => cfg.on_error = Some(policy),
                Some(Err(e)) => warn!(error = %e, "ignoring config key \"onError\""),
                None => warn!("ignoring config key \"onError\": expected a string"),
            }
        }
        cfg
    }
}

fn parse_workers(v: &Value) -> Option<usize> {
    let n = match v {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    usize::try_from(n).ok().filter(|n| *n > 0)
}

fn read_object(path: &Path) -> Option<Map<String, Value>> {
    if !path.is_file() {
        return None;
    }
    let s = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot read config file");
            return None;
        }
    };
    match serde_json::from_str::<Value>(&s) {
        Ok(Value::Object(obj)) => {
            debug!(path = %path.display(), "loaded config file");
            Some(obj)
        }
        Ok(_) => {
            warn!(path = %path.display(), "ignoring config file: expected a JSON object");
            None
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring invalid config file");
            None
        }
    }
}

fn config_candidates(dir: &Path, home: Option<PathBuf>) -> Vec<PathBuf> {
    let local = dir.join(CONFIG_FILE);
    let mut candidates = Vec::with_capacity(2);
    if let Some(home) = home {
        let global = home.join(CONFIG_FILE);
        if global != local {
            candidates.push(global);
        }
    }
    candidates.push(local);
    candidates
}

/// Load config from `~/.raprc` overlaid by `<dir>/.raprc`. Missing or invalid files
/// count as empty. Environment overrides are not applied here (see [`Config::apply_env`]).
pub fn load_config(dir: &Path) -> Config {
    load_config_from(dir, dirs::home_dir())
}

fn load_config_from(dir: &Path, home: Option<PathBuf>) -> Config {
    let merged = config_candidates(dir, home)
        .iter()
        .filter_map(|path| read_object(path))
        .fold(Map::new(), |acc, obj| merge(&acc, &obj));
    Config::from_object(&merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_missing_files_give_defaults() {
        let td = tempfile::tempdir().expect("tmp");
        assert_eq!(load_config_from(td.path(), None), Config::default());
    }

    #[test]
    fn test_local_file_overrides_home() {
        let home = tempfile::tempdir().expect("home");
        let project = tempfile::tempdir().expect("project");
        fs::write(
            home.path().join(CONFIG_FILE),
            r#"{ "mode": "process", "workers": 8, "onError": "collect" }"#,
        )
        .expect("write home");
        fs::write(project.path().join(CONFIG_FILE), r#"{ "workers": 2 }"#).expect("write local");

        let cfg = load_config_from(project.path(), Some(home.path().to_path_buf()));
        assert_eq!(cfg.mode, Some(ExecutionMode::Process));
        assert_eq!(cfg.workers, Some(2));
        assert_eq!(cfg.on_error, Some(ErrorPolicy::Collect));
    }

    #[test]
    fn test_invalid_file_and_values_are_ignored() {
        let home = tempfile::tempdir().expect("home");
        let project = tempfile::tempdir().expect("project");
        fs::write(home.path().join(CONFIG_FILE), "not json").expect("write home");
        fs::write(
            project.path().join(CONFIG_FILE),
            r#"{ "mode": "warp", "workers": 0, "onError": "log" }"#,
        )
        .expect("write local");

        let cfg = load_config_from(project.path(), Some(home.path().to_path_buf()));
        assert_eq!(cfg.mode, None);
        assert_eq!(cfg.workers, None);
        assert_eq!(cfg.on_error, Some(ErrorPolicy::Log));
    }

    #[test]
    fn test_parse_workers() {
        assert_eq!(parse_workers(&serde_json::json!(4)), Some(4));
        assert_eq!(parse_workers(&serde_json::json!("3")), Some(3));
        assert_eq!(parse_workers(&serde_json::json!(0)), None);
        assert_eq!(parse_workers(&serde_json::json!(-1)), None);
        assert_eq!(parse_workers(&serde_json::json!(true)), None);
    }

    #[test]
    fn test_same_dir_as_home_is_read_once() {
        let td = tempfile::tempdir().expect("tmp");
        let candidates = config_candidates(td.path(), Some(td.path().to_path_buf()));
        assert_eq!(candidates, vec![td.path().join(CONFIG_FILE)]);
    }
}
