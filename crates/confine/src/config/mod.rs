use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::sandbox::cgroup::{CgroupError, own_cgroup};

mod loader;

/// Example configuration embedded at compile time.
///
/// Library users can access this to generate a starter config file.
pub const EXAMPLE_CONFIG: &str = include_str!("../../confine.example.toml");

/// Prefix of the environment variables [`Config::from_env`] reads
pub const ENV_PREFIX: &str = "CONFINE";

/// Name of the supervisor binary looked up next to the current executable and on PATH
pub const SUPERVISOR_BINARY: &str = "confine-supervisor";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file at {}: {source}", path.display())]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] config::ConfigError),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error(transparent)]
    Cgroup(#[from] CgroupError),
}

/// Config for confine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Config {
    /// Path to the supervisor binary.
    ///
    /// Defaults to `confine-supervisor` next to the current executable, then on PATH.
    #[serde(default)]
    pub supervisor_path: Option<PathBuf>,

    /// Delegated cgroup v2 directory under which each supervisor builds its tree.
    ///
    /// It must hold no processes of its own. Defaults to the cgroup of the process
    /// that spawns the supervisor, which only qualifies at the top of the hierarchy.
    #[serde(default)]
    pub cgroup_root: Option<PathBuf>,

    /// Sandboxes one supervisor runs at the same time
    #[serde(default = "default_max_parallel_sandboxes")]
    pub max_parallel_sandboxes: usize,

    /// Grace period for the supervisor to exit on shutdown before it is killed
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// The configured cgroup root, or the current process's own cgroup
    pub fn effective_cgroup_root(&self) -> Result<PathBuf, ConfigError> {
        match &self.cgroup_root {
            Some(root) => Ok(root.clone()),
            None => Ok(own_cgroup()?),
        }
    }

    /// Find the supervisor binary
    pub fn supervisor_binary(&self) -> PathBuf {
        if let Some(path) = &self.supervisor_path {
            return path.clone();
        }
        let next_to_exe = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(SUPERVISOR_BINARY)));
        // The supervisor is started with a cleared environment, so PATH is searched here
        let on_path = std::env::var_os("PATH")
            .into_iter()
            .flat_map(|path| std::env::split_paths(&path).collect::<Vec<_>>())
            .map(|dir| dir.join(SUPERVISOR_BINARY));
        next_to_exe
            .into_iter()
            .chain(on_path)
            .find(|candidate| candidate.is_file())
            .unwrap_or_else(|| PathBuf::from(SUPERVISOR_BINARY))
    }

    /// Environment variables that recreate this config through [`Config::from_env`]
    pub fn to_env(&self) -> Vec<(String, String)> {
        let var = |key: &str| format!("{ENV_PREFIX}_{}", key.to_uppercase());
        let mut vars = vec![
            (
                var("max_parallel_sandboxes"),
                self.max_parallel_sandboxes.to_string(),
            ),
            (
                var("shutdown_timeout_ms"),
                self.shutdown_timeout_ms.to_string(),
            ),
        ];
        if let Some(path) = &self.supervisor_path {
            vars.push((var("supervisor_path"), path.display().to_string()));
        }
        if let Some(root) = &self.cgroup_root {
            vars.push((var("cgroup_root"), root.display().to_string()));
        }
        vars
    }

    pub(crate) fn cgroup_root_is_valid(root: &Path) -> bool {
        root.is_absolute()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            supervisor_path: None,
            cgroup_root: None,
            max_parallel_sandboxes: default_max_parallel_sandboxes(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_max_parallel_sandboxes() -> usize {
    4
}

fn default_shutdown_timeout_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.max_parallel_sandboxes, 4);
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(1));
        assert!(config.supervisor_path.is_none());
        assert!(config.cgroup_root.is_none());
    }

    #[test]
    fn example_config_matches_defaults() {
        let config = Config::parse_toml(EXAMPLE_CONFIG).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn supervisor_binary_custom_path() {
        let config = Config {
            supervisor_path: Some(PathBuf::from("/opt/confine/confine-supervisor")),
            ..Config::default()
        };
        assert_eq!(
            config.supervisor_binary(),
            PathBuf::from("/opt/confine/confine-supervisor")
        );
    }

    #[test]
    fn supervisor_binary_falls_back_to_name() {
        // The test binary's directory has no supervisor next to it
        let binary = Config::default().supervisor_binary();
        assert_eq!(binary.file_name().unwrap(), SUPERVISOR_BINARY);
    }

    #[test]
    fn effective_cgroup_root_prefers_config() {
        let config = Config {
            cgroup_root: Some(PathBuf::from("/sys/fs/cgroup/confine")),
            ..Config::default()
        };
        assert_eq!(
            config.effective_cgroup_root().unwrap(),
            PathBuf::from("/sys/fs/cgroup/confine")
        );
    }

    #[test]
    fn to_env_names_every_set_key() {
        let config = Config {
            cgroup_root: Some(PathBuf::from("/sys/fs/cgroup/x")),
            max_parallel_sandboxes: 2,
            ..Config::default()
        };
        let env = config.to_env();
        assert!(env.contains(&("CONFINE_MAX_PARALLEL_SANDBOXES".into(), "2".into())));
        assert!(env.contains(&("CONFINE_SHUTDOWN_TIMEOUT_MS".into(), "1000".into())));
        assert!(env.contains(&("CONFINE_CGROUP_ROOT".into(), "/sys/fs/cgroup/x".into())));
        assert!(!env.iter().any(|(k, _)| k == "CONFINE_SUPERVISOR_PATH"));
    }
}
