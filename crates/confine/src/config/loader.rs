//! Configuration file loading for confine
//!
//! Handles loading and parsing configuration using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX};

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::ReadFile {
                path: path.to_path_buf(),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }
        let config = ConfigBuilder::builder()
            .add_source(File::from(path))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `CONFINE_*` environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_source(Environment::with_prefix(ENV_PREFIX))
    }

    /// Load configuration from the given variables, as if they were the environment
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let source = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::from_env_source(Environment::with_prefix(ENV_PREFIX).source(Some(source)))
    }

    fn from_env_source(env: Environment) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(env.try_parsing(true))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_parallel_sandboxes == 0 {
            return Err(ConfigError::Invalid(
                "max_parallel_sandboxes must be at least 1".to_string(),
            ));
        }
        if self.shutdown_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "shutdown_timeout_ms must be at least 1".to_string(),
            ));
        }
        if let Some(root) = &self.cgroup_root
            && !Config::cgroup_root_is_valid(root)
        {
            return Err(ConfigError::Invalid(format!(
                "cgroup_root must be an absolute path, got {}",
                root.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_empty_config() {
        let config = Config::parse_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
supervisor_path = "/usr/local/bin/confine-supervisor"
cgroup_root = "/sys/fs/cgroup/confine"
max_parallel_sandboxes = 16
shutdown_timeout_ms = 250
"#;

        let config = Config::parse_toml(toml).unwrap();
        assert_eq!(
            config.supervisor_path,
            Some(PathBuf::from("/usr/local/bin/confine-supervisor"))
        );
        assert_eq!(config.cgroup_root, Some(PathBuf::from("/sys/fs/cgroup/confine")));
        assert_eq!(config.max_parallel_sandboxes, 16);
        assert_eq!(config.shutdown_timeout_ms, 250);
    }

    #[test]
    fn test_invalid_zero_parallel() {
        let result = Config::parse_toml("max_parallel_sandboxes = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_zero_shutdown_timeout() {
        let result = Config::parse_toml("shutdown_timeout_ms = 0");
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_relative_cgroup_root() {
        let result = Config::parse_toml(r#"cgroup_root = "confine""#);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let result = Config::parse_toml(r#"max_parallel_sandboxes = "many""#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/nonexistent/confine.toml");
        assert!(matches!(result, Err(ConfigError::ReadFile { .. })));
    }

    #[test]
    fn test_from_vars() {
        let config = Config::from_vars([
            ("CONFINE_MAX_PARALLEL_SANDBOXES", "8"),
            ("CONFINE_CGROUP_ROOT", "/sys/fs/cgroup/x"),
            ("UNRELATED", "1"),
        ])
        .unwrap();
        assert_eq!(config.max_parallel_sandboxes, 8);
        assert_eq!(config.cgroup_root, Some(PathBuf::from("/sys/fs/cgroup/x")));
        assert_eq!(config.shutdown_timeout_ms, 1000);
    }

    #[test]
    fn test_env_round_trip() {
        let config = Config {
            supervisor_path: Some(PathBuf::from("/bin/confine-supervisor")),
            cgroup_root: Some(PathBuf::from("/sys/fs/cgroup/y")),
            max_parallel_sandboxes: 3,
            shutdown_timeout_ms: 50,
        };
        assert_eq!(Config::from_vars(config.to_env()).unwrap(), config);
    }

    #[test]
    fn test_log_filter_variable_is_ignored() {
        let config = Config::from_vars([("CONFINE_LOG", "debug")]).unwrap();
        assert_eq!(config, Config::default());
    }
}
