//! YAML configuration parsing.
//!
//! Loads the project file and pipeline declaration files from disk.

use std::path::Path;
use thiserror::Error;

use crate::backend::BackendError;
use crate::core::retry::RetryError;

use super::types::{PipelineConfig, ProjectConfig};

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Retry settings failed validation.
    #[error(transparent)]
    Retry(#[from] RetryError),

    /// Backend construction failed.
    #[error(transparent)]
    Backend(BackendError),
}

/// Load the project configuration file.
pub fn load_project_config(path: impl AsRef<Path>) -> Result<ProjectConfig, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Load a single pipeline declaration file.
pub fn load_pipeline_config(path: impl AsRef<Path>) -> Result<PipelineConfig, ConfigError> {
    let content = std::fs::read_to_string(path.as_ref())?;
    let config: PipelineConfig = serde_yaml::from_str(&content)?;
    if config.name.trim().is_empty() {
        return Err(ConfigError::InvalidConfig(format!(
            "{}: pipeline name is empty",
            path.as_ref().display()
        )));
    }
    Ok(config)
}

/// Load all pipeline declarations from a directory, sorted by file name.
///
/// Only `*.yml` and `*.yaml` files are considered; a file that fails to
/// parse fails the whole load — a directory of declarations is one unit
/// of configuration.
pub fn load_pipeline_configs(dir: impl AsRef<Path>) -> Result<Vec<PipelineConfig>, ConfigError> {
    let mut paths: Vec<_> = std::fs::read_dir(dir.as_ref())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yml" || e == "yaml")
        })
        .collect();
    paths.sort();

    let mut configs = Vec::new();
    for path in paths {
        configs.push(load_pipeline_config(&path)?);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &Path, name: &str, content: &str) {
        let mut file = std::fs::File::create(dir.join(name)).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn test_load_project_config() {
        let dir = tempfile::tempdir().unwrap();
        write_file(
            dir.path(),
            "millrace.yaml",
            r#"
job_queue:
  type: memory
run:
  max_retries: 2
  retry_delay: 1.5
"#,
        );

        let config = load_project_config(dir.path().join("millrace.yaml")).unwrap();
        assert_eq!(config.run.max_retries, 2);
        assert_eq!(config.run.retry_delay, 1.5);
    }

    #[test]
    fn test_load_pipeline_configs_sorted() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "b.yaml", "name: beta\n");
        write_file(dir.path(), "a.yml", "name: alpha\nschedule:\n  interval: 60\n");
        write_file(dir.path(), "ignored.txt", "not yaml");

        let configs = load_pipeline_configs(dir.path()).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].name, "alpha");
        assert_eq!(configs[1].name, "beta");
        assert!(configs[0].schedule.is_some());
        assert!(configs[1].schedule.is_none());
    }

    #[test]
    fn test_empty_name_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "bad.yaml", "name: \"\"\n");

        let err = load_pipeline_configs(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConfig(_)));
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "bad.yaml", "name: [unclosed\n");

        let err = load_pipeline_configs(dir.path()).unwrap_err();
        assert!(matches!(err, ConfigError::YamlError(_)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = load_project_config("/does/not/exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::IoError(_)));
    }
}
