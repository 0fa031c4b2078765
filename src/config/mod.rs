//! Configuration loading.
//!
//! YAML project configuration (backend choice, retry defaults) and
//! per-pipeline declaration files. The loader parses files as-is and
//! produces fully-resolved declarations; precedence and merging beyond
//! per-file parsing live with the caller.

mod types;
mod yaml;

pub use types::{
    FifoConnection, PipelineConfig, ProjectConfig, QueueConfig, RunSection, SqliteConnection,
};
pub use yaml::{ConfigError, load_pipeline_configs, load_project_config};
