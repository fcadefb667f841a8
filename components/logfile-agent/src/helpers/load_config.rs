// Local crates
use crate::config::file_config::FileConfig;

// External crates
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::instrument;

/// Top-level declarative configuration for the subsystem.
///
/// The host usually builds [`FileConfig`] records itself; this loader
/// exists for hosts that prefer handing the whole subsystem a TOML file.
#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    /// Directory holding per-file offset state files.
    pub state_dir: PathBuf,
    /// One entry per tailing target.
    #[serde(default)]
    pub files: Vec<FileConfig>,
}

impl AgentConfig {
    /// Load and parse the configuration file
    #[instrument(
        name = "logfile_config_loader",
        target = "helpers::load_config",
        level = "trace",
        skip_all
    )]
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_ref = path.as_ref();

        tracing::trace!(
            configuration_file_path = %path_ref.display(),
            "Loading logfile agent configuration file"
        );

        let config_str = fs::read_to_string(path_ref)
            .with_context(|| format!("Failed to read config file at {:?}", path_ref))?;

        let config: AgentConfig = toml::from_str(&config_str)
            .with_context(|| format!("Failed to parse TOML from {:?}", path_ref))?;

        tracing::trace!(
            configuration_file_path = %path_ref.display(),
            file_entries = config.files.len(),
            "Configuration file loaded successfully"
        );
        Ok(config)
    }
}
