//! Configuration loader with multi-source merging

use std::env;
use std::path::{Path, PathBuf};

use crate::{ConfigError, SquallConfig};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default project directory (current dir)
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "SQUALL".to_string(),
        }
    }

    /// Set the project directory
    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "SQUALL")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<SquallConfig, ConfigError> {
        let mut builder = config::Config::builder();

        // 1. Start with built-in defaults
        let defaults = SquallConfig::default();
        builder = builder.add_source(
            config::Config::try_from(&defaults)
                .map_err(|e| ConfigError::MergeError(e.to_string()))?,
        );

        // 2. Project config (squall.toml)
        let project_config_file = self.project_dir.join("squall.toml");
        if project_config_file.exists() {
            builder = builder.add_source(
                config::File::from(project_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Local config (squall.local.toml, gitignored)
        let local_config_file = self.project_dir.join("squall.local.toml");
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 4. Environment variables (SQUALL_*), e.g. SQUALL_GROUP_HEARTBEAT_MS
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        let merged = builder
            .build()
            .map_err(|e| ConfigError::MergeError(e.to_string()))?;

        let squall_config: SquallConfig = merged
            .try_deserialize()
            .map_err(|e| ConfigError::MergeError(e.to_string()))?;

        squall_config.validate()?;
        tracing::debug!(
            project_dir = %self.project_dir.display(),
            profiles = squall_config.profile.len(),
            "configuration loaded"
        );
        Ok(squall_config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default(self) -> SquallConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
