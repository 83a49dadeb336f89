//! Layered configuration: defaults, then files, then the environment.

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::{Paths, TesseraConfig};

pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    user_config: bool,
}

impl ConfigLoader {
    /// Loads from the current directory, falling back to `.`.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "TESSERA".to_string(),
            user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    pub fn without_user_config(mut self) -> Self {
        self.user_config = false;
        self
    }

    /// Merges every source, later ones winning, and validates the result.
    ///
    /// Nested keys in the environment are joined with `__`, so
    /// `TESSERA_ENGINE__FIXED_FEE=5` sets `engine.fixed_fee`.
    pub fn load(self) -> Result<TesseraConfig> {
        let defaults = config::Config::try_from(&TesseraConfig::default())
            .context("encoding built-in defaults")?;

        let files = Paths::new().layers(&self.project_dir, self.user_config);
        let builder = files.into_iter().fold(
            config::Config::builder().add_source(defaults),
            |builder, path| {
                builder.add_source(
                    config::File::from(path)
                        .required(false)
                        .format(config::FileFormat::Toml),
                )
            },
        );

        let merged = builder
            .add_source(
                config::Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("merging configuration sources")?;

        let loaded: TesseraConfig = merged
            .try_deserialize()
            .context("decoding merged configuration")?;
        loaded.validate().context("validating configuration")?;

        Ok(loaded)
    }

    /// Built-in defaults when loading fails for any reason.
    pub fn load_or_default(self) -> TesseraConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
