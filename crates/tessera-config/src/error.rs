//! Configuration errors

use std::path::PathBuf;

use tessera_forks::ForkConfigError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("malformed TOML in {path}: {source}")]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("fork schedule: {0}")]
    InvalidForks(#[from] ForkConfigError),

    #[error("no rule set registered for fork '{0}'")]
    UnknownRuleSet(String),

    #[error("engine settings: {0}")]
    InvalidEngine(String),

    #[error("{0}")]
    NoHomeDirectory(String),
}
