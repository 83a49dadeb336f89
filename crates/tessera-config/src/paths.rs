//! Where configuration files live.
//!
//! Files are layered in a fixed order, lowest precedence first: the user
//! file under the XDG config directory, then `tessera.toml` and
//! `tessera.local.toml` in the project directory.

use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::ConfigError;

pub const PROJECT_FILE: &str = "tessera.toml";
pub const LOCAL_FILE: &str = "tessera.local.toml";

pub struct Paths {
    dirs: Option<ProjectDirs>,
}

impl Paths {
    pub fn new() -> Self {
        Self {
            dirs: ProjectDirs::from("org", "Tessera", "tessera"),
        }
    }

    /// `~/.config/tessera/config.toml` on Linux.
    pub fn user_config_file(&self) -> Result<PathBuf, ConfigError> {
        let dirs = self.dirs.as_ref().ok_or_else(|| {
            ConfigError::NoHomeDirectory("no home directory for user config".to_string())
        })?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    pub fn project_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(PROJECT_FILE)
    }

    pub fn local_config_file(project_dir: impl AsRef<Path>) -> PathBuf {
        project_dir.as_ref().join(LOCAL_FILE)
    }

    /// Existing config files in merge order.
    pub fn layers(&self, project_dir: &Path, include_user: bool) -> Vec<PathBuf> {
        let user = include_user
            .then(|| self.user_config_file().ok())
            .flatten();

        user.into_iter()
            .chain([
                Self::project_config_file(project_dir),
                Self::local_config_file(project_dir),
            ])
            .filter(|path| path.exists())
            .collect()
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}
