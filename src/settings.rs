//! Process settings read from the environment at startup.

use std::path::{Path, PathBuf};

pub const DEFAULT_MOUNTS_FILE: &str = "~/.tao_mounts.json";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("Invalid value for TAO_DOCKER_DISABLE: {0:?}, expected 0 or 1")]
    InvalidDockerDisable(String),
}

/// How the launcher should behave for this invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Run tasks directly on the host instead of in containers.
    pub docker_disabled: bool,
    pub mounts_file: PathBuf,
    /// Replaces the registry of every configured task.
    pub override_registry: Option<String>,
    /// Running under CI, where containers are started with a one-shot `docker run`.
    pub ci: bool,
    pub debug: bool,
    pub docker_host: Option<String>,
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Settings::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, SettingsError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let docker_disabled = match lookup("TAO_DOCKER_DISABLE").as_deref() {
            None | Some("0") => false,
            Some("1") => true,
            Some(other) => return Err(SettingsError::InvalidDockerDisable(other.to_string())),
        };
        let mounts_file = lookup("LAUNCHER_MOUNTS").unwrap_or_else(|| DEFAULT_MOUNTS_FILE.to_string());

        Ok(Settings {
            docker_disabled,
            mounts_file: expand_tilde(Path::new(&mounts_file)),
            override_registry: lookup("OVERRIDE_REGISTRY"),
            ci: lookup("CI_PROJECT_DIR").is_some(),
            debug: lookup("TAO_LAUNCHER_DEBUG").as_deref() == Some("1"),
            docker_host: lookup("DOCKER_HOST"),
        })
    }
}

/// Expand a leading `~` to the current user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
