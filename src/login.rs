//! Registry credentials from the docker CLI config, checked before a task is launched and
//! forwarded to the daemon when an image has to be pulled.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine as _;
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

pub const DOCKER_CONFIG: &str = "~/.docker/config.json";

#[derive(thiserror::Error, Debug)]
pub enum LoginError {
    #[error("No docker config found at {0}. Did you run docker login?")]
    MissingConfig(PathBuf),
    #[error("Unable to read docker config {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid JSON in docker config {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Docker CLI hasn't been logged in to a registry. Please run `docker login {0}`")]
    NoAuths(String),
    #[error("Docker not logged in to {0}. Please run docker login {0}")]
    NotLoggedIn(String),
    #[error("Invalid credentials for {0} in the docker config. Please run docker login {0}")]
    InvalidAuth(String),
}

/// Credentials as the daemon expects them in `X-Registry-Auth`.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct RegistryAuth {
    pub username: String,
    pub password: String,
    pub serveraddress: String,
}

impl RegistryAuth {
    /// Base64url encoded JSON, the `X-Registry-Auth` header value.
    pub fn header(&self) -> Result<String, serde_json::Error> {
        Ok(URL_SAFE.encode(serde_json::to_vec(self)?))
    }
}

impl fmt::Debug for RegistryAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryAuth")
            .field("username", &self.username)
            .field("serveraddress", &self.serveraddress)
            .finish_non_exhaustive()
    }
}

/// One `auths.<registry>` entry written by `docker login`.
#[derive(Deserialize)]
struct AuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

/// Check that `docker_config` holds an `auths` entry for `registry` and return its credentials.
///
/// Entries kept by a credential store have no inline credentials; those give `None` and the
/// daemon pulls anonymously.
pub fn ensure_logged_in(docker_config: &Path, registry: &str) -> Result<Option<RegistryAuth>, LoginError> {
    info!("Registry: {registry}");
    let contents = std::fs::read_to_string(docker_config).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => LoginError::MissingConfig(docker_config.to_path_buf()),
        _ => LoginError::Io {
            path: docker_config.to_path_buf(),
            source,
        },
    })?;
    let data: Value = serde_json::from_str(&contents).map_err(|source| LoginError::Json {
        path: docker_config.to_path_buf(),
        source,
    })?;

    let auths = data
        .get("auths")
        .and_then(Value::as_object)
        .ok_or_else(|| LoginError::NoAuths(registry.to_string()))?;
    let entry = auths
        .get(registry)
        .ok_or_else(|| LoginError::NotLoggedIn(registry.to_string()))?;
    let entry: AuthEntry =
        serde_json::from_value(entry.clone()).map_err(|_| LoginError::InvalidAuth(registry.to_string()))?;
    credentials(entry, registry)
}

fn credentials(entry: AuthEntry, registry: &str) -> Result<Option<RegistryAuth>, LoginError> {
    let invalid = || LoginError::InvalidAuth(registry.to_string());
    let (username, password) = match entry {
        AuthEntry { auth: Some(auth), .. } if !auth.is_empty() => {
            let decoded = STANDARD.decode(auth.trim()).map_err(|_| invalid())?;
            let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
            let (username, password) = decoded.split_once(':').ok_or_else(invalid)?;
            (username.to_string(), password.to_string())
        }
        AuthEntry {
            username: Some(username),
            password: Some(password),
            ..
        } => (username, password),
        _ => {
            debug!("No inline credentials for {registry}, pulling without them.");
            return Ok(None);
        }
    };
    Ok(Some(RegistryAuth {
        username,
        password,
        serveraddress: registry.to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docker_config(contents: &str) -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        file
    }

    #[test]
    fn accepts_logged_in_registry() {
        // "$oauthtoken:secret"
        let config = docker_config(r#"{"auths": {"nvcr.io": {"auth": "JG9hdXRodG9rZW46c2VjcmV0"}}}"#);
        let auth = ensure_logged_in(config.path(), "nvcr.io").unwrap().unwrap();
        assert_eq!(auth.username, "$oauthtoken");
        assert_eq!(auth.password, "secret");
        assert_eq!(auth.serveraddress, "nvcr.io");
    }

    #[test]
    fn credential_store_entry_has_no_inline_auth() {
        let config = docker_config(r#"{"auths": {"nvcr.io": {}}, "credsStore": "desktop"}"#);
        assert_eq!(ensure_logged_in(config.path(), "nvcr.io").unwrap(), None);
    }

    #[test]
    fn rejects_undecodable_auth() {
        let config = docker_config(r#"{"auths": {"nvcr.io": {"auth": "not base64!"}}}"#);
        assert!(matches!(
            ensure_logged_in(config.path(), "nvcr.io"),
            Err(LoginError::InvalidAuth(_))
        ));
    }

    #[test]
    fn header_is_base64url_json() {
        let auth = RegistryAuth {
            username: "$oauthtoken".into(),
            password: "secret".into(),
            serveraddress: "nvcr.io".into(),
        };
        let header = auth.header().unwrap();
        let decoded: Value = serde_json::from_slice(&URL_SAFE.decode(header).unwrap()).unwrap();
        assert_eq!(
            decoded,
            serde_json::json!({"username": "$oauthtoken", "password": "secret", "serveraddress": "nvcr.io"})
        );
        assert!(!format!("{auth:?}").contains("secret"));
    }

    #[test]
    fn rejects_other_registry() {
        let config = docker_config(r#"{"auths": {"docker.io": {}}}"#);
        let err = ensure_logged_in(config.path(), "nvcr.io").unwrap_err();
        assert!(matches!(err, LoginError::NotLoggedIn(_)));
        assert_eq!(err.to_string(), "Docker not logged in to nvcr.io. Please run docker login nvcr.io");
    }

    #[test]
    fn rejects_config_without_auths() {
        let config = docker_config(r#"{"credsStore": "desktop"}"#);
        assert!(matches!(ensure_logged_in(config.path(), "nvcr.io"), Err(LoginError::NoAuths(_))));
    }

    #[test]
    fn reports_missing_config() {
        assert!(matches!(
            ensure_logged_in(Path::new("/nonexistent/.docker/config.json"), "nvcr.io"),
            Err(LoginError::MissingConfig(_))
        ));
    }
}
