//! # Launcher configuration
//!
//! The launcher config maps every task to the docker image and tag it runs in.
//! Three layouts exist, told apart by `format_version`:
//!
//! - `1.0`: `dockers.<image>` holds one tag and its task list.
//! - `2.0`: `dockers.<image>.<tag>` holds the registry and task list.
//! - `3.0`: the `2.0` layout nested under `task_group.<group>`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde_derive::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::task::Task;
use crate::Entrypoint;

/// Group name used by the single-group layouts.
pub const DEFAULT_TASK_GROUP: &str = "container_actions";

const BUNDLED_CONFIG: &str = include_str!("../config/config.json");
const BUNDLED_DEPLOY_CONFIG: &str = include_str!("../config/config_deploy.json");

/// Task group name to the tasks in it, by task name.
pub type TaskMap = BTreeMap<String, BTreeMap<String, Task>>;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Config path must be a valid unix path. No file found at: {0}")]
    NotFound(PathBuf),
    #[error("Unable to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid JSON in config {origin}")]
    Json {
        origin: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{0} is a required key in the launcher config")]
    MissingKey(String),
    #[error("Invalid format type: {0}")]
    UnsupportedVersion(String),
    #[error("The config data must contain tasks associated with the docker {0}")]
    MissingTasks(String),
    #[error("Invalid data format for {0}, expected an object")]
    InvalidFormat(String),
    #[error("Invalid entry for {path}")]
    InvalidEntry {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Where the launcher config comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    /// A user override in `~/.tao`.
    File(PathBuf),
    /// The default config compiled into the binary.
    Bundled { name: &'static str, contents: &'static str },
}

impl ConfigSource {
    pub fn load(&self) -> Result<Value, ConfigError> {
        match self {
            ConfigSource::File(path) => load_config_file(path),
            ConfigSource::Bundled { name, contents } => {
                serde_json::from_str(contents).map_err(|source| ConfigError::Json {
                    origin: name.to_string(),
                    source,
                })
            }
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Bundled { name, .. } => write!(f, "bundled {name}"),
        }
    }
}

/// Pick the config for an entrypoint: the user's override when present, else the bundled one.
pub fn locate(entrypoint: Entrypoint) -> ConfigSource {
    locate_in(dirs::home_dir().as_deref(), entrypoint)
}

fn locate_in(home: Option<&Path>, entrypoint: Entrypoint) -> ConfigSource {
    let bundled = locate_bundled(entrypoint);
    if let (Some(home), ConfigSource::Bundled { name, .. }) = (home, &bundled) {
        let override_path = home.join(".tao").join(name);
        if override_path.is_file() {
            info!("Initializing configuration from: {}", override_path.display());
            return ConfigSource::File(override_path);
        }
    }
    debug!("Loading default config: {bundled}");
    bundled
}

/// The default config compiled into the binary.
pub fn locate_bundled(entrypoint: Entrypoint) -> ConfigSource {
    match entrypoint {
        Entrypoint::Tao => ConfigSource::Bundled {
            name: "config.json",
            contents: BUNDLED_CONFIG,
        },
        Entrypoint::TaoDeploy => ConfigSource::Bundled {
            name: "config_deploy.json",
            contents: BUNDLED_DEPLOY_CONFIG,
        },
    }
}

pub fn load_config_file(path: &Path) -> Result<Value, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| match source.kind() {
        io::ErrorKind::NotFound => ConfigError::NotFound(path.to_path_buf()),
        _ => ConfigError::Io {
            path: path.to_path_buf(),
            source,
        },
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Json {
        origin: path.display().to_string(),
        source,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    V1,
    V2,
    V3,
}

impl FormatVersion {
    fn from_value(value: &Value) -> Result<Self, ConfigError> {
        match value.as_f64() {
            Some(v) if v == 1.0 => Ok(FormatVersion::V1),
            Some(v) if v == 2.0 => Ok(FormatVersion::V2),
            Some(v) if v == 3.0 => Ok(FormatVersion::V3),
            _ => Err(ConfigError::UnsupportedVersion(value.to_string())),
        }
    }
}

/// Tasks and images read out of a launcher config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    pub format_version: FormatVersion,
    pub task_map: TaskMap,
    pub images: BTreeSet<String>,
}

impl LauncherConfig {
    pub fn task(&self, group: &str, task: &str) -> Option<&Task> {
        self.task_map.get(group).and_then(|tasks| tasks.get(task))
    }
}

/// `1.0` image entry.
#[derive(Deserialize)]
struct ImageEntry {
    docker_tag: String,
    docker_registry: String,
    #[serde(default)]
    docker_digest: Option<String>,
    tasks: Vec<String>,
}

/// `2.0` and `3.0` tag entry.
#[derive(Deserialize)]
struct TagEntry {
    docker_registry: String,
    #[serde(default)]
    docker_digest: Option<String>,
    tasks: Vec<String>,
}

pub fn parse_launcher_config(data: &Value, override_registry: Option<&str>) -> Result<LauncherConfig, ConfigError> {
    let root = object(data, "launcher config")?;
    let format_version = FormatVersion::from_value(field(root, "format_version")?)?;

    let mut task_map = TaskMap::new();
    let mut images = BTreeSet::new();
    match format_version {
        FormatVersion::V1 => {
            let mut tasks = BTreeMap::new();
            for (image, image_data) in object(field(root, "dockers")?, "dockers")? {
                debug!("Processing {image}");
                if image_data.get("tasks").is_none() {
                    return Err(ConfigError::MissingTasks(image.clone()));
                }
                let entry: ImageEntry = decode_entry(image_data, image)?;
                for name in &entry.tasks {
                    let task = Task::new(
                        name,
                        image,
                        &entry.docker_tag,
                        &entry.docker_registry,
                        entry.docker_digest.clone(),
                        override_registry,
                    );
                    tasks.insert(name.clone(), task);
                }
                images.insert(image.clone());
            }
            task_map.insert(DEFAULT_TASK_GROUP.to_string(), tasks);
        }
        FormatVersion::V2 => {
            let mut tasks = BTreeMap::new();
            parse_dockers(field(root, "dockers")?, override_registry, &mut tasks, &mut images)?;
            task_map.insert(DEFAULT_TASK_GROUP.to_string(), tasks);
        }
        FormatVersion::V3 => {
            for (group, group_data) in object(field(root, "task_group")?, "task_group")? {
                debug!("Configuring task group {group}");
                let group_data = object(group_data, group)?;
                let mut tasks = BTreeMap::new();
                parse_dockers(field(group_data, "dockers")?, override_registry, &mut tasks, &mut images)?;
                task_map.insert(group.clone(), tasks);
            }
        }
    }

    Ok(LauncherConfig {
        format_version,
        task_map,
        images,
    })
}

/// Walk a `dockers.<image>.<tag>` object.
fn parse_dockers(
    dockers: &Value,
    override_registry: Option<&str>,
    tasks: &mut BTreeMap<String, Task>,
    images: &mut BTreeSet<String>,
) -> Result<(), ConfigError> {
    for (image, image_data) in object(dockers, "dockers")? {
        debug!("Extracting tasks from docker {image}");
        for (tag, tag_data) in object(image_data, image)? {
            let entry: TagEntry = decode_entry(tag_data, &format!("{image}:{tag}"))?;
            for name in &entry.tasks {
                let task = Task::new(
                    name,
                    image,
                    tag,
                    &entry.docker_registry,
                    entry.docker_digest.clone(),
                    override_registry,
                );
                tasks.insert(name.clone(), task);
            }
        }
        images.insert(image.clone());
    }
    Ok(())
}

fn object<'a>(value: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ConfigError> {
    value.as_object().ok_or_else(|| ConfigError::InvalidFormat(what.to_string()))
}

fn field<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Value, ConfigError> {
    map.get(key).ok_or_else(|| ConfigError::MissingKey(key.to_string()))
}

fn decode_entry<T: serde::de::DeserializeOwned>(value: &Value, path: &str) -> Result<T, ConfigError> {
    serde_json::from_value(value.clone()).map_err(|source| ConfigError::InvalidEntry {
        path: path.to_string(),
        source,
    })
}
