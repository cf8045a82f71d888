//! # Mounts file
//!
//! The user-owned JSON file describing what a launched container gets from the host:
//!
//! ```json
//! {
//!     "Mounts": [{"source": "~/tao-experiments", "destination": "/workspace/tao-experiments"}],
//!     "Envs": [{"variable": "CUDA_VISIBLE_DEVICES", "value": "0"}],
//!     "DockerOptions": {"user": "1000:1000", "shm_size": "16G", "ulimits": {"memlock": -1}}
//! }
//! ```

use std::collections::BTreeMap;
use std::io;
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};

use serde_derive::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::docker_client::{PortBinding, Ulimit};
use crate::settings::expand_tilde;

pub const VALID_DOCKER_ARGS: [&str; 7] = ["user", "ports", "shm_size", "ulimits", "privileged", "network", "tty"];
pub const VALID_PORT_PROTOCOLS: [&str; 3] = ["tcp", "udp", "sctp"];

#[derive(thiserror::Error, Debug)]
pub enum MountsError {
    #[error("Unable to read mounts file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Invalid JSON in mounts file {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Invalid mounts file {0}, expected a JSON object")]
    NotAnObject(PathBuf),
    #[error("Invalid mounts file {0}. Requires Mounts key.")]
    MissingMounts(PathBuf),
    #[error("Invalid field {key} found in {path} file.")]
    UnknownKey { key: String, path: PathBuf },
    #[error("{section} are not formatted correctly in {path}")]
    Malformed {
        section: &'static str,
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("Mount point source path doesn't exist. {0}")]
    SourceMissing(PathBuf),
    #[error(
        "The parameter \"{0}\" mentioned in the config file isn't a valid option.\n\
         Please choose one of the following: {:?}",
        VALID_DOCKER_ARGS
    )]
    InvalidOption(String),
    #[error(
        "Invalid port {0:?}, expected <port>[/<protocol>] with protocol one of {:?}",
        VALID_PORT_PROTOCOLS
    )]
    InvalidPort(String),
    #[error("Invalid host binding {value} for port {port}, expected a port, [host_ip], [host_ip, port] or a list of ports")]
    InvalidHostBinding { port: String, value: String },
    #[error("Invalid shm_size {0:?}, expected bytes or a number with one of the suffixes b, k, m, g (optionally followed by b)")]
    InvalidSize(String),
}

/// A host path bound read-write into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl Mount {
    pub fn bind(&self) -> String {
        format!("{}:{}:rw", self.source.display(), self.destination.display())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub variable: String,
    pub value: String,
}

#[derive(Deserialize)]
struct RawMount {
    source: String,
    destination: String,
}

#[derive(Deserialize)]
struct RawEnvVar {
    variable: String,
    value: Value,
}

/// Host side of a published port.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum HostPort {
    Port(u16),
    Text(String),
    /// `[host_ip]`, `[host_ip, host_port]` or several host ports.
    List(Vec<HostPort>),
}

impl HostPort {
    fn port(&self) -> Option<String> {
        match self {
            HostPort::Port(port) => Some(port.to_string()),
            HostPort::Text(port) => Some(port.clone()),
            HostPort::List(_) => None,
        }
    }

    /// The bindings for one container port. A list starting with an IP address binds that address.
    pub fn bindings(&self, container_port: &str) -> Result<Vec<PortBinding>, MountsError> {
        let invalid = || MountsError::InvalidHostBinding {
            port: container_port.to_string(),
            value: format!("{self:?}"),
        };
        let binding = |host_ip: &str, host_port: String| PortBinding {
            host_ip: host_ip.to_string(),
            host_port,
        };
        match self {
            HostPort::Port(_) | HostPort::Text(_) => Ok(vec![binding("", self.port().unwrap_or_default())]),
            HostPort::List(items) => match items.as_slice() {
                [HostPort::Text(ip)] if is_ip(ip) => Ok(vec![binding(ip.as_str(), String::new())]),
                [HostPort::Text(ip), port] if is_ip(ip) => Ok(vec![binding(ip.as_str(), port.port().ok_or_else(invalid)?)]),
                [] => Err(invalid()),
                ports => ports
                    .iter()
                    .map(|port| port.port().map(|port| binding("", port)).ok_or_else(invalid))
                    .collect(),
            },
        }
    }
}

fn is_ip(text: &str) -> bool {
    text.parse::<IpAddr>().is_ok()
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ShmSize {
    Bytes(u64),
    Text(String),
}

impl ShmSize {
    pub fn to_bytes(&self) -> Result<u64, MountsError> {
        match self {
            ShmSize::Bytes(bytes) => Ok(*bytes),
            ShmSize::Text(text) => parse_bytes(text),
        }
    }

    /// The value as given, for the `docker` command line.
    pub fn as_arg(&self) -> String {
        match self {
            ShmSize::Bytes(bytes) => bytes.to_string(),
            ShmSize::Text(text) => text.clone(),
        }
    }
}

/// Extra container options, restricted to [`VALID_DOCKER_ARGS`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct DockerOptions {
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub ports: BTreeMap<String, Option<HostPort>>,
    #[serde(default)]
    pub shm_size: Option<ShmSize>,
    #[serde(default)]
    pub ulimits: BTreeMap<String, i64>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub tty: Option<bool>,
}

impl DockerOptions {
    fn parse(value: &Value, path: &Path) -> Result<Self, MountsError> {
        if let Some(options) = value.as_object() {
            if let Some(key) = options.keys().find(|key| !VALID_DOCKER_ARGS.contains(&key.as_str())) {
                return Err(MountsError::InvalidOption(key.clone()));
            }
        }
        let options: DockerOptions = serde_json::from_value(value.clone()).map_err(|source| MountsError::Malformed {
            section: "DockerOptions",
            path: path.to_path_buf(),
            source,
        })?;
        // Surface bad ports and sizes before a container is ever created.
        options.port_bindings()?;
        if let Some(shm_size) = &options.shm_size {
            shm_size.to_bytes()?;
        }
        Ok(options)
    }

    pub fn tty(&self) -> bool {
        self.tty.unwrap_or(true)
    }

    /// Soft and hard limit are both set to the configured value.
    pub fn ulimits(&self) -> Vec<Ulimit> {
        self.ulimits
            .iter()
            .map(|(name, value)| Ulimit {
                name: name.clone(),
                soft: *value,
                hard: *value,
            })
            .collect()
    }

    /// Container port (`<port>/<protocol>`) to host bindings.
    pub fn port_bindings(&self) -> Result<BTreeMap<String, Vec<PortBinding>>, MountsError> {
        let mut bindings = BTreeMap::new();
        for (container_port, host) in &self.ports {
            let host_bindings = match host {
                None => vec![PortBinding {
                    host_ip: String::new(),
                    host_port: String::new(),
                }],
                Some(host) => host.bindings(container_port)?,
            };
            bindings.insert(normalize_port(container_port)?, host_bindings);
        }
        Ok(bindings)
    }

    /// The options as `docker run` flags.
    pub fn run_args(&self) -> Result<Vec<String>, MountsError> {
        let mut args = Vec::new();
        if self.privileged {
            args.push("--privileged".to_string());
        }
        if let Some(shm_size) = &self.shm_size {
            args.extend(["--shm-size".to_string(), shm_size.as_arg()]);
        }
        if let Some(user) = &self.user {
            args.extend(["--user".to_string(), user.clone()]);
        }
        if let Some(network) = &self.network {
            args.extend(["--network".to_string(), network.clone()]);
        }
        for ulimit in self.ulimits() {
            args.extend(["--ulimit".to_string(), format!("{}={}:{}", ulimit.name, ulimit.soft, ulimit.hard)]);
        }
        for (container_port, bindings) in self.port_bindings()? {
            for binding in bindings {
                let host_ip = if binding.host_ip.contains(':') {
                    format!("[{}]", binding.host_ip)
                } else {
                    binding.host_ip.clone()
                };
                let publish = match (host_ip.is_empty(), binding.host_port.is_empty()) {
                    (true, true) => container_port.clone(),
                    (true, false) => format!("{}:{}", binding.host_port, container_port),
                    (false, _) => format!("{}:{}:{}", host_ip, binding.host_port, container_port),
                };
                args.extend(["-p".to_string(), publish]);
            }
        }
        Ok(args)
    }
}

/// Parsed contents of the mounts file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MountsFile {
    pub mounts: Vec<Mount>,
    pub envs: Vec<EnvVar>,
    pub docker_options: DockerOptions,
}

impl MountsFile {
    /// Load the mounts file. A missing file means no mounts, envs or options.
    pub fn load(path: &Path) -> Result<Self, MountsError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!("No mount points were found in the {} file.", path.display());
                return Ok(MountsFile::default());
            }
            Err(source) => {
                return Err(MountsError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let data: Value = serde_json::from_str(&contents).map_err(|source| MountsError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        MountsFile::parse(&data, path)
    }

    pub fn parse(data: &Value, path: &Path) -> Result<Self, MountsError> {
        let data: &Map<String, Value> = data.as_object().ok_or_else(|| MountsError::NotAnObject(path.to_path_buf()))?;
        if !data.contains_key("Mounts") {
            return Err(MountsError::MissingMounts(path.to_path_buf()));
        }

        let mut file = MountsFile::default();
        for (key, value) in data {
            match key.as_str() {
                "Mounts" => {
                    let mounts: Vec<RawMount> = section(value, "Mounts", path)?;
                    for mount in mounts {
                        let source = resolve_source(&mount.source)?;
                        let destination = normalize(&expand_tilde(Path::new(&mount.destination)));
                        debug!("Source path: {}, Destination path: {}", source.display(), destination.display());
                        file.mounts.push(Mount { source, destination });
                    }
                }
                "Envs" => {
                    let envs: Vec<RawEnvVar> = section(value, "Envs", path)?;
                    file.envs = envs
                        .into_iter()
                        .map(|env| EnvVar {
                            variable: env.variable,
                            value: match env.value {
                                Value::String(value) => value,
                                other => other.to_string(),
                            },
                        })
                        .collect();
                }
                "DockerOptions" => file.docker_options = DockerOptions::parse(value, path)?,
                _ => {
                    return Err(MountsError::UnknownKey {
                        key: key.clone(),
                        path: path.to_path_buf(),
                    })
                }
            }
        }
        Ok(file)
    }

    /// `source:destination:rw` binds, one per distinct source; a later mount of a source wins.
    pub fn binds(&self) -> Vec<String> {
        let mut by_source: Vec<&Mount> = Vec::new();
        for mount in &self.mounts {
            match by_source.iter_mut().find(|seen| seen.source == mount.source) {
                Some(seen) => *seen = mount,
                None => by_source.push(mount),
            }
        }
        by_source.into_iter().map(Mount::bind).collect()
    }

    /// `VARIABLE=value` strings.
    pub fn env_list(&self) -> Vec<String> {
        self.envs.iter().map(|env| format!("{}={}", env.variable, env.value)).collect()
    }
}

fn section<T: serde::de::DeserializeOwned>(value: &Value, section: &'static str, path: &Path) -> Result<T, MountsError> {
    serde_json::from_value(value.clone()).map_err(|source| MountsError::Malformed {
        section,
        path: path.to_path_buf(),
        source,
    })
}

fn resolve_source(source: &str) -> Result<PathBuf, MountsError> {
    let expanded = expand_tilde(Path::new(source));
    expanded
        .canonicalize()
        .map_err(|_| MountsError::SourceMissing(expanded))
}

/// Lexically clean a path: drop `.` and fold `..` into its parent.
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    normalized.push(component);
                }
            }
            other => normalized.push(other),
        }
    }
    normalized
}

fn normalize_port(spec: &str) -> Result<String, MountsError> {
    let (port, protocol) = spec.split_once('/').unwrap_or((spec, "tcp"));
    if port.parse::<u16>().is_err() || !VALID_PORT_PROTOCOLS.contains(&protocol) {
        return Err(MountsError::InvalidPort(spec.to_string()));
    }
    Ok(format!("{port}/{protocol}"))
}

/// Parse sizes such as `16G`, `16GB`, `512mb`, `1.5g` or `1024` into bytes.
pub fn parse_bytes(text: &str) -> Result<u64, MountsError> {
    let invalid = || MountsError::InvalidSize(text.to_string());
    let mut value = text.trim();

    // `GB`, `mb`: a byte suffix after the unit.
    let mut tail = value.chars().rev();
    if let (Some(last), Some(unit)) = (tail.next(), tail.next()) {
        if last.eq_ignore_ascii_case(&'b') && unit.is_ascii_alphabetic() {
            value = &value[..value.len() - 1];
        }
    }

    let (digits, multiplier) = match value.char_indices().last() {
        Some((idx, unit)) if unit.is_ascii_alphabetic() => {
            let multiplier: u64 = match unit.to_ascii_lowercase() {
                'b' => 1,
                'k' => 1024,
                'm' => 1024 * 1024,
                'g' => 1024 * 1024 * 1024,
                _ => return Err(invalid()),
            };
            (value[..idx].trim(), multiplier)
        }
        Some(_) => (value, 1),
        None => return Err(invalid()),
    };

    if let Ok(whole) = digits.parse::<u64>() {
        return whole.checked_mul(multiplier).ok_or_else(invalid);
    }
    let number: f64 = digits.parse().map_err(|_| invalid())?;
    let bytes = number * multiplier as f64;
    if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
        return Err(invalid());
    }
    Ok(bytes as u64)
}
