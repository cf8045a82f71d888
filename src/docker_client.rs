//! # Docker Client
//!
//! `docker_client` contains functions to call the Docker daemon over its unix socket.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use futures::{StreamExt, TryStreamExt};
use hyper::{Body, Client, Method, Request, StatusCode};
use hyperlocal::{UnixClientExt, Uri};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tokio::runtime::Runtime;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};

use crate::docker_client::DockerError::InvalidJson;

pub const DOCKER_SOCK: &str = "/var/run/docker.sock";

#[derive(thiserror::Error, Debug)]
pub enum DockerError {
    #[error("Network error")]
    NetworkError(#[from] hyper::Error),
    #[error("Unable to build request to Docker daemon")]
    RequestError(#[from] hyper::http::Error),
    #[error("Unable to start async runtime")]
    RuntimeError(#[source] io::Error),
    #[error("Error from docker daemon: [{0}] {1}")]
    ErrorResponse(u16, String),
    #[error("Invalid response from Docker daemon: [{0}] {1}")]
    InvalidResponse(u16, String),
    #[error("Invalid JSON response from Docker daemon: [{0}] {1}")]
    InvalidJson(u16, String, #[source] serde_json::Error),
    #[error("Broken progress stream from Docker daemon")]
    StreamError(#[from] LinesCodecError),
    #[error("Unsupported DOCKER_HOST {0}, only unix:// sockets are supported")]
    UnsupportedHost(String),
}

/// An image as listed by `GET /images/json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ImageSummary {
    #[serde(default, deserialize_with = "null_as_default")]
    pub repo_tags: Vec<String>,
}

/// A container as listed by `GET /containers/json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSummary {
    pub id: String,
    pub image: String,
    #[serde(default)]
    pub state: String,
}

impl ContainerSummary {
    pub fn short_id(&self) -> &str {
        short_id(&self.id)
    }
}

/// Output of `GET /containers/{id}/top`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProcessList {
    #[serde(default, deserialize_with = "null_as_default")]
    pub titles: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub processes: Vec<Vec<String>>,
}

/// Body of `POST /containers/create`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerSpec {
    pub image: String,
    pub tty: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub env: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exposed_ports: BTreeMap<String, Value>,
    pub host_config: HostConfig,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct HostConfig {
    pub binds: Vec<String>,
    pub auto_remove: bool,
    pub privileged: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ulimits: Vec<Ulimit>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub port_bindings: BTreeMap<String, Vec<PortBinding>>,
    pub device_requests: Vec<DeviceRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PortBinding {
    pub host_ip: String,
    pub host_port: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceRequest {
    pub driver: String,
    pub count: i64,
    pub capabilities: Vec<Vec<String>>,
}

impl DeviceRequest {
    /// Every GPU on the host.
    pub fn all_gpus() -> Self {
        DeviceRequest {
            driver: String::new(),
            count: -1,
            capabilities: vec![vec!["gpu".to_string()]],
        }
    }
}

/// The 12 character form of a container id, as printed by the docker CLI.
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Default + serde::Deserialize<'de>,
{
    let value = <Option<T> as serde::Deserialize>::deserialize(deserializer)?;
    Ok(value.unwrap_or_default())
}

/// Blocking client for the Docker daemon.
pub struct DockerClient {
    socket: PathBuf,
    runtime: Runtime,
}

impl DockerClient {
    pub fn new(socket: impl Into<PathBuf>) -> Result<Self, DockerError> {
        let runtime = Runtime::new().map_err(DockerError::RuntimeError)?;
        Ok(DockerClient {
            socket: socket.into(),
            runtime,
        })
    }

    /// Connect to the socket named by `DOCKER_HOST`, or the default one.
    pub fn from_host(docker_host: Option<&str>) -> Result<Self, DockerError> {
        DockerClient::new(socket_path(docker_host)?)
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Make a request to the Docker daemon without a body.
    pub fn empty_request(&self, method: Method, url: &str) -> Result<(StatusCode, Value), DockerError> {
        let req = Request::builder()
            .uri(hyper::Uri::from(Uri::new(&self.socket, url)))
            .header("Accept", "application/json")
            .method(method)
            .body(Body::empty())?;

        self.make_request(req)
    }

    /// Make a request to the Docker daemon with a body.
    pub fn body_request(&self, method: Method, url: &str, body: Value) -> Result<(StatusCode, Value), DockerError> {
        let body = serde_json::to_vec(&body).map_err(|err| InvalidJson(0, body.to_string(), err))?;
        let req = Request::builder()
            .uri(hyper::Uri::from(Uri::new(&self.socket, url)))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json")
            .method(method)
            .body(Body::from(body))?;

        self.make_request(req)
    }

    fn make_request(&self, req: Request<Body>) -> Result<(StatusCode, Value), DockerError> {
        let client = Client::unix();
        let (status_code, body) = self.runtime.block_on(async {
            let response = client.request(req).await?;
            let status_code = response.status();
            let body = hyper::body::to_bytes(response.into_body()).await?;
            Ok::<_, DockerError>((status_code, body.to_vec()))
        })?;

        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok((status_code, Value::Null));
        }
        let json = serde_json::from_slice(&body).map_err(|err| {
            InvalidJson(status_code.into(), String::from_utf8(body).unwrap_or_default(), err)
        })?;
        Ok((status_code, json))
    }

    /// Make a request whose response is a stream of JSON documents, one per line.
    fn stream_request<F>(&self, req: Request<Body>, mut on_line: F) -> Result<(), DockerError>
    where
        F: FnMut(Value) -> Result<(), DockerError>,
    {
        let client = Client::unix();
        self.runtime.block_on(async {
            let response = client.request(req).await?;
            let status_code = response.status();
            if !status_code.is_success() {
                let body = hyper::body::to_bytes(response.into_body()).await?;
                return Err(error_response(status_code, &body));
            }

            let body = response
                .into_body()
                .map_err(|err| io::Error::new(io::ErrorKind::Other, err));
            let mut lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());
            while let Some(line) = lines.next().await {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let json = serde_json::from_str(&line)
                    .map_err(|err| InvalidJson(status_code.into(), line.clone(), err))?;
                on_line(json)?;
            }
            Ok::<(), DockerError>(())
        })
    }

    pub fn list_images(&self) -> Result<Vec<ImageSummary>, DockerError> {
        let (status_code, json) = self.empty_request(Method::GET, "/images/json")?;
        decode(status_code, check(status_code, json)?)
    }

    /// Whether an image tagged `reference` (`registry/name:tag`) exists locally.
    pub fn image_exists(&self, reference: &str) -> Result<bool, DockerError> {
        Ok(self
            .list_images()?
            .iter()
            .any(|image| image.repo_tags.iter().any(|tag| tag == reference)))
    }

    /// Build the `POST /images/create` request. `auth` is an `X-Registry-Auth` header value.
    pub fn pull_request(&self, repository: &str, tag: &str, auth: Option<&str>) -> Result<Request<Body>, DockerError> {
        let url = format!("/images/create?fromImage={repository}&tag={tag}");
        let mut builder = Request::builder()
            .uri(hyper::Uri::from(Uri::new(&self.socket, &url)))
            .header("Accept", "application/json")
            .method(Method::POST);
        if let Some(auth) = auth {
            builder = builder.header("X-Registry-Auth", auth);
        }
        Ok(builder.body(Body::empty())?)
    }

    /// Pull `repository:tag`, logging the daemon's progress messages.
    pub fn pull_image(&self, repository: &str, tag: &str, auth: Option<&str>) -> Result<(), DockerError> {
        let req = self.pull_request(repository, tag, auth)?;

        self.stream_request(req, |progress| {
            if let Some(message) = progress.get("error").and_then(Value::as_str) {
                return Err(DockerError::ErrorResponse(StatusCode::OK.into(), message.to_string()));
            }
            if let Some(status) = progress.get("status").and_then(Value::as_str) {
                match progress.get("id").and_then(Value::as_str) {
                    Some(id) => debug!("{id}: {status}"),
                    None => debug!("{status}"),
                }
            }
            Ok(())
        })
    }

    /// Create a container and return its id.
    pub fn create_container(&self, spec: &ContainerSpec) -> Result<String, DockerError> {
        let body = serde_json::to_value(spec).map_err(|err| InvalidJson(0, format!("{spec:?}"), err))?;
        let (status_code, json) = self.body_request(Method::POST, "/containers/create", body)?;
        let json = check(status_code, json)?;
        if let Some(warnings) = json.get("Warnings").and_then(Value::as_array) {
            for warning in warnings.iter().filter_map(Value::as_str) {
                warn!("{warning}");
            }
        }
        match json.get("Id").and_then(Value::as_str) {
            Some(id) => Ok(id.to_string()),
            None => Err(DockerError::InvalidResponse(status_code.into(), json.to_string())),
        }
    }

    pub fn start_container(&self, id: &str) -> Result<(), DockerError> {
        let (status_code, json) = self.empty_request(Method::POST, &format!("/containers/{id}/start"))?;
        check(status_code, json).map(|_| ())
    }

    pub fn stop_container(&self, id: &str) -> Result<(), DockerError> {
        let (status_code, json) = self.empty_request(Method::POST, &format!("/containers/{id}/stop"))?;
        check(status_code, json).map(|_| ())
    }

    /// Running containers.
    pub fn list_containers(&self) -> Result<Vec<ContainerSummary>, DockerError> {
        let (status_code, json) = self.empty_request(Method::GET, "/containers/json")?;
        decode(status_code, check(status_code, json)?)
    }

    pub fn container_top(&self, id: &str) -> Result<ProcessList, DockerError> {
        let (status_code, json) = self.empty_request(Method::GET, &format!("/containers/{id}/top"))?;
        decode(status_code, check(status_code, json)?)
    }
}

/// Resolve the socket path from a `DOCKER_HOST` value.
pub fn socket_path(docker_host: Option<&str>) -> Result<PathBuf, DockerError> {
    match docker_host {
        None | Some("") => Ok(PathBuf::from(DOCKER_SOCK)),
        Some(host) => match host.strip_prefix("unix://") {
            Some(path) => Ok(PathBuf::from(path)),
            None => Err(DockerError::UnsupportedHost(host.to_string())),
        },
    }
}

/// 304 means the container was already in the requested state.
fn check(status_code: StatusCode, json: Value) -> Result<Value, DockerError> {
    if status_code.is_success() || status_code == StatusCode::NOT_MODIFIED {
        return Ok(json);
    }
    let message = match json.get("message").and_then(Value::as_str) {
        Some(message) => message.to_string(),
        None => json.to_string(),
    };
    Err(DockerError::ErrorResponse(status_code.into(), message))
}

fn decode<T: serde::de::DeserializeOwned>(status_code: StatusCode, json: Value) -> Result<T, DockerError> {
    let text = json.to_string();
    serde_json::from_value(json).map_err(|err| InvalidJson(status_code.into(), text, err))
}

fn error_response(status_code: StatusCode, body: &[u8]) -> DockerError {
    match serde_json::from_slice::<Value>(body) {
        Ok(json) => match check(status_code, json) {
            Err(err) => err,
            Ok(json) => DockerError::InvalidResponse(status_code.into(), json.to_string()),
        },
        Err(_) => DockerError::InvalidResponse(status_code.into(), String::from_utf8_lossy(body).into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn socket_path_defaults_to_docker_sock() {
        assert_eq!(socket_path(None).unwrap(), PathBuf::from(DOCKER_SOCK));
        assert_eq!(socket_path(Some("")).unwrap(), PathBuf::from(DOCKER_SOCK));
    }

    #[test]
    fn socket_path_reads_unix_docker_host() {
        assert_eq!(
            socket_path(Some("unix:///run/user/1000/docker.sock")).unwrap(),
            PathBuf::from("/run/user/1000/docker.sock")
        );
        assert!(matches!(
            socket_path(Some("tcp://10.0.0.1:2375")),
            Err(DockerError::UnsupportedHost(_))
        ));
    }

    #[test]
    fn check_extracts_daemon_message() {
        let err = check(StatusCode::NOT_FOUND, json!({"message": "No such container: abc"})).unwrap_err();
        assert_eq!(err.to_string(), "Error from docker daemon: [404] No such container: abc");
        assert!(check(StatusCode::NOT_MODIFIED, Value::Null).is_ok());
    }

    #[test]
    fn image_summary_tolerates_null_repo_tags() {
        let images: Vec<ImageSummary> = decode(
            StatusCode::OK,
            json!([
                {"Id": "sha256:1", "RepoTags": null},
                {"Id": "sha256:2", "RepoTags": ["nvcr.io/nvidia/tao/tao-toolkit:5.0.0-pyt"]}
            ]),
        )
        .unwrap();
        assert!(images[0].repo_tags.is_empty());
        assert_eq!(images[1].repo_tags[0], "nvcr.io/nvidia/tao/tao-toolkit:5.0.0-pyt");
    }

    #[test]
    fn container_spec_uses_engine_field_names() {
        let spec = ContainerSpec {
            image: "nvcr.io/nvidia/tao/tao-toolkit:5.0.0-pyt".into(),
            tty: true,
            host_config: HostConfig {
                binds: vec!["/data:/workspace/data:rw".into()],
                auto_remove: true,
                device_requests: vec![DeviceRequest::all_gpus()],
                ..Default::default()
            },
            ..Default::default()
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["Image"], "nvcr.io/nvidia/tao/tao-toolkit:5.0.0-pyt");
        assert_eq!(json["Tty"], true);
        assert!(json.get("User").is_none());
        assert_eq!(json["HostConfig"]["AutoRemove"], true);
        assert_eq!(json["HostConfig"]["Binds"][0], "/data:/workspace/data:rw");
        assert_eq!(json["HostConfig"]["DeviceRequests"][0]["Count"], -1);
        assert_eq!(json["HostConfig"]["DeviceRequests"][0]["Capabilities"][0][0], "gpu");
    }

    #[test]
    fn pull_request_carries_registry_auth() {
        let client = DockerClient::new(DOCKER_SOCK).unwrap();
        let req = client
            .pull_request("nvcr.io/nvidia/tao/tao-toolkit", "5.0.0-pyt", Some("eyJ1c2VybmFtZSI6ImEifQ=="))
            .unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.headers()["X-Registry-Auth"], "eyJ1c2VybmFtZSI6ImEifQ==");

        let req = client.pull_request("nvcr.io/nvidia/tao/tao-toolkit", "5.0.0-pyt", None).unwrap();
        assert!(req.headers().get("X-Registry-Auth").is_none());
    }

    #[test]
    fn short_id_truncates() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
