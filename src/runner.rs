//! # Runner
//!
//! Runs one command in a fresh container of one image.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde_json::json;
use tokio::process::Command;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use crate::docker_client::{ContainerSpec, DeviceRequest, DockerClient, HostConfig};
use crate::login::RegistryAuth;
use crate::mounts::{MountsError, MountsFile, ShmSize};
use crate::task::Task;

const DOCKER_COMMAND: &str = "docker";
/// Exit code reported when the launcher was interrupted, as a shell would.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;
/// How long an interrupted command gets to exit before it is killed.
const INTERRUPT_GRACE: Duration = Duration::from_millis(250);

/// The image a set of tasks runs in, plus where to read the user's mounts from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRunner {
    pub registry: String,
    pub image: String,
    pub tag: String,
    pub digest: Option<String>,
    pub mounts_file: PathBuf,
    /// Credentials sent along with a pull.
    pub auth: Option<RegistryAuth>,
}

impl ContainerRunner {
    pub fn for_task(task: &Task, mounts_file: PathBuf) -> Self {
        ContainerRunner {
            registry: task.docker_registry.clone(),
            image: task.docker_image.clone(),
            tag: task.docker_tag.clone(),
            digest: task.docker_digest.clone(),
            mounts_file,
            auth: None,
        }
    }

    pub fn with_auth(mut self, auth: Option<RegistryAuth>) -> Self {
        self.auth = auth;
        self
    }

    /// Fully qualified reference, `registry/image:tag`.
    pub fn docker_image(&self) -> String {
        format!("{}/{}:{}", self.registry, self.image, self.tag)
    }

    pub fn repository(&self) -> String {
        format!("{}/{}", self.registry, self.image)
    }

    /// Pull the image unless it is already present locally.
    pub fn ensure_image(&self, docker: &DockerClient) -> anyhow::Result<()> {
        let reference = self.docker_image();
        if docker.image_exists(&reference).context("Unable to list local images")? {
            return Ok(());
        }
        info!("The required docker doesn't exist locally/the manifest has changed. Pulling a new docker.");
        info!("Pulling the required container. This may take several minutes if you're doing this for the first time. Please wait here.\n...");
        println!("Pulling from repository: {}", self.repository());
        let auth = self.auth.as_ref().map(RegistryAuth::header).transpose()?;
        docker
            .pull_image(&self.repository(), &self.tag, auth.as_deref())
            .context("Docker pull failed")?;
        info!("Container pull complete.");
        Ok(())
    }

    pub fn container_spec(&self, mounts: &MountsFile) -> Result<ContainerSpec, MountsError> {
        let options = &mounts.docker_options;
        let port_bindings = options.port_bindings()?;
        Ok(ContainerSpec {
            image: self.docker_image(),
            tty: options.tty(),
            attach_stdout: true,
            attach_stderr: true,
            env: mounts.env_list(),
            user: options.user.clone(),
            exposed_ports: port_bindings.keys().map(|port| (port.clone(), json!({}))).collect(),
            host_config: HostConfig {
                binds: mounts.binds(),
                auto_remove: true,
                privileged: options.privileged,
                shm_size: options.shm_size.as_ref().map(ShmSize::to_bytes).transpose()?,
                network_mode: options.network.clone(),
                ulimits: options.ulimits(),
                port_bindings,
                device_requests: vec![DeviceRequest::all_gpus()],
            },
        })
    }

    /// Create and start a detached, auto-removed container running the image's default command.
    pub fn start_container(&self, docker: &DockerClient, mounts: &MountsFile) -> anyhow::Result<String> {
        if mounts.docker_options.user.is_none() {
            warn!(
                "Docker will run the commands as root. If you would like to retain your local host permissions, \
                 please add \"user\":\"{}:{}\" in the DockerOptions portion of the \"{}\" file.",
                users::get_current_uid(),
                users::get_current_gid(),
                self.mounts_file.display()
            );
        }
        let spec = self.container_spec(mounts)?;
        debug!("Starting the TAO Toolkit Container: {}", spec.image);
        let id = docker
            .create_container(&spec)
            .context("Docker instantiation failed")?;
        docker.start_container(&id).context("Docker instantiation failed")?;
        Ok(id)
    }

    /// Run `command` in a new container and stop the container afterwards, whatever the outcome.
    ///
    /// Ctrl-C ends the command but not the launcher, so the container is still stopped.
    pub fn run_container(&self, docker: &DockerClient, command: &[String]) -> anyhow::Result<i32> {
        self.ensure_image(docker)?;
        let mounts = MountsFile::load(&self.mounts_file)?;
        let id = self.start_container(docker, &mounts)?;

        let args = exec_args(&id, interactive_flag(mounts.docker_options.tty()), command);
        debug!("volumes: {:?}", mounts.binds());
        debug!("formatted_command: {DOCKER_COMMAND} {}\nExecuting the command.", args.join(" "));
        let result = run_interruptible(DOCKER_COMMAND, &args);
        if let Ok(code) = &result {
            if *code != 0 {
                println!("TAO command run failed with exit code: {code}");
            }
        }

        info!("Stopping container.");
        let stopped = docker.stop_container(&id);
        let code = result.context("Unable to run docker exec")?;
        stopped.with_context(|| format!("Unable to stop container {id}"))?;
        Ok(code)
    }

    /// CI runners have no usable terminal for `docker exec`, so run the command with one `docker run`.
    pub fn run_container_on_ci(&self, docker: &DockerClient, command: &[String]) -> anyhow::Result<i32> {
        self.ensure_image(docker)?;
        let mounts = MountsFile::load(&self.mounts_file)?;
        let args = self.run_args(&mounts, command)?;
        debug!("volumes: {:?}", mounts.binds());
        debug!("formatted_command: {DOCKER_COMMAND} {}\nExecuting the command.", args.join(" "));
        let code = run_interruptible(DOCKER_COMMAND, &args).context("Unable to run docker run")?;
        if code != 0 {
            println!("TAO command run failed with exit code: {code}");
        }
        Ok(code)
    }

    /// Arguments of the one-shot `docker run` used on CI.
    pub fn run_args(&self, mounts: &MountsFile, command: &[String]) -> Result<Vec<String>, MountsError> {
        let mut args = vec![
            "run".to_string(),
            interactive_flag(mounts.docker_options.tty()).to_string(),
            "--rm".to_string(),
            "--gpus".to_string(),
            "all".to_string(),
        ];
        for bind in mounts.binds() {
            args.extend(["-v".to_string(), bind]);
        }
        for env in mounts.env_list() {
            args.extend(["-e".to_string(), env]);
        }
        args.extend(mounts.docker_options.run_args()?);
        args.push(self.docker_image());
        args.extend(command.iter().cloned());
        Ok(args)
    }
}

/// `-it` only when a terminal is both wanted and present.
fn interactive_flag(tty: bool) -> &'static str {
    if tty && termion::is_tty(&io::stdin()) {
        "-it"
    } else {
        "-i"
    }
}

fn exec_args(id: &str, interactive: &str, command: &[String]) -> Vec<String> {
    let mut args = vec!["exec".to_string(), interactive.to_string(), id.to_string()];
    args.extend(command.iter().cloned());
    args
}

/// Run `program` attached to this terminal and return its exit code.
///
/// SIGINT is held by the launcher while the child runs. The child sees the same Ctrl-C through
/// the terminal; if it has not exited after a short grace period it is killed.
pub fn run_interruptible(program: &str, args: &[String]) -> io::Result<i32> {
    let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
    runtime.block_on(wait_interruptible(program, args))
}

async fn wait_interruptible(program: &str, args: &[String]) -> io::Result<i32> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut child = Command::new(program).args(args).spawn()?;
    tokio::select! {
        status = child.wait() => Ok(exit_code(status?)),
        _ = interrupt.recv() => {
            warn!("Interrupted, stopping {program}.");
            if tokio::time::timeout(INTERRUPT_GRACE, child.wait()).await.is_err() {
                child.kill().await?;
            }
            Ok(INTERRUPTED_EXIT_CODE)
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    // Killed by a signal.
    status.code().unwrap_or(1)
}
