//! # Instance
//!
//! The two ways of running a task: inside its container, or directly on the host.

pub mod local;
pub mod wheel;

use anyhow::Context;
use tracing::debug;

pub use local::LocalInstance;
pub use wheel::WheelInstance;

use crate::cli::Builtin;
use crate::config::{parse_launcher_config, ConfigSource, LauncherConfig};
use crate::settings::Settings;

/// Groups handled by the launcher itself rather than a container.
pub const BUILTIN_GROUPS: [&str; 3] = ["list", "stop", "info"];

/// - Knows the configured tasks
/// - Runs a task with its arguments
pub trait Instance {
    fn config(&self) -> &LauncherConfig;

    /// Whether `list`, `stop` and `info` are available.
    fn supports_builtins(&self) -> bool;

    /// Run `task` from `group`, returning the task's exit code.
    fn launch_command(&self, group: &str, task: &str, args: &[String]) -> anyhow::Result<i32>;

    fn run_builtin(&self, builtin: &Builtin) -> anyhow::Result<i32>;

    fn supported_groups(&self) -> Vec<String> {
        let builtins = BUILTIN_GROUPS.iter().filter(|_| self.supports_builtins());
        builtins
            .map(|group| group.to_string())
            .chain(self.config().task_map.keys().cloned())
            .collect()
    }
}

/// What to execute for a task invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    /// The task's entrypoint with its arguments.
    Entrypoint(Vec<String>),
    /// `tao <group> <task> run ...`: an arbitrary shell line.
    Shell(String),
    /// No arguments at all.
    Bare,
}

impl TaskCommand {
    pub fn from_args(task: &str, args: &[String]) -> Self {
        match args.split_first() {
            None => TaskCommand::Bare,
            Some((first, rest)) if first == "run" => TaskCommand::Shell(rest.join(" ")),
            Some(_) => {
                let mut argv = vec![task.to_string()];
                argv.extend(args.iter().cloned());
                TaskCommand::Entrypoint(argv)
            }
        }
    }
}

/// Load the config and pick the instance for the docker mode in `settings`.
pub fn build(settings: Settings, source: ConfigSource) -> anyhow::Result<Box<dyn Instance>> {
    let data = source
        .load()
        .with_context(|| format!("Unable to load launcher config from {source}"))?;
    let config = parse_launcher_config(&data, settings.override_registry.as_deref())
        .with_context(|| format!("Invalid launcher config {source}"))?;
    debug!("Current config file imported from: {source}");
    for (group, tasks) in &config.task_map {
        for (name, task) in tasks {
            debug!("{group}: {name}: {task}");
        }
    }

    if settings.docker_disabled {
        Ok(Box::new(WheelInstance::new(config)))
    } else {
        Ok(Box::new(LocalInstance::new(config, source, settings)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn plain_args_go_to_the_task_entrypoint() {
        assert_eq!(
            TaskCommand::from_args("detectnet_v2", &args(&["train", "-e", "/specs/train.txt"])),
            TaskCommand::Entrypoint(args(&["detectnet_v2", "train", "-e", "/specs/train.txt"]))
        );
    }

    #[test]
    fn run_prefix_is_a_shell_line() {
        assert_eq!(
            TaskCommand::from_args("detectnet_v2", &args(&["run", "ls", "-l", "/workspace"])),
            TaskCommand::Shell("ls -l /workspace".to_string())
        );
        assert_eq!(
            TaskCommand::from_args("detectnet_v2", &args(&["run"])),
            TaskCommand::Shell(String::new())
        );
    }

    #[test]
    fn no_args_is_bare() {
        assert_eq!(TaskCommand::from_args("dino", &[]), TaskCommand::Bare);
    }

    #[test]
    fn wheel_mode_builds_wheel_instance() {
        let settings = Settings::from_lookup(|key| (key == "TAO_DOCKER_DISABLE").then(|| "1".to_string())).unwrap();
        let instance = build(settings, crate::config::locate_bundled(crate::Entrypoint::Tao)).unwrap();
        assert!(!instance.supports_builtins());
        assert!(!instance.supported_groups().contains(&"list".to_string()));
    }
}
