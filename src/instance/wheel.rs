use std::process::Command;

use anyhow::{bail, Context};
use tracing::{debug, info};

use super::{Instance, TaskCommand};
use crate::cli::Builtin;
use crate::config::LauncherConfig;

/// Runs tasks with the entrypoints installed on the host.
pub struct WheelInstance {
    config: LauncherConfig,
}

impl WheelInstance {
    pub fn new(config: LauncherConfig) -> Self {
        WheelInstance { config }
    }

    /// The host command line for a task invocation.
    pub fn command(task: &str, args: &[String]) -> Command {
        match TaskCommand::from_args(task, args) {
            TaskCommand::Entrypoint(argv) => {
                let mut command = Command::new(&argv[0]);
                command.args(&argv[1..]);
                command
            }
            TaskCommand::Shell(line) => {
                let mut command = Command::new("sh");
                command.arg("-c").arg(line);
                command
            }
            TaskCommand::Bare => {
                info!("No commands provided to the launcher\nListing the help options.");
                let mut command = Command::new(task);
                command.arg("-h");
                command
            }
        }
    }
}

impl Instance for WheelInstance {
    fn config(&self) -> &LauncherConfig {
        &self.config
    }

    fn supports_builtins(&self) -> bool {
        false
    }

    fn launch_command(&self, group: &str, task: &str, args: &[String]) -> anyhow::Result<i32> {
        let Some(tasks) = self.config.task_map.get(group) else {
            bail!("Task group asked for wasn't implemented to run on WHL instance: {group}");
        };
        if !tasks.contains_key(task) {
            bail!("Task asked for wasn't implemented to run on WHL instance. {task}");
        }

        let mut command = WheelInstance::command(task, args);
        debug!("Executing {command:?}");
        let status = command
            .status()
            .with_context(|| format!("Unable to run {task}, is the TAO Toolkit wheel installed?"))?;
        let code = status.code().unwrap_or(1);
        if code != 0 {
            println!("TAO Toolkit command run failed with exit code: {code}");
        }
        Ok(code)
    }

    fn run_builtin(&self, builtin: &Builtin) -> anyhow::Result<i32> {
        bail!("Task group asked for wasn't implemented to run on WHL instance: {}", builtin.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(args: &[&str]) -> Vec<String> {
        args.iter().map(|arg| arg.to_string()).collect()
    }

    fn argv(command: &Command) -> Vec<String> {
        std::iter::once(command.get_program())
            .chain(command.get_args())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn runs_entrypoint_with_args() {
        let command = WheelInstance::command("classification_tf2", &args(&["train", "-e", "spec.yaml"]));
        assert_eq!(argv(&command), ["classification_tf2", "train", "-e", "spec.yaml"]);
    }

    #[test]
    fn run_prefix_goes_through_the_shell() {
        let command = WheelInstance::command("classification_tf2", &args(&["run", "nvidia-smi", "&&", "ls"]));
        assert_eq!(argv(&command), ["sh", "-c", "nvidia-smi && ls"]);
    }

    #[test]
    fn bare_task_prints_help() {
        let command = WheelInstance::command("classification_tf2", &[]);
        assert_eq!(argv(&command), ["classification_tf2", "-h"]);
    }
}
