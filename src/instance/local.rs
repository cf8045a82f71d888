use std::collections::BTreeMap;

use anyhow::{bail, Context};
use serde_json::Value;
use tracing::{debug, info};

use super::{Instance, TaskCommand};
use crate::cli::Builtin;
use crate::config::{ConfigSource, LauncherConfig};
use crate::docker_client::{ContainerSummary, DockerClient, ProcessList};
use crate::login::{ensure_logged_in, DOCKER_CONFIG};
use crate::runner::ContainerRunner;
use crate::settings::{expand_tilde, Settings};
use crate::table::{render_rst, wrap};
use crate::task::Task;

const TABS: &str = "    ";
const COMMAND_WIDTH: usize = 100;
const NO_TASK: &str = "Not in support DNN tasks.";

/// Runs every task inside the container its config entry names.
pub struct LocalInstance {
    config: LauncherConfig,
    source: ConfigSource,
    settings: Settings,
    docker: DockerClient,
}

impl LocalInstance {
    pub fn new(config: LauncherConfig, source: ConfigSource, settings: Settings) -> anyhow::Result<Self> {
        let docker = DockerClient::from_host(settings.docker_host.as_deref())
            .context("Unable to set up a Docker client")?;
        debug!("Docker daemon socket: {}", docker.socket().display());
        Ok(LocalInstance {
            config,
            source,
            settings,
            docker,
        })
    }

    /// One runner per configured `image:tag`.
    pub fn runners(&self) -> BTreeMap<String, ContainerRunner> {
        debug!("Acquiring handler map for dockers.");
        let mut runners = BTreeMap::new();
        for task in self.config.task_map.values().flat_map(BTreeMap::values) {
            runners
                .entry(task.image_key())
                .or_insert_with(|| ContainerRunner::for_task(task, self.settings.mounts_file.clone()));
        }
        runners
    }

    /// Running containers started from one of the configured images.
    fn running_containers(&self) -> anyhow::Result<Vec<ContainerSummary>> {
        let keys: Vec<String> = self.runners().into_keys().collect();
        let containers = self.docker.list_containers().context("Unable to list containers")?;
        Ok(containers
            .into_iter()
            .filter(|container| keys.iter().any(|key| container.image.contains(key.as_str())))
            .collect())
    }

    pub fn kill_containers(&self, container_ids: &[String], kill_all: bool) -> anyhow::Result<()> {
        if kill_all {
            for container in self.running_containers()? {
                info!("Stopping container {}", container.short_id());
                self.docker.stop_container(&container.id)?;
            }
        } else if container_ids.is_empty() {
            println!("No containers provided in the list to stop. Please run tao stop --help for more information.");
        } else {
            for id in container_ids {
                self.docker
                    .stop_container(id)
                    .with_context(|| format!("Unable to stop container {id}"))?;
            }
        }
        Ok(())
    }

    /// Print the launcher's running containers with the task each one runs.
    pub fn list_running_jobs(&self) -> anyhow::Result<()> {
        let mut rows = Vec::new();
        for container in self.running_containers()? {
            let processes = self
                .docker
                .container_top(&container.id)
                .with_context(|| format!("Unable to list processes of container {}", container.short_id()))?;
            let command = self
                .config
                .task_map
                .values()
                .find_map(|tasks| job_command(&processes, tasks))
                .unwrap_or_else(|| NO_TASK.to_string());
            rows.push(vec![
                container.short_id().to_string(),
                container.state.clone(),
                wrap(&command, COMMAND_WIDTH),
            ]);
        }
        println!("{}", render_rst(&["container_id", "container_status", "command"], &rows));
        Ok(())
    }

    pub fn print_information(&self, verbose: bool) -> anyhow::Result<()> {
        println!("Configuration of the TAO Toolkit Instance");
        let config = self
            .source
            .load()
            .context("Config file doesn't exist. Aborting information printing")?;
        if verbose {
            println!("{}", dict_print(&config, 0));
        } else {
            print!("{}", summary(&config));
        }
        Ok(())
    }

    fn task(&self, group: &str, task: &str) -> anyhow::Result<&Task> {
        match self.config.task(group, task) {
            Some(task) => Ok(task),
            None => bail!("Task asked for wasn't implemented. {group} {task}"),
        }
    }
}

impl Instance for LocalInstance {
    fn config(&self) -> &LauncherConfig {
        &self.config
    }

    fn supports_builtins(&self) -> bool {
        true
    }

    fn launch_command(&self, group: &str, task: &str, args: &[String]) -> anyhow::Result<i32> {
        let task = self.task(group, task)?;
        let auth = match &self.settings.override_registry {
            None => ensure_logged_in(&expand_tilde(DOCKER_CONFIG.as_ref()), &task.docker_registry)?,
            Some(_) => {
                info!("Skipping docker login check.");
                None
            }
        };

        let runner = self
            .runners()
            .remove(&task.image_key())
            .context("A valid handler map was not defined.")?
            .with_auth(auth);
        info!("Running command in container: {}", runner.docker_image());

        let command = match TaskCommand::from_args(&task.name, args) {
            TaskCommand::Entrypoint(argv) => argv,
            TaskCommand::Shell(line) => vec!["bash".to_string(), "-c".to_string(), line],
            TaskCommand::Bare => {
                info!(
                    "No commands provided to the launcher\n\
                     Kicking off an interactive docker session.\n\
                     NOTE: This container instance will be terminated when you exit."
                );
                vec!["/bin/bash".to_string()]
            }
        };

        if self.settings.ci {
            runner.run_container_on_ci(&self.docker, &command)
        } else {
            runner.run_container(&self.docker, &command)
        }
    }

    fn run_builtin(&self, builtin: &Builtin) -> anyhow::Result<i32> {
        match builtin {
            Builtin::List => self.list_running_jobs()?,
            Builtin::Stop(args) => self.kill_containers(&args.container_id, args.all)?,
            Builtin::Info(args) => self.print_information(args.verbose)?,
        }
        Ok(0)
    }
}

/// The task a container is running, found from its process table.
///
/// Entrypoints run as `<interpreter> <path>/<task> <args...>`, so the second token names the task.
fn job_command(processes: &ProcessList, tasks: &BTreeMap<String, Task>) -> Option<String> {
    processes.processes.iter().find_map(|row| {
        let command = row.last()?;
        let tokens: Vec<&str> = command.split(' ').collect();
        let entrypoint = tokens.get(1)?.rsplit('/').next()?;
        tasks
            .contains_key(entrypoint)
            .then(|| format!("{} {}", entrypoint, tokens[2..].join(" ")))
    })
}

/// One `key: value` line per top-level key; objects are shown as their key list.
fn summary(config: &Value) -> String {
    let mut out = String::new();
    if let Some(config) = config.as_object() {
        for (key, value) in config {
            let value = match value {
                Value::Object(map) => {
                    let keys: Vec<String> = map.keys().map(|key| format!("'{key}'")).collect();
                    format!("[{}]", keys.join(", "))
                }
                Value::Array(_) => repr(value),
                other => scalar(other),
            };
            out.push_str(&format!("{key}: {value}\n"));
        }
    }
    out
}

/// Recursive, tab-indented dump of a JSON object. List items are numbered from 1.
fn dict_print(value: &Value, nlevels: usize) -> String {
    let mut out = TABS.repeat(nlevels);
    let Some(map) = value.as_object() else {
        return out;
    };
    for (key, value) in map {
        out.push_str(&format!("\n{}{key}: ", TABS.repeat(nlevels)));
        match value {
            Value::Object(_) => {
                out.push_str(TABS);
                out.push_str(&dict_print(value, nlevels + 1));
            }
            Value::Array(items) => {
                for (idx, item) in items.iter().enumerate() {
                    out.push_str(&format!("\n{}{}. {}", TABS.repeat(nlevels + 1), idx + 1, scalar(item)));
                }
            }
            other => out.push_str(&scalar(other)),
        }
    }
    out
}

/// A value written the way the keys of an object are listed: `['a', 1, True]`.
fn repr(value: &Value) -> String {
    match value {
        Value::String(text) => format!("'{text}'"),
        Value::Bool(true) => "True".to_string(),
        Value::Bool(false) => "False".to_string(),
        Value::Null => "None".to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(repr).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(map) => {
            let entries: Vec<String> = map.iter().map(|(key, value)| format!("'{key}': {}", repr(value))).collect();
            format!("{{{}}}", entries.join(", "))
        }
    }
}

fn scalar(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tasks() -> BTreeMap<String, Task> {
        ["detectnet_v2", "yolo_v4"]
            .into_iter()
            .map(|name| {
                let task = Task::new(name, "nvidia/tao/tao-toolkit", "5.0.0-tf1.15.5", "nvcr.io", None, None);
                (name.to_string(), task)
            })
            .collect()
    }

    fn processes(commands: &[&str]) -> ProcessList {
        ProcessList {
            titles: vec!["UID".into(), "PID".into(), "CMD".into()],
            processes: commands
                .iter()
                .map(|cmd| vec!["root".to_string(), "1".to_string(), cmd.to_string()])
                .collect(),
        }
    }

    #[test]
    fn finds_task_entrypoint_in_process_table() {
        let processes = processes(&[
            "/bin/bash",
            "python /usr/local/bin/yolo_v4 train -e /workspace/specs/yolo.txt",
        ]);
        assert_eq!(
            job_command(&processes, &tasks()).as_deref(),
            Some("yolo_v4 train -e /workspace/specs/yolo.txt")
        );
    }

    #[test]
    fn ignores_unknown_processes() {
        let processes = processes(&["/bin/bash", "sleep infinity", "python /usr/bin/jupyter lab"]);
        assert_eq!(job_command(&processes, &tasks()), None);
    }

    #[test]
    fn summary_lists_object_keys() {
        let config = json!({
            "format_version": 3.0,
            "toolkit_version": "5.0.0",
            "task_group": {"model": {}, "dataset": {}}
        });
        assert_eq!(
            summary(&config),
            "format_version: 3.0\ntoolkit_version: 5.0.0\ntask_group: ['model', 'dataset']\n"
        );
    }

    #[test]
    fn summary_lists_arrays_like_object_keys() {
        let config = json!({"format_version": 1.0, "dockers": {"img": {}}, "tags": ["5.0.0-pyt", 5, true, null]});
        assert_eq!(
            summary(&config),
            "format_version: 1.0\ndockers: ['img']\ntags: ['5.0.0-pyt', 5, True, None]\n"
        );
    }

    #[test]
    fn dict_print_indents_and_numbers() {
        let config = json!({
            "format_version": 2.0,
            "dockers": {"img": {"tasks": ["a", "b"]}}
        });
        let expected = format!(
            "\nformat_version: 2.0\ndockers:{}\n    img:{}\n        tasks: \n            1. a\n            2. b",
            " ".repeat(9),
            " ".repeat(13)
        );
        assert_eq!(dict_print(&config, 0), expected);
    }
}
