use std::fs;
use std::path::Path;

use serde_json::json;
use tao_launcher::cli::{try_parse, Builtin, Invocation};
use tao_launcher::config::{load_config_file, parse_launcher_config, ConfigSource, FormatVersion};
use tao_launcher::docker_client::DockerClient;
use tao_launcher::instance;
use tao_launcher::mounts::MountsFile;
use tao_launcher::runner::ContainerRunner;
use tao_launcher::settings::Settings;
use tao_launcher::task::Task;
use tao_launcher::Entrypoint;
use tempfile::TempDir;

fn write_config(dir: &Path) -> ConfigSource {
    let path = dir.join("config.json");
    let config = json!({
        "format_version": 2.0,
        "dockers": {
            "nvidia/tao/tao-toolkit": {
                "5.0.0-tf2.11.0": {"docker_registry": "nvcr.io", "tasks": ["sh", "classification_tf2"]}
            }
        }
    });
    fs::write(&path, config.to_string()).unwrap();
    ConfigSource::File(path)
}

fn wheel_settings() -> Settings {
    Settings::from_lookup(|key| (key == "TAO_DOCKER_DISABLE").then(|| "1".to_string())).unwrap()
}

fn args(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

#[test]
fn config_file_round_trip() {
    let dir = TempDir::new().unwrap();
    let ConfigSource::File(path) = write_config(dir.path()) else {
        unreachable!()
    };
    let config = parse_launcher_config(&load_config_file(&path).unwrap(), Some("registry.local:5000")).unwrap();
    assert_eq!(config.format_version, FormatVersion::V2);
    let task = config.task("container_actions", "classification_tf2").unwrap();
    assert_eq!(task.docker_registry, "registry.local:5000");
    assert_eq!(task.image_key(), "nvidia/tao/tao-toolkit:5.0.0-tf2.11.0");
}

#[test]
fn wheel_mode_propagates_exit_code() {
    let dir = TempDir::new().unwrap();
    let instance = instance::build(wheel_settings(), write_config(dir.path())).unwrap();

    let invocation = try_parse(Entrypoint::Tao, instance.as_ref(), &args(&["container_actions", "sh", "-c", "exit 3"])).unwrap();
    let Invocation::Task { group, task, args } = invocation else {
        panic!("expected a task invocation");
    };
    assert_eq!(instance.launch_command(&group, &task, &args).unwrap(), 3);
}

#[test]
fn wheel_mode_run_prefix_uses_the_shell() {
    let dir = TempDir::new().unwrap();
    let instance = instance::build(wheel_settings(), write_config(dir.path())).unwrap();
    let code = instance
        .launch_command("container_actions", "sh", &args(&["run", "test", "-d", "/", "&&", "exit", "4"]))
        .unwrap();
    assert_eq!(code, 4);
}

#[test]
fn wheel_mode_rejects_unknown_tasks_and_builtins() {
    let dir = TempDir::new().unwrap();
    let instance = instance::build(wheel_settings(), write_config(dir.path())).unwrap();
    assert!(instance.launch_command("model", "sh", &[]).is_err());
    assert!(instance.launch_command("container_actions", "dino", &[]).is_err());
    assert!(instance.run_builtin(&Builtin::List).is_err());
}

#[test]
fn mounts_file_feeds_the_ci_command_line() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    fs::create_dir(&data).unwrap();
    let mounts_path = dir.path().join("tao_mounts.json");
    let mounts = json!({
        "Mounts": [{"source": data, "destination": "/workspace/data"}],
        "DockerOptions": {"user": "1000:1000", "network": "host", "tty": false}
    });
    fs::write(&mounts_path, mounts.to_string()).unwrap();

    let config = parse_launcher_config(&write_config(dir.path()).load().unwrap(), None).unwrap();
    let task = config.task("container_actions", "classification_tf2").unwrap();
    let runner = ContainerRunner::for_task(task, mounts_path.clone());
    let mounts = MountsFile::load(&mounts_path).unwrap();
    let run_args = runner.run_args(&mounts, &args(&["classification_tf2", "train"])).unwrap();

    let bind = format!("{}:/workspace/data:rw", data.canonicalize().unwrap().display());
    assert!(run_args.windows(2).any(|pair| pair == ["-v", bind.as_str()]));
    assert!(run_args.windows(2).any(|pair| pair == ["--user", "1000:1000"]));
    assert!(run_args.windows(2).any(|pair| pair == ["--network", "host"]));
    assert_eq!(
        &run_args[run_args.len() - 3..],
        ["nvcr.io/nvidia/tao/tao-toolkit:5.0.0-tf2.11.0", "classification_tf2", "train"]
    );
}

#[test]
fn missing_mounts_file_means_no_mounts() {
    let dir = TempDir::new().unwrap();
    let mounts = MountsFile::load(&dir.path().join("absent.json")).unwrap();
    assert!(mounts.binds().is_empty());
    assert!(mounts.env_list().is_empty());
}

#[test]
#[ignore = "needs a running Docker daemon"]
fn lists_running_containers() {
    let dir = TempDir::new().unwrap();
    let settings = Settings::from_lookup(|key| std::env::var(key).ok().filter(|_| key == "DOCKER_HOST")).unwrap();
    let instance = instance::build(settings, write_config(dir.path())).unwrap();
    assert_eq!(instance.run_builtin(&Builtin::List).unwrap(), 0);
}

#[test]
#[ignore = "needs a running Docker daemon with GPU support"]
fn container_is_stopped_after_a_failing_command() {
    let dir = TempDir::new().unwrap();
    let docker = DockerClient::from_host(std::env::var("DOCKER_HOST").ok().as_deref()).unwrap();
    let task = Task::new("busybox", "library/busybox", "latest", "docker.io", None, None);
    let runner = ContainerRunner::for_task(&task, dir.path().join("absent_mounts.json"));

    let code = runner.run_container(&docker, &args(&["sh", "-c", "exit 3"])).unwrap();
    assert_eq!(code, 3);

    let image = runner.docker_image();
    let running = docker.list_containers().unwrap();
    assert!(running.iter().all(|container| container.image != image));
}
