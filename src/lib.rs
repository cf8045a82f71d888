//! # TAO launcher
//!
//! Run TAO Toolkit tasks inside the Docker image their launcher config names.

use std::process::ExitCode;

use anyhow::Context;
use tracing::debug;

use crate::cli::Invocation;
use crate::settings::Settings;

pub mod cli;
pub mod config;
pub mod docker_client;
pub mod instance;
pub mod logging;
pub mod login;
pub mod mounts;
pub mod runner;
pub mod settings;
pub mod table;
pub mod task;

/// The installed programs; each has its own bundled config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entrypoint {
    Tao,
    TaoDeploy,
}

impl Entrypoint {
    pub fn program(self) -> &'static str {
        match self {
            Entrypoint::Tao => "tao",
            Entrypoint::TaoDeploy => "tao-deploy",
        }
    }

    pub fn about(self) -> &'static str {
        match self {
            Entrypoint::Tao => "Launcher for TAO Toolkit.",
            Entrypoint::TaoDeploy => "Launcher for TAO Toolkit deploy tasks.",
        }
    }
}

/// Parse `args` (without the program name) and run what they ask for.
pub fn run(entrypoint: Entrypoint, args: Vec<String>) -> Result<ExitCode, anyhow::Error> {
    let settings = Settings::from_env().context("Invalid launcher environment")?;
    logging::init(settings.debug);

    let source = config::locate(entrypoint);
    let instance = instance::build(settings, source)?;
    debug!("Supported task groups: {:?}", instance.supported_groups());

    let code = match cli::parse(entrypoint, instance.as_ref(), &args) {
        Invocation::Task { group, task, args } => instance.launch_command(&group, &task, &args)?,
        Invocation::Builtin(builtin) => instance.run_builtin(&builtin)?,
    };
    Ok(ExitCode::from(exit_status(code)))
}

/// Exit codes outside `0..=255` map to 1.
fn exit_status(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
