//! # Command line
//!
//! `tao <task_group> <task> [args...]`, plus the `list`, `stop` and `info` groups handled by the
//! launcher itself. The task tree comes from the launcher config, so the parser is built at runtime.

use clap::{Arg, Args, Command, FromArgMatches};

use crate::instance::Instance;
use crate::Entrypoint;

/// Options of `tao stop`.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct StopArgs {
    /// Ids of the containers to be stopped.
    #[arg(long = "container_id", num_args = 1..)]
    pub container_id: Vec<String>,

    /// Kill all running TAO Toolkit containers.
    #[arg(long)]
    pub all: bool,
}

/// Options of `tao info`.
#[derive(Args, Debug, Clone, Default, PartialEq, Eq)]
pub struct InfoArgs {
    /// Print information about the TAO Toolkit instance.
    #[arg(long)]
    pub verbose: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Builtin {
    List,
    Stop(StopArgs),
    Info(InfoArgs),
}

impl Builtin {
    pub fn name(&self) -> &'static str {
        match self {
            Builtin::List => "list",
            Builtin::Stop(_) => "stop",
            Builtin::Info(_) => "info",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invocation {
    Task {
        group: String,
        task: String,
        args: Vec<String>,
    },
    Builtin(Builtin),
}

/// The full parser for an instance's task tree.
pub fn command(entrypoint: Entrypoint, instance: &dyn Instance) -> Command {
    let mut cmd = Command::new(entrypoint.program())
        .about(entrypoint.about())
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true);

    if instance.supports_builtins() {
        cmd = cmd
            .subcommand(Command::new("list").about("List running TAO Toolkit containers and the task in each."))
            .subcommand(StopArgs::augment_args(
                Command::new("stop").about("Stop running TAO Toolkit containers."),
            ))
            .subcommand(InfoArgs::augment_args(
                Command::new("info").about("Print the configuration of the TAO Toolkit instance."),
            ));
    }

    for (group, tasks) in &instance.config().task_map {
        let mut group_cmd = Command::new(group.clone())
            .subcommand_required(true)
            .arg_required_else_help(true);
        for task in tasks.keys() {
            group_cmd = group_cmd.subcommand(
                Command::new(task.clone()).arg(
                    Arg::new("script_args")
                        .help("Arguments passed to the task")
                        .num_args(0..)
                        .trailing_var_arg(true)
                        .allow_hyphen_values(true),
                ),
            );
        }
        cmd = cmd.subcommand(group_cmd);
    }
    cmd
}

/// Parse `args` (without the program name), printing help or usage and exiting on error.
pub fn parse(entrypoint: Entrypoint, instance: &dyn Instance, args: &[String]) -> Invocation {
    try_parse(entrypoint, instance, args).unwrap_or_else(|err| err.exit())
}

pub fn try_parse(entrypoint: Entrypoint, instance: &dyn Instance, args: &[String]) -> Result<Invocation, clap::Error> {
    // Configured tasks take their arguments verbatim, `--help` included.
    if let [group, task, rest @ ..] = args {
        if instance.config().task(group, task).is_some() {
            return Ok(Invocation::Task {
                group: group.clone(),
                task: task.clone(),
                args: rest.to_vec(),
            });
        }
    }

    let mut cmd = command(entrypoint, instance);
    let argv = std::iter::once(entrypoint.program().to_string()).chain(args.iter().cloned());
    let matches = cmd.try_get_matches_from_mut(argv)?;

    let builtins = instance.supports_builtins();
    match matches.subcommand() {
        Some(("list", _)) if builtins => Ok(Invocation::Builtin(Builtin::List)),
        Some(("stop", sub)) if builtins => Ok(Invocation::Builtin(Builtin::Stop(StopArgs::from_arg_matches(sub)?))),
        Some(("info", sub)) if builtins => Ok(Invocation::Builtin(Builtin::Info(InfoArgs::from_arg_matches(sub)?))),
        Some((group, sub)) => match sub.subcommand() {
            Some((task, task_matches)) => Ok(Invocation::Task {
                group: group.to_string(),
                task: task.to_string(),
                args: task_matches
                    .get_many::<String>("script_args")
                    .map(|values| values.cloned().collect())
                    .unwrap_or_default(),
            }),
            None => Err(cmd.error(clap::error::ErrorKind::MissingSubcommand, format!("{group} requires a task"))),
        },
        None => Err(cmd.error(clap::error::ErrorKind::MissingSubcommand, "a task group is required")),
    }
}
