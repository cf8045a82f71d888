//! # tao-deploy
//!
//! Run a TAO Toolkit deploy task in its Docker container.

use std::process::ExitCode;

fn main() -> Result<ExitCode, anyhow::Error> {
    tao_launcher::run(tao_launcher::Entrypoint::TaoDeploy, std::env::args().skip(1).collect())
}
