use std::process::ExitCode;

use color_eyre::Result;

use foreman::graph::{BuildGraph, Validation};

use crate::TopLevelFlags;
use crate::cmd;

pub async fn exec(_top: &TopLevelFlags) -> Result<ExitCode> {
    let workspace = cmd::load_workspace()?;
    let graph = BuildGraph::from_targets(workspace.targets.clone(), Validation::Deferred)?;
    print!("{}", graph.to_dot());
    Ok(ExitCode::SUCCESS)
}
