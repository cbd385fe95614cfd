use std::process::ExitCode;

use color_eyre::Result;

use foreman::error::EngineError;
use foreman::graph::{BuildGraph, Validation};
use foreman::target::TargetId;

use crate::TopLevelFlags;
use crate::cmd;

/// Supported expressions: a bare label, `deps(label)`, `rdeps(label)`.
pub async fn exec(_top: &TopLevelFlags, expr: &str) -> Result<ExitCode> {
    let workspace = cmd::load_workspace()?;
    let graph = BuildGraph::from_targets(workspace.targets.clone(), Validation::Deferred)?;

    let (label, reverse) = if let Some(inner) = strip_call(expr, "deps") {
        (inner, false)
    } else if let Some(inner) = strip_call(expr, "rdeps") {
        (inner, true)
    } else {
        // Bare label: existence check.
        let id = TargetId::new(expr);
        if graph.contains(&id) {
            println!("{id}");
            return Ok(ExitCode::SUCCESS);
        }
        return Err(EngineError::graph(format!("unknown target {id}")).into());
    };

    let id = TargetId::new(label);
    let node = graph.node_by_id(&id)?;
    let ids = if reverse {
        node.dependent_ids()
    } else {
        node.dependency_ids()
    };
    for id in ids {
        println!("{id}");
    }
    Ok(ExitCode::SUCCESS)
}

fn strip_call<'a>(expr: &'a str, name: &str) -> Option<&'a str> {
    expr.strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('('))
        .and_then(|rest| rest.strip_suffix(')'))
}
