use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;
use colored::Colorize as _;
use tracing::{info, instrument};

use foreman::ast::SymbolIndex;
use foreman::checkpoint::CheckpointLog;
use foreman::context::Services;
use foreman::graph::{BuildGraph, Validation};
use foreman::ignore::IgnoreFilter;
use foreman::scheduler::{BuildReport, Scheduler};

use crate::TopLevelFlags;
use crate::cmd;

#[instrument(skip(top))]
pub async fn exec(
    top: &TopLevelFlags,
    targets: Vec<String>,
    resume: bool,
    quiet: bool,
) -> Result<ExitCode> {
    let config = top.load_config()?;
    let workspace = cmd::load_workspace()?;
    let selected = cmd::select_targets(&workspace, &targets)?;
    let graph = Arc::new(BuildGraph::from_targets(selected, Validation::Deferred)?);

    let services = Arc::new(Services::new(config.clone(), cmd::default_drivers())?);
    cmd::register_signals(&services.cancel)?;

    // Symbol-level incremental analysis. Advisory at this seam: drivers
    // without symbol support fall back to file-level cache checks.
    let mut index = SymbolIndex::load(&config.ast_dir())?;
    let filter = IgnoreFilter::load(&workspace.root)?;
    let analysis =
        foreman::analyzer::analyze_workspace(&mut index, &workspace.root, &filter, &services.drivers)
            .await?;
    if !analysis.is_noop() {
        info!(
            files = analysis.files_to_rebuild.len(),
            removed = analysis.removed_files.len(),
            granularity = analysis.granularity,
            "incremental analysis"
        );
    }
    index.save(&config.ast_dir())?;

    let completed = if resume {
        CheckpointLog::load_latest(
            &config.checkpoints_dir(),
            graph.structural_hash(),
            Duration::from_secs(config.checkpoint_ttl_days * 24 * 60 * 60),
        )?
    } else {
        None
    };

    let scheduler = Scheduler::new(graph, services.clone(), workspace.root.clone());
    let report = scheduler.run(completed).await?;
    services.shutdown()?;

    if !quiet {
        render(&report);
    }
    if services.cancel.is_cancelled() {
        return Ok(ExitCode::from(crate::EXIT_CANCELLED));
    }
    if !report.success() {
        return Ok(ExitCode::from(crate::EXIT_BUILD_FAILURE));
    }
    Ok(ExitCode::SUCCESS)
}

fn render(report: &BuildReport) {
    let summary = report.summary_line();
    if report.success() {
        println!("{}", summary.green());
    } else {
        println!("{}", summary.red());
        for (target, error) in &report.errors {
            println!("  {} {}", target.to_string().bold(), error.first_line());
            for suggestion in &error.suggestions {
                println!("    hint: {suggestion}");
            }
        }
        if report.checkpoint_path.is_some() {
            println!("{}", "a checkpoint exists; `foreman resume` will skip completed targets".yellow());
        }
    }
    if report.skipped > 0 {
        println!("{} targets skipped", report.skipped);
    }
}
