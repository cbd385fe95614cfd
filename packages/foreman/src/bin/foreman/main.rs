//! The binary entrypoint for `foreman`, the monorepo build orchestrator.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand, ValueEnum, crate_version};
use color_eyre::Result;
use tracing_subscriber::util::SubscriberInitExt;

// Since this is a binary crate, we keep these modules private so dead-code
// warnings stay accurate.
mod cmd;
mod log;

/// Exit code for a build that failed.
const EXIT_BUILD_FAILURE: u8 = 1;
/// Exit code for configuration or graph errors.
const EXIT_CONFIG_ERROR: u8 = 2;
/// Exit code when the build was cancelled by a signal.
const EXIT_CANCELLED: u8 = 130;

#[derive(Clone, Debug, Parser)]
#[command(
    name = "foreman",
    about = "Build orchestrator for mixed-language monorepos",
    version = crate_version!(),
)]
struct TopLevelFlags {
    #[command(subcommand)]
    command: Command,

    /// Path to the engine configuration file
    #[arg(long, default_value = "foreman.toml", global = true)]
    config: PathBuf,

    /// Override the cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Degree of parallelism
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Output mode
    #[arg(long, value_enum, default_value_t = Mode::Interactive, global = true)]
    mode: Mode,

    /// Verbose logging (same as FOREMAN_LOG=foreman=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// When to colorize output
    #[arg(long, value_enum, default_value_t = log::WhenColor::Auto, global = true)]
    color: log::WhenColor,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    Interactive,
    Plain,
    Quiet,
    Verbose,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Build targets (all targets when none are named)
    Build {
        /// Target labels to build, e.g. //tools:compiler
        targets: Vec<String>,
    },

    /// Query the dependency graph: a label, deps(label), or rdeps(label)
    Query { expr: String },

    /// Delete all cached state
    Clean,

    /// Resume the previous interrupted build from its checkpoint
    Resume {
        /// Target labels to build, e.g. //tools:compiler
        targets: Vec<String>,
    },

    /// Print the dependency graph in DOT format
    Graph,

    /// Show counters from the last build
    Telemetry,

    /// Create the cache directory layout
    Init,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let top = TopLevelFlags::parse();

    let logger = log::make_logger(std::io::stderr, top.color, top.verbose)?;
    logger.init();

    let quiet = top.mode == Mode::Quiet;
    let result = match top.command.clone() {
        Command::Build { targets } => cmd::build::exec(&top, targets, false, quiet).await,
        Command::Resume { targets } => cmd::build::exec(&top, targets, true, quiet).await,
        Command::Query { expr } => cmd::query::exec(&top, &expr).await,
        Command::Clean => cmd::clean::exec(&top).await,
        Command::Graph => cmd::graph::exec(&top).await,
        Command::Telemetry => cmd::telemetry::exec(&top).await,
        Command::Init => cmd::init::exec(&top).await,
    };

    match result {
        Ok(code) => Ok(code),
        Err(err) => {
            // Configuration and graph problems carry their own exit code.
            let code = match err.downcast_ref::<foreman::error::EngineError>() {
                Some(engine) if engine.kind.is_configuration() => EXIT_CONFIG_ERROR,
                _ => EXIT_BUILD_FAILURE,
            };
            eprintln!("error: {err:#}");
            Ok(ExitCode::from(code))
        }
    }
}

impl TopLevelFlags {
    /// Load the engine config, applying CLI overrides.
    fn load_config(&self) -> Result<foreman::config::Config> {
        let mut config = foreman::config::Config::load(&self.config)?;
        if let Some(cache_dir) = &self.cache_dir {
            config.cache_dir = cache_dir.clone();
        }
        if let Some(jobs) = self.jobs {
            config.jobs = jobs.max(1);
        }
        Ok(config)
    }
}
