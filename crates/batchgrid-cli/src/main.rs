use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "batchgrid",
    about = "batchgrid: submit job graphs to batch schedulers",
    version,
    propagate_version = true,
)]
struct Cli {
    /// Path to batchgrid.toml
    #[arg(short, long, global = true, default_value = "batchgrid.toml")]
    config: PathBuf,
    /// Override [engine].kind (slurm, htcondor, sge, local)
    #[arg(long, global = true)]
    engine: Option<String>,
    /// Override [engine].base_dir
    #[arg(long, global = true)]
    base_dir: Option<String>,
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a batchgrid.toml scaffold
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Submit one script as a job or array, after the build job.
    Submit(commands::submit::SubmitArgs),
    /// Merge files into fewer files with a tree of merge jobs.
    ///
    /// Inputs are file lists, a folder, or datasets below a catalog root.
    /// Datasets are merged into size-balanced files and moved into
    /// <output>/<dataset> once all of their merge jobs are done.
    Merge(commands::merge::MergeArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "batchgrid=debug" } else { "batchgrid=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.parse()?)
        )
        .init();

    let overrides = commands::Overrides {
        config: cli.config,
        engine: cli.engine,
        base_dir: cli.base_dir,
    };

    match cli.command {
        Commands::Init { force } => commands::init::init(&overrides, force),
        Commands::Submit(args) => commands::submit::submit(&overrides, args),
        Commands::Merge(args) => commands::merge::merge(&overrides, args),
    }
}
