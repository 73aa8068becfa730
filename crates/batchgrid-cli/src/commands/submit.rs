use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use batchgrid_core::{JobSpec, RunTime};
use batchgrid_engine::{Engine, SystemRunner};
use clap::Args;

use super::{Overrides, parse_hold, print_report};

#[derive(Args)]
pub struct SubmitArgs {
    /// Name of the run
    #[arg(short, long)]
    pub job_name: String,
    /// Script every task executes (looked up in scripts_dir when relative)
    #[arg(short, long)]
    pub script: PathBuf,
    /// Sub-job name within the run
    #[arg(long, default_value = "Job")]
    pub sub_job: String,
    /// Number of array tasks; omit for a single job
    #[arg(short, long)]
    pub array: Option<u32>,
    #[arg(long, default_value_t = 2000)]
    pub memory_mb: u32,
    #[arg(long, default_value = "01:59:59")]
    pub run_time: String,
    #[arg(long, default_value_t = 1)]
    pub cores: u32,
    /// Variables exported to the job, as KEY=VALUE
    #[arg(short, long = "env")]
    pub env: Vec<String>,
    /// Jobs to wait for: NAME or NAME:1,2,3
    #[arg(long)]
    pub hold: Vec<String>,
    /// Skip the clean-up of the run's tmp directory
    #[arg(long)]
    pub no_clean: bool,
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

pub fn submit(overrides: &Overrides, args: SubmitArgs) -> anyhow::Result<()> {
    let config = overrides.load()?;
    let mut engine = Engine::new(config, &args.job_name, Arc::new(SystemRunner))?;
    engine.print_banner();
    engine.submit_build_job()?;

    let mut spec = JobSpec::new(args.sub_job.as_str(), &args.script)
        .memory(args.memory_mb)
        .cores(args.cores)
        .run_time(RunTime::parse(&args.run_time)?);
    for var in &args.env {
        let (key, value) = var
            .split_once('=')
            .with_context(|| format!("expected KEY=VALUE, got {var}"))?;
        spec = spec.env(key, value);
    }
    let hold = args
        .hold
        .iter()
        .map(|h| parse_hold(h))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let name = match args.array {
        Some(n) => engine.submit_array(spec.array(n), &hold)?,
        None => engine.submit_job(spec, &hold)?,
    };
    if !args.no_clean {
        engine.submit_clean_all(&[batchgrid_core::Dependency::whole(name)])?;
    }

    let report = engine.finish()?;
    print_report(&report, &args.format)
}
