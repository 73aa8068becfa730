use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use batchgrid_core::fsutil::read_list;
use batchgrid_core::{BatchConfig, Dependency};
use batchgrid_engine::catalog::require_credentials;
use batchgrid_engine::{
    Engine, FileCatalog, LocalDirCatalog, MergeRequest, SizeBalancedMerge, SystemRunner,
    VomsProxyCheck,
};
use clap::Args;
use serde_json::json;
use tracing::info;

use super::{Overrides, parse_hold, print_report};

/// Datasets submitted together before the next group waits on them.
const DATASETS_PER_GROUP: usize = 5;

#[derive(Args)]
pub struct MergeArgs {
    /// Name of the run
    #[arg(short, long)]
    pub job_name: String,
    /// Files listing one input file per line
    #[arg(long = "file-list")]
    pub file_lists: Vec<PathBuf>,
    /// Folder whose files are merged
    #[arg(long)]
    pub folder: Option<PathBuf>,
    /// Datasets to merge, each into its own output directory
    #[arg(long = "dataset")]
    pub datasets: Vec<String>,
    /// Directory holding one sub-directory per dataset
    #[arg(long)]
    pub catalog_root: Option<PathBuf>,
    /// Name of the merged output (file lists and folders)
    #[arg(short, long)]
    pub out_name: Option<String>,
    /// Files merged by one task [default: merge.files_per_job]
    #[arg(long)]
    pub files_per_job: Option<usize>,
    /// Number of files the last layer writes
    #[arg(long, default_value_t = 1)]
    pub final_split: usize,
    /// Target size of a merged dataset file in GB
    #[arg(long, default_value_t = 10.0)]
    pub size_gb: f64,
    /// Shuffle the input files before batching
    #[arg(long)]
    pub shuffle: bool,
    /// Jobs to wait for: NAME or NAME:1,2,3
    #[arg(long)]
    pub hold: Vec<String>,
    /// Make sure a VOMS proxy for this VO is valid first
    #[arg(long)]
    pub voms: Option<String>,
    /// Only print the merge plan
    #[arg(long)]
    pub plan: bool,
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    pub format: String,
}

pub fn merge(overrides: &Overrides, args: MergeArgs) -> anyhow::Result<()> {
    if let Some(vo) = &args.voms {
        let left = require_credentials(&VomsProxyCheck::new(&SystemRunner, vo))?;
        info!(vo = %vo, seconds = left.as_secs(), "proxy is valid");
    }
    let config = overrides.load()?;
    let files_per_job = args.files_per_job.unwrap_or(config.merge.files_per_job);
    let mut engine = Engine::new(config.clone(), &args.job_name, Arc::new(SystemRunner))?;
    let hold = args
        .hold
        .iter()
        .map(|h| parse_hold(h))
        .collect::<anyhow::Result<Vec<_>>>()?;

    if !args.datasets.is_empty() {
        return merge_datasets(&mut engine, &config, &args, files_per_job, hold);
    }

    let files = collect_files(&args, &config)?;
    let out_name = args.out_name.clone().unwrap_or_else(|| args.job_name.clone());
    let request = MergeRequest::new(out_name, files)
        .files_per_job(files_per_job)
        .final_split(args.final_split)
        .shuffle(args.shuffle)
        .hold(hold);
    let mut node = engine.create_merge_interface(&request)?;

    if args.plan {
        let layers = node.summary();
        match args.format.as_str() {
            "json" => println!("{}", serde_json::to_string_pretty(&layers)?),
            _ => {
                for layer in &layers {
                    println!(
                        "{:<32} {:>6} tasks  {:>4} files/task  {:>6} outputs",
                        layer.job_name,
                        layer.tasks,
                        layer.files_per_job,
                        layer.outputs.len()
                    );
                }
            }
        }
        return Ok(());
    }

    engine.print_banner();
    engine.submit_build_job()?;
    node.submit(&mut engine)?;
    engine.submit_clean_all(&[Dependency::whole(engine.subjob_name(&node.final_job_name()))])?;
    let report = engine.finish()?;
    print_report(&report, &args.format)
}

/// Input files from `--file-list` and `--folder`.
fn collect_files(args: &MergeArgs, config: &BatchConfig) -> anyhow::Result<Vec<String>> {
    let mut files = Vec::new();
    for list in &args.file_lists {
        files.extend(read_list(list).with_context(|| format!("reading {}", list.display()))?);
    }
    if let Some(folder) = &args.folder {
        let catalog = LocalDirCatalog::new(folder, &config.merge.extension);
        files.extend(catalog.list_files("")?.into_iter().map(|e| e.path));
    }
    if files.is_empty() {
        bail!("no input files: give --file-list, --folder or --dataset");
    }
    Ok(files)
}

/// One size-balanced merge per dataset. Datasets are submitted in groups;
/// each group waits for the moves of the previous one so the queue is not
/// flooded with merge jobs all at once.
fn merge_datasets(
    engine: &mut Engine,
    config: &BatchConfig,
    args: &MergeArgs,
    files_per_job: usize,
    hold: Vec<Dependency>,
) -> anyhow::Result<()> {
    let Some(root) = &args.catalog_root else {
        bail!("--dataset needs --catalog-root");
    };
    let catalog = LocalDirCatalog::new(root, &config.merge.extension);
    let max_bytes = (args.size_gb * 1e9) as u64;

    let mut plans = Vec::with_capacity(args.datasets.len());
    for dataset in &args.datasets {
        let name = dataset.split_once(':').map_or(dataset.as_str(), |(_, n)| n);
        let entries = catalog.list_files(dataset)?;
        plans.push(SizeBalancedMerge::plan(
            engine,
            name,
            entries,
            max_bytes,
            files_per_job,
            Vec::new(),
        )?);
    }

    if args.plan {
        let summary: Vec<_> = plans
            .iter()
            .map(|p| {
                json!({
                    "destination": p.destination(),
                    "move_job": p.job_name(),
                    "groups": p.groups().iter().map(|g| g.summary()).collect::<Vec<_>>(),
                })
            })
            .collect();
        match args.format.as_str() {
            "json" => println!("{}", serde_json::to_string_pretty(&summary)?),
            _ => {
                for p in &plans {
                    println!("{} → {}", p.job_name(), p.destination().display());
                    for g in p.groups() {
                        println!("  {:<40} {} layers", g.out_name(), g.layers());
                    }
                }
            }
        }
        return Ok(());
    }

    engine.print_banner();
    engine.submit_build_job()?;
    let mut previous: Vec<Dependency> = Vec::new();
    let mut moves = Vec::with_capacity(plans.len());
    for chunk in plans.chunks_mut(DATASETS_PER_GROUP) {
        let mut current = Vec::with_capacity(chunk.len());
        for plan in chunk.iter_mut() {
            plan.set_hold(hold.iter().chain(&previous).cloned().collect());
            plan.submit(engine)?;
            current.push(Dependency::whole(engine.subjob_name(&plan.job_name())));
        }
        moves.extend(current.iter().cloned());
        previous = current;
    }
    engine.submit_clean_all(&moves)?;
    let report = engine.finish()?;
    print_report(&report, &args.format)
}
