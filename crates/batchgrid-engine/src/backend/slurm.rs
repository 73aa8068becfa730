//! Slurm backend.
//!
//! Jobs go to `sbatch` as soon as they are declared. Dependencies are turned
//! into `--dependency=` expressions by looking the parents up in the live
//! queue, so a parent that already left the queue simply drops out of the
//! expression. Arrays larger than the cluster's maximum array size are split
//! into consecutive batches; each batch waits on the previous one and gets
//! its offset in `IdOffSet`.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::sync::Arc;

use batchgrid_core::fsutil::create_directory;
use batchgrid_core::{Dependency, EngineKind, RunTime};
use regex::Regex;
use tracing::{debug, info, warn};

use super::{Backend, FinishReport, Submission, unresolved};
use crate::command::{CommandLine, run_checked};
use crate::error::{EngineError, EngineResult};
use crate::queue::JobIdResolver;
use crate::workspace::Workspace;

/// A queue id split into the main job id and the optional task part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlurmId {
    pub main: u64,
    pub task: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub limit: RunTime,
}

/// Map the 1-based task `k` of an array split into batches of `max` tasks
/// onto `(batch, local task)`, both zero- and one-based respectively.
/// `None` for task 0.
pub fn split_index(k: u32, max: u32) -> Option<(usize, u32)> {
    let max = max.max(1);
    let k = k.checked_sub(1)?;
    Some(((k / max) as usize, k % max + 1))
}

/// Smallest partition whose limit exceeds `requested`. Ties keep sinfo order.
pub fn select_partition<'a>(partitions: &'a [Partition], requested: &RunTime) -> Option<&'a Partition> {
    partitions
        .iter()
        .filter(|p| p.limit > *requested || p.limit.is_unlimited())
        .min_by(|a, b| a.limit.cmp(&b.limit))
}

/// Parse `sinfo --format=%P %l %a` rows, keeping partitions that are up.
pub fn parse_partitions(listing: &str) -> Vec<Partition> {
    listing
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            let [name, limit, avail, ..] = fields.as_slice() else {
                return None;
            };
            if *avail != "up" {
                return None;
            }
            let limit = RunTime::parse(limit).ok()?;
            Some(Partition {
                name: name.trim_end_matches('*').to_string(),
                limit,
            })
        })
        .collect()
}

/// What the queue knows about a parent.
enum Parent {
    /// Still queued. One entry per batch, `None` for batches already gone.
    Queued { batches: Vec<Option<u64>>, array: bool },
    /// Submitted during this run and no longer queued.
    Completed,
    Unknown,
}

#[derive(Debug, Default)]
struct LedgerEntry {
    batches: Vec<u64>,
    array: bool,
}

pub struct SlurmBackend {
    resolver: Arc<dyn JobIdResolver>,
    id_pattern: Regex,
    /// Batch ids of every job submitted through this backend, in order.
    ledger: HashMap<String, LedgerEntry>,
    partitions: Option<Vec<Partition>>,
    jobs: usize,
    tasks: usize,
}

impl SlurmBackend {
    pub fn new(resolver: Arc<dyn JobIdResolver>) -> EngineResult<Self> {
        Ok(Self {
            resolver,
            id_pattern: Regex::new(r"^(\d+)(?:_(\S+))?$")?,
            ledger: HashMap::new(),
            partitions: None,
            jobs: 0,
            tasks: 0,
        })
    }

    pub fn parse_id(&self, raw: &str) -> Option<SlurmId> {
        let caps = self.id_pattern.captures(raw.trim())?;
        Some(SlurmId {
            main: caps.get(1)?.as_str().parse().ok()?,
            task: caps.get(2).map(|m| m.as_str().to_string()),
        })
    }

    /// Batch ids recorded for `name` during this run.
    pub fn submitted_ids(&self, name: &str) -> Option<&[u64]> {
        self.ledger.get(name).map(|e| e.batches.as_slice())
    }

    fn lookup(&self, name: &str) -> EngineResult<Parent> {
        let ids: Vec<SlurmId> = self
            .resolver
            .resolve(name)?
            .iter()
            .filter_map(|raw| self.parse_id(raw))
            .collect();
        let ledger = self.ledger.get(name);
        if ids.is_empty() {
            return Ok(if ledger.is_some() {
                Parent::Completed
            } else {
                Parent::Unknown
            });
        }

        let queued: HashSet<u64> = ids.iter().map(|id| id.main).collect();
        let parent = match ledger {
            // Our own submission: batch order is known even if some
            // batches already finished.
            Some(entry) => Parent::Queued {
                batches: entry
                    .batches
                    .iter()
                    .map(|id| queued.contains(id).then_some(*id))
                    .collect(),
                array: entry.array,
            },
            None => {
                let mut mains: Vec<u64> = queued.into_iter().collect();
                mains.sort_unstable();
                Parent::Queued {
                    batches: mains.into_iter().map(Some).collect(),
                    array: ids.iter().any(|id| id.task.is_some()),
                }
            }
        };
        Ok(parent)
    }

    /// `--dependency=` value for batch `batch` of `job`, if it waits on anything.
    ///
    /// One-to-one references pair batches only when `job` is an array itself;
    /// a scalar dependent waits for every batch of the parent.
    fn dependency_expression(
        &self,
        ws: &Workspace,
        job: &str,
        array_job: bool,
        hold: &[Dependency],
        batch: usize,
    ) -> EngineResult<Option<String>> {
        let max_array = ws.config().engine.max_array_size.max(1);
        let mut after_ok: Vec<String> = Vec::new();
        let mut after_corr: Vec<String> = Vec::new();

        for dep in hold {
            let (batches, array) = match self.lookup(dep.name())? {
                Parent::Unknown => {
                    unresolved(ws, job, dep)?;
                    continue;
                }
                Parent::Completed => {
                    debug!(job, dependency = %dep, "dependency already left the queue");
                    continue;
                }
                Parent::Queued { batches, array } => (batches, array),
            };
            info!(job, dependency = %dep, "holding until dependency completes");

            match dep {
                Dependency::TaskSubset(_, ids) if array => {
                    let capacity = u32::try_from(batches.len())
                        .unwrap_or(u32::MAX)
                        .saturating_mul(max_array);
                    let tasks = dep.parent_tasks(capacity).unwrap_or_default();
                    if tasks.len() < ids.len() {
                        warn!(job, dependency = %dep, capacity, "ignoring tasks outside the parent array");
                    }
                    for (b, local) in tasks.into_iter().filter_map(|k| split_index(k, max_array)) {
                        if let Some(Some(main)) = batches.get(b) {
                            after_ok.push(format!("{main}_{local}"));
                        }
                    }
                }
                Dependency::OneToOne(_) if array && array_job => match batches.get(batch) {
                    Some(Some(main)) => after_corr.push(main.to_string()),
                    Some(None) => {}
                    None => warn!(job, dependency = %dep, batch, "parent has no matching batch"),
                },
                _ => after_ok.extend(batches.iter().flatten().map(u64::to_string)),
            }
        }

        if batch > 0 {
            if let Some(previous) = self
                .ledger
                .get(job)
                .and_then(|e| e.batches.get(batch - 1))
            {
                after_ok.push(previous.to_string());
            }
        }

        let mut parts = Vec::new();
        if !after_ok.is_empty() {
            parts.push(format!("afterok:{}", after_ok.join(":")));
        }
        if !after_corr.is_empty() {
            parts.push(format!("aftercorr:{}", after_corr.join(":")));
        }
        Ok((!parts.is_empty()).then(|| parts.join(",")))
    }

    fn partition(&mut self, ws: &Workspace, requested: &RunTime) -> EngineResult<String> {
        if self.partitions.is_none() {
            let cmd = CommandLine::new("sinfo").args(["--noheader", "--format=%P %l %a"]);
            let listing = run_checked(ws.runner(), &cmd)?;
            let partitions = parse_partitions(&listing.stdout);
            debug!(count = partitions.len(), "loaded partitions");
            self.partitions = Some(partitions);
        }
        let partitions = self.partitions.as_deref().unwrap_or_default();
        select_partition(partitions, requested)
            .map(|p| p.name.clone())
            .ok_or_else(|| EngineError::NoPartition(requested.to_string()))
    }

    fn sbatch(&self, ws: &Workspace, cmd: CommandLine) -> EngineResult<u64> {
        let output = run_checked(ws.runner(), &cmd)?;
        output
            .lines()
            .next()
            .and_then(|line| line.split(';').next())
            .and_then(|id| id.trim().parse().ok())
            .ok_or_else(|| EngineError::UnexpectedOutput {
                command: cmd.to_string(),
                output: output.stdout.clone(),
            })
    }

    fn base_command(ws: &Workspace, job: &Submission<'_>, partition: &str) -> CommandLine {
        let engine = &ws.config().engine;
        let spec = job.spec;
        let mut cmd = CommandLine::new("sbatch")
            .arg("--parsable")
            .arg("--mail-type=FAIL")
            .cwd(&ws.layout().config_dir());
        if !engine.mail_user.is_empty() {
            cmd = cmd.arg(format!("--mail-user={}", engine.mail_user));
        }
        cmd = cmd
            .arg(format!("--mem={}M", spec.memory_mb.unwrap_or_default()))
            .arg(format!("--partition={partition}"))
            .arg(format!("--time={}", spec.run_time));
        if spec.cores > 1 {
            cmd = cmd.arg(format!("--cpus-per-task={}", spec.cores));
        }
        cmd = cmd.arg(format!("--job-name={}", job.name));
        if !engine.exclude_nodes.is_empty() {
            cmd = cmd.arg(format!("--exclude={}", engine.exclude_nodes.join(",")));
        }
        cmd
    }

    fn log_queue_load(&self, tasks: u32) {
        let Ok(user) = std::env::var("USER") else {
            return;
        };
        if let Ok(Some(scheduled)) = self.resolver.queued_tasks(&user) {
            info!(adding = tasks, scheduled, "adding tasks to the queue");
        }
    }
}

impl Backend for SlurmBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Slurm
    }

    fn submit(&mut self, ws: &Workspace, job: &Submission<'_>) -> EngineResult<()> {
        let log_dir = ws.layout().log_dir();
        create_directory(&log_dir, false)?;
        fs::create_dir_all(ws.layout().config_dir())?;

        let spec = job.spec;
        let partition = self.partition(ws, &spec.run_time)?;
        let stem = job.log_stem().to_string();

        match spec.array_size {
            None => {
                let script = ws.pack_environment(&spec.env, &spec.script)?;
                let mut cmd = Self::base_command(ws, job, &partition)
                    .arg(format!("--output={}", log_dir.join(format!("{stem}.log")).display()));
                if let Some(deps) = self.dependency_expression(ws, &job.name, false, &job.hold, 0)? {
                    cmd = cmd.arg(format!("--dependency={deps}"));
                }
                let id = self.sbatch(ws, cmd.arg(script.display().to_string()))?;
                info!(job = %job.name, id, "submitted job");
                self.ledger.insert(
                    job.name.clone(),
                    LedgerEntry {
                        batches: vec![id],
                        array: false,
                    },
                );
            }
            Some(size) => {
                let engine = &ws.config().engine;
                let max_array = engine.max_array_size.max(1);
                let throttle = engine.max_current_jobs;
                info!(job = %job.name, size, "submitting array");
                self.ledger.insert(
                    job.name.clone(),
                    LedgerEntry {
                        batches: Vec::new(),
                        array: true,
                    },
                );

                let mut start = 0;
                let mut batch = 0;
                while start < size {
                    let count = (size - start).min(max_array);
                    self.log_queue_load(count);

                    let mut env = spec.env.clone();
                    env.push(("IdOffSet".to_string(), start.to_string()));
                    let script = ws.pack_environment(&env, &spec.script)?;

                    let mut range = format!("--array=1-{count}");
                    if throttle > 0 && i64::from(count) > throttle {
                        range.push_str(&format!("%{throttle}"));
                    }
                    let mut cmd = Self::base_command(ws, job, &partition)
                        .arg(format!(
                            "--output={}",
                            log_dir.join(format!("{stem}_%A_%a.log")).display()
                        ))
                        .arg(range);
                    if let Some(deps) = self.dependency_expression(ws, &job.name, true, &job.hold, batch)? {
                        cmd = cmd.arg(format!("--dependency={deps}"));
                    }
                    let id = self.sbatch(ws, cmd.arg(script.display().to_string()))?;
                    info!(job = %job.name, id, batch, offset = start, tasks = count, "submitted array batch");
                    if let Some(entry) = self.ledger.get_mut(&job.name) {
                        entry.batches.push(id);
                    }
                    start += count;
                    batch += 1;
                }
            }
        }

        self.jobs += 1;
        self.tasks += spec.task_count() as usize;
        Ok(())
    }

    fn finish(&mut self, _ws: &Workspace) -> EngineResult<FinishReport> {
        if self.jobs == 0 {
            return Err(EngineError::NothingScheduled);
        }
        let report = FinishReport::Submitted {
            jobs: self.jobs,
            tasks: self.tasks,
        };
        self.jobs = 0;
        self.tasks = 0;
        Ok(report)
    }
}
