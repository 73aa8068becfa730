//! Local backend: runs every declared unit on this machine.
//!
//! Submissions only record units (one per array task). `finish` resolves
//! dependencies by name, then drives a poll loop that launches a unit once
//! every unit it depends on succeeded, up to the configured concurrency.
//! A unit whose dependency failed, or was itself excluded, is excluded and
//! never starts.
//!
//! Each unit runs on its own thread with a private scratch directory under
//! the run's tmp dir, exported as `TMPDIR` and removed when the thread ends.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use batchgrid_core::fsutil::create_directory;
use batchgrid_core::{Dependency, EngineKind};
use tracing::{debug, error, info, warn};

use super::{Backend, ExecutionSummary, FinishReport, Submission, unresolved};
use crate::command::CommandLine;
use crate::error::{EngineError, EngineResult};
use crate::workspace::Workspace;

const LOG_TAIL_LINES: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Excluded,
}

impl Phase {
    fn is_dead(self) -> bool {
        matches!(self, Phase::Failed | Phase::Excluded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Waiting,
    /// A dependency failed or was excluded; the unit can never start.
    Doomed,
}

pub fn readiness(deps: &[usize], phases: &[Phase]) -> Readiness {
    if deps.iter().any(|&d| phases[d].is_dead()) {
        Readiness::Doomed
    } else if deps.iter().all(|&d| phases[d] == Phase::Succeeded) {
        Readiness::Ready
    } else {
        Readiness::Waiting
    }
}

/// Exclude every pending unit that sits in a dead chain. Returns the newly
/// excluded units.
pub fn exclude_dead_chains(deps: &[Vec<usize>], phases: &mut [Phase]) -> Vec<usize> {
    let mut excluded = Vec::new();
    loop {
        let doomed: Vec<usize> = (0..phases.len())
            .filter(|&u| {
                phases[u] == Phase::Pending && readiness(&deps[u], phases) == Readiness::Doomed
            })
            .collect();
        if doomed.is_empty() {
            return excluded;
        }
        for u in doomed {
            phases[u] = Phase::Excluded;
            excluded.push(u);
        }
    }
}

#[derive(Debug, Clone)]
struct Unit {
    name: String,
    task: Option<u32>,
    env_script: PathBuf,
    hold: Vec<Dependency>,
}

impl Unit {
    fn label(&self) -> String {
        match self.task {
            Some(t) => format!("{}_{t}", self.name),
            None => self.name.clone(),
        }
    }
}

#[derive(Debug, Default)]
pub struct LocalBackend {
    units: Vec<Unit>,
    by_name: HashMap<String, Vec<usize>>,
    array_sizes: HashMap<String, u32>,
}

impl LocalBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Unit indices each unit waits on.
    fn resolve_dependencies(&self, ws: &Workspace) -> EngineResult<Vec<Vec<usize>>> {
        let mut resolved = Vec::with_capacity(self.units.len());
        for (u, unit) in self.units.iter().enumerate() {
            let mut deps = Vec::new();
            for dep in &unit.hold {
                let Some(parents) = self.by_name.get(dep.name()) else {
                    unresolved(ws, &unit.name, dep)?;
                    continue;
                };
                let parent_size = self.array_sizes.get(dep.name()).copied();
                let subset = parent_size.and_then(|n| dep.parent_tasks(n));
                let selected = parents.iter().copied().filter(|&p| {
                    let parent_task = self.units[p].task;
                    match dep {
                        Dependency::WholeJob(_) => true,
                        Dependency::TaskSubset(..) => match &subset {
                            Some(ids) => parent_task.is_some_and(|t| ids.contains(&t)),
                            None => true,
                        },
                        Dependency::OneToOne(_) => match unit.task {
                            Some(t) if parent_size.is_some() => parent_task == Some(t),
                            _ => true,
                        },
                    }
                });
                deps.extend(selected.filter(|&p| p != u));
            }
            deps.sort_unstable();
            deps.dedup();
            resolved.push(deps);
        }
        Ok(resolved)
    }

    fn log_file(ws: &Workspace, unit: &Unit) -> PathBuf {
        ws.layout().log_dir().join(format!("{}.log", unit.label()))
    }

    fn launch(&self, ws: &Workspace, unit: &Unit) -> EngineResult<JoinHandle<bool>> {
        let scratch = tempfile::Builder::new()
            .prefix("task-")
            .tempdir_in(ws.layout().tmp_dir())?;
        let task_id = unit.task.map_or_else(|| "-1".to_string(), |t| t.to_string());
        let cmd = CommandLine::new("bash")
            .arg(unit.env_script.display().to_string())
            .env("LOCAL_TASK_ID", task_id)
            .env("TMPDIR", scratch.path().display().to_string())
            .log_to(&Self::log_file(ws, unit));

        match unit.task {
            Some(t) => info!(
                job = %unit.name,
                task = t,
                of = self.array_sizes.get(&unit.name).copied().unwrap_or(0),
                "starting task"
            ),
            None => info!(job = %unit.name, "starting job"),
        }

        let runner = ws.runner_handle();
        let label = unit.label();
        let handle = thread::Builder::new().name(label.clone()).spawn(move || {
            let _scratch = scratch;
            match runner.run(&cmd) {
                Ok(output) => output.success(),
                Err(err) => {
                    error!(unit = %label, error = %err, "could not run unit");
                    false
                }
            }
        })?;
        Ok(handle)
    }

    fn report(&self, ws: &Workspace, phases: &[Phase], running: &[(usize, JoinHandle<bool>)]) {
        let started = phases
            .iter()
            .filter(|p| !matches!(p, Phase::Pending | Phase::Excluded))
            .count();
        info!(
            started,
            total = phases.len(),
            running = running.len(),
            "local execution progress"
        );
        for (u, _) in running {
            let unit = &self.units[*u];
            let Ok(content) = fs::read_to_string(Self::log_file(ws, unit)) else {
                continue;
            };
            let lines: Vec<&str> = content.lines().collect();
            for line in &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..] {
                debug!("<{}> {}", unit.label(), line);
            }
        }
    }
}

impl Backend for LocalBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Local
    }

    fn submit(&mut self, ws: &Workspace, job: &Submission<'_>) -> EngineResult<()> {
        let spec = job.spec;
        let env_script = ws.pack_environment(&spec.env, &spec.script)?;
        let tasks: Vec<Option<u32>> = match spec.array_size {
            None => vec![None],
            Some(n) => {
                self.array_sizes.insert(job.name.clone(), n);
                (1..=n).map(Some).collect()
            }
        };
        for task in tasks {
            self.by_name
                .entry(job.name.clone())
                .or_default()
                .push(self.units.len());
            self.units.push(Unit {
                name: job.name.clone(),
                task,
                env_script: env_script.clone(),
                hold: job.hold.clone(),
            });
        }
        debug!(job = %job.name, units = spec.task_count(), "queued for local execution");
        Ok(())
    }

    fn finish(&mut self, ws: &Workspace) -> EngineResult<FinishReport> {
        if self.units.is_empty() {
            return Err(EngineError::NothingScheduled);
        }
        create_directory(&ws.layout().log_dir(), false)?;
        create_directory(&ws.layout().tmp_dir(), false)?;

        let deps = self.resolve_dependencies(ws)?;
        let engine = &ws.config().engine;
        let ceiling = ws.config().local_concurrency();
        let poll = Duration::from_millis(engine.poll_interval_ms);
        let report_every = engine.report_every.max(1);

        let mut phases = vec![Phase::Pending; self.units.len()];
        let mut running: Vec<(usize, JoinHandle<bool>)> = Vec::new();
        let mut cycles: u64 = 0;

        loop {
            let mut i = 0;
            while i < running.len() {
                if !running[i].1.is_finished() {
                    i += 1;
                    continue;
                }
                let (u, handle) = running.swap_remove(i);
                let succeeded = handle.join().unwrap_or(false);
                phases[u] = if succeeded {
                    Phase::Succeeded
                } else {
                    Phase::Failed
                };
                if succeeded {
                    debug!(unit = %self.units[u].label(), "unit succeeded");
                } else {
                    warn!(unit = %self.units[u].label(), log = %Self::log_file(ws, &self.units[u]).display(), "unit failed");
                }
            }

            for u in exclude_dead_chains(&deps, &mut phases) {
                warn!(unit = %self.units[u].label(), "dependency failed, unit will not run");
            }

            for u in 0..self.units.len() {
                if running.len() >= ceiling {
                    break;
                }
                if phases[u] != Phase::Pending || readiness(&deps[u], &phases) != Readiness::Ready {
                    continue;
                }
                match self.launch(ws, &self.units[u]) {
                    Ok(handle) => {
                        phases[u] = Phase::Running;
                        running.push((u, handle));
                    }
                    Err(err) => {
                        error!(unit = %self.units[u].label(), error = %err, "could not launch unit");
                        phases[u] = Phase::Failed;
                    }
                }
            }

            if running.is_empty() {
                exclude_dead_chains(&deps, &mut phases);
                for (u, phase) in phases.iter_mut().enumerate() {
                    if *phase == Phase::Pending {
                        warn!(unit = %self.units[u].label(), "dependencies can never be met, unit will not run");
                        *phase = Phase::Excluded;
                    }
                }
                break;
            }

            cycles += 1;
            if cycles % report_every == 0 {
                self.report(ws, &phases, &running);
            }
            thread::sleep(poll);
        }

        let count = |wanted: Phase| phases.iter().filter(|&&p| p == wanted).count();
        let summary = ExecutionSummary {
            declared: phases.len(),
            succeeded: count(Phase::Succeeded),
            failed: count(Phase::Failed),
            excluded: count(Phase::Excluded),
        };
        info!(
            declared = summary.declared,
            succeeded = summary.succeeded,
            failed = summary.failed,
            excluded = summary.excluded,
            "local execution finished"
        );

        self.units.clear();
        self.by_name.clear();
        self.array_sizes.clear();
        Ok(FinishReport::Executed(summary))
    }
}
