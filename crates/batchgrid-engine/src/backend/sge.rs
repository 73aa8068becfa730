//! Single-submission backend for `qsub` clusters without array support.
//!
//! An array of N tasks is unrolled into N independent jobs `<name>_1` …
//! `<name>_N`, each exporting its index in `SGE_TASK_ID`. Dependencies on an
//! unrolled array are expanded back into those per-task names before they
//! are resolved against `qstat`.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use batchgrid_core::fsutil::create_directory;
use batchgrid_core::{Dependency, EngineKind, EnvVar, JobSpec};
use tracing::{debug, info};

use super::{Backend, FinishReport, Submission, unresolved};
use crate::command::{CommandLine, run_checked};
use crate::error::{EngineError, EngineResult};
use crate::queue::JobIdResolver;
use crate::workspace::Workspace;

pub struct SgeBackend {
    resolver: Arc<dyn JobIdResolver>,
    /// Unrolled arrays: name → size.
    arrays: HashMap<String, u32>,
    /// Every name submitted this run with the id `qsub` returned.
    submitted: HashMap<String, String>,
    jobs: usize,
    tasks: usize,
}

impl SgeBackend {
    pub fn new(resolver: Arc<dyn JobIdResolver>) -> Self {
        Self {
            resolver,
            arrays: HashMap::new(),
            submitted: HashMap::new(),
            jobs: 0,
            tasks: 0,
        }
    }

    /// Queue names a dependency stands for once arrays are unrolled.
    fn expand(&self, dep: &Dependency) -> Vec<String> {
        let name = dep.name();
        match (dep, self.arrays.get(name)) {
            (Dependency::TaskSubset(..), Some(&n)) => dep
                .parent_tasks(n)
                .unwrap_or_default()
                .into_iter()
                .map(|t| format!("{name}_{t}"))
                .collect(),
            (_, Some(&n)) => (1..=n).map(|t| format!("{name}_{t}")).collect(),
            (Dependency::TaskSubset(_, ids), None) if !self.submitted.contains_key(name) => ids
                .iter()
                .filter(|&&t| t > 0)
                .map(|t| format!("{name}_{t}"))
                .collect(),
            _ => vec![name.to_string()],
        }
    }

    fn depend_ids(&self, ws: &Workspace, job: &str, hold: &[Dependency]) -> EngineResult<Vec<String>> {
        let mut ids = Vec::new();
        for dep in hold {
            let mut found = false;
            for name in self.expand(dep) {
                let queued = self.resolver.resolve(&name)?;
                if queued.is_empty() && self.submitted.contains_key(&name) {
                    debug!(job, dependency = %name, "dependency already left the queue");
                    found = true;
                }
                found |= !queued.is_empty();
                ids.extend(queued);
            }
            if found {
                info!(job, dependency = %dep, "holding until dependency completes");
            } else {
                unresolved(ws, job, dep)?;
            }
        }
        Ok(ids)
    }

    fn submit_single(
        &mut self,
        ws: &Workspace,
        name: &str,
        spec: &JobSpec,
        env: &[EnvVar],
        hold: &[Dependency],
    ) -> EngineResult<()> {
        let log_dir = ws.layout().log_dir();
        create_directory(&log_dir, false)?;
        let script = ws.pack_environment(env, &spec.script)?;

        let mut cmd = CommandLine::new("qsub")
            .args(["-o".to_string(), log_dir.display().to_string()])
            .args(["-j", "oe"])
            .cwd(&log_dir);

        let ids = self.depend_ids(ws, name, hold)?;
        if !ids.is_empty() {
            // Clean-up jobs run whether or not their parents succeeded.
            let condition = if name.contains("Clean") || name.contains("Copy-LCK") {
                "afterany"
            } else {
                "afterok"
            };
            cmd = cmd.args(["-W".to_string(), format!("depend={condition}:{}", ids.join(":"))]);
        }

        let run_time = spec.run_time.to_string();
        cmd = cmd
            .args(["-N", name])
            .args(["-l".to_string(), format!("cput={run_time}")])
            .args(["-l".to_string(), format!("walltime={run_time}")])
            .args(["-l".to_string(), format!("nodes=1:ppn={}", spec.cores)])
            .arg(script.display().to_string());

        let output = run_checked(ws.runner(), &cmd)?;
        let id = output.lines().next().unwrap_or_default().to_string();
        info!(job = name, id = %id, "submitted job");
        self.submitted.insert(name.to_string(), id);
        Ok(())
    }
}

impl Backend for SgeBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Sge
    }

    fn submit(&mut self, ws: &Workspace, job: &Submission<'_>) -> EngineResult<()> {
        fs::create_dir_all(ws.layout().config_dir())?;
        let spec = job.spec;
        match spec.array_size {
            None => self.submit_single(ws, &job.name, spec, &spec.env, &job.hold)?,
            Some(n) => {
                info!(job = %job.name, size = n, "unrolling array into single jobs");
                for task in 1..=n {
                    let mut env = spec.env.clone();
                    env.push(("SGE_TASK_ID".to_string(), task.to_string()));
                    let hold: Vec<Dependency> = job.hold.iter().map(|d| d.for_task(task)).collect();
                    self.submit_single(ws, &format!("{}_{task}", job.name), spec, &env, &hold)?;
                }
                self.arrays.insert(job.name.clone(), n);
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
