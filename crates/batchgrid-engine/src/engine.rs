//! The orchestration facade.
//!
//! `Engine` is what callers talk to: it validates jobs, keeps the run's job
//! graph, prepends the implicit hold on the build job, and forwards every
//! accepted job to the configured [`Backend`]. The utility jobs every run
//! needs (build, clean, copy, move, final lock hand-over) are assembled
//! here so that they look the same on every scheduler.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use batchgrid_core::fsutil::{create_directory, make_executable, random_id, write_list};
use batchgrid_core::{
    BatchConfig, Dependency, EngineKind, JobGraph, JobSpec, RunLayout, RunTime, qualified_name,
};
use tracing::{debug, info, warn};

use crate::backend::{Backend, DagBackend, FinishReport, LocalBackend, SgeBackend, SlurmBackend, Submission};
use crate::command::CommandRunner;
use crate::error::{EngineError, EngineResult};
use crate::merge::{MergeDirs, MergeNode, MergeRequest};
use crate::queue::{QstatResolver, SqueueResolver};
use crate::workspace::Workspace;

pub const BUILD_JOB: &str = "Build";
pub const BUILD_SCRIPT: &str = "Build.sh";
pub const CLEAN_SCRIPT: &str = "Clean.sh";
pub const COPY_SCRIPT: &str = "Copy.sh";
pub const MOVE_SCRIPT: &str = "Move.sh";

const UTILITY_MEMORY_MB: u32 = 100;
const UTILITY_RUN_TIME_SECS: u64 = 3600;

/// What a copy or move job transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    /// These files.
    Files(Vec<PathBuf>),
    /// The whole directory.
    Dir(PathBuf),
}

pub struct Engine {
    workspace: Workspace,
    backend: Box<dyn Backend>,
    graph: JobGraph,
}

impl Engine {
    /// Build an engine for `job_name` with the backend the config selects.
    pub fn new(config: BatchConfig, job_name: &str, runner: Arc<dyn CommandRunner>) -> EngineResult<Self> {
        if job_name.is_empty() {
            return Err(EngineError::InvalidJob {
                job: job_name.to_string(),
                reason: "the run needs a name".to_string(),
            });
        }
        let backend: Box<dyn Backend> = match config.engine.kind {
            EngineKind::Slurm => Box::new(SlurmBackend::new(Arc::new(SqueueResolver::new(Arc::clone(&runner))))?),
            EngineKind::Htcondor => Box::new(DagBackend::new()),
            EngineKind::Sge => Box::new(SgeBackend::new(Arc::new(QstatResolver::new(Arc::clone(&runner))))),
            EngineKind::Local => Box::new(LocalBackend::new()),
        };
        let layout = RunLayout::today(&config.engine.base_dir, job_name);
        Ok(Self::with_backend(config, layout, runner, backend))
    }

    /// Build an engine around an explicit backend and layout.
    pub fn with_backend(
        config: BatchConfig,
        layout: RunLayout,
        runner: Arc<dyn CommandRunner>,
        backend: Box<dyn Backend>,
    ) -> Self {
        Self {
            workspace: Workspace::new(config, layout, runner),
            backend,
            graph: JobGraph::new(),
        }
    }

    pub fn kind(&self) -> EngineKind {
        self.backend.kind()
    }

    pub fn job_name(&self) -> &str {
        self.workspace.job_name()
    }

    /// Global name of `sub_job` within this run.
    pub fn subjob_name(&self, sub_job: &str) -> String {
        qualified_name(self.job_name(), sub_job)
    }

    pub fn layout(&self) -> &RunLayout {
        self.workspace.layout()
    }

    pub fn config(&self) -> &BatchConfig {
        self.workspace.config()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn graph(&self) -> &JobGraph {
        &self.graph
    }

    pub fn build_submitted(&self) -> bool {
        self.workspace.build_submitted()
    }

    pub fn print_banner(&self) {
        let layout = self.layout();
        info!(
            engine = %self.kind(),
            job = self.job_name(),
            log_dir = %layout.log_dir().display(),
            build_dir = %layout.build_dir().display(),
            tmp_dir = %layout.tmp_dir().display(),
            out_dir = %layout.out_dir().display(),
            "batchgrid engine"
        );
    }

    /// Refuse to run twice: once a run is submitted its tmp dir is locked,
    /// once it finished its output dir is.
    pub fn submit_hook(&self) -> EngineResult<()> {
        if self.layout().submit_lock().exists() {
            return Err(EngineError::AlreadySubmitted(self.job_name().to_string()));
        }
        if self.layout().output_lock().exists() {
            return Err(EngineError::AlreadyFinished(self.job_name().to_string()));
        }
        Ok(())
    }

    /// Write the submit lock.
    pub fn lock_area(&self) -> EngineResult<()> {
        write_list(
            ["# Hook file to prevent double submission of the same job"],
            &self.layout().submit_lock(),
        )?;
        Ok(())
    }

    /// Submit the job every later job of the run waits on.
    ///
    /// With builds enabled the source area is recompiled on the cluster;
    /// otherwise a short placeholder job takes its place so the ordering is
    /// the same either way. Afterwards the run is locked.
    pub fn submit_build_job(&mut self) -> EngineResult<()> {
        if self.build_submitted() {
            warn!(job = self.job_name(), "build job is already submitted");
            return Ok(());
        }
        self.submit_hook()?;
        // Some schedulers misbehave when logs of their own jobs vanish, so the
        // log dir is cleaned before anything is queued.
        create_directory(&self.layout().log_dir(), true)?;

        let build = self.config().build.clone();
        let hold: Vec<Dependency> = build.hold.iter().map(|h| Dependency::whole(h.as_str())).collect();
        let spec = if build.enabled {
            let layout = self.layout();
            JobSpec::new(BUILD_JOB, Path::new(BUILD_SCRIPT))
                .memory(build.memory_mb)
                .cores(build.cores)
                .run_time(RunTime::parse(&build.run_time)?)
                .env("CleanOut", layout.out_dir().display())
                .env("CleanTmp", layout.tmp_dir().display())
                .env("nCoresToUse", build.cores)
                .env("COPYAREA", layout.build_dir().display())
        } else {
            create_directory(&self.layout().out_dir(), false)?;
            let dummy = write_list(
                [
                    "#!/bin/bash",
                    "echo \"Placeholder build job. Waiting 15 seconds until everything is scheduled\"",
                    "sleep 15",
                ],
                &self.layout().config_dir().join(format!("{}.sh", random_id(35))),
            )?;
            make_executable(&dummy)?;
            JobSpec::new(BUILD_JOB, dummy)
                .memory(UTILITY_MEMORY_MB)
                .run_time(RunTime::from_secs(300))
        };
        self.declare(spec, &hold)?;
        self.workspace.mark_build_submitted();
        self.lock_area()
    }

    /// `hold` plus the build job once it is submitted.
    pub fn to_hold(&self, hold: &[Dependency]) -> Vec<Dependency> {
        let mut all = hold.to_vec();
        if self.build_submitted() {
            let build = Dependency::whole(self.subjob_name(BUILD_JOB));
            if !all.contains(&build) {
                all.push(build);
            }
        }
        all
    }

    /// Submit a single job. Returns its global name.
    pub fn submit_job(&mut self, spec: JobSpec, hold: &[Dependency]) -> EngineResult<String> {
        if spec.array_size.is_some() {
            return Err(EngineError::InvalidJob {
                job: self.subjob_name(&spec.sub_job),
                reason: "use submit_array for arrays".to_string(),
            });
        }
        let hold = self.to_hold(hold);
        self.declare(spec, &hold)
    }

    /// Submit an array job. Returns its global name.
    pub fn submit_array(&mut self, spec: JobSpec, hold: &[Dependency]) -> EngineResult<String> {
        if spec.array_size.is_none_or(|n| n < 1) {
            return Err(EngineError::InvalidJob {
                job: self.subjob_name(&spec.sub_job),
                reason: "array size must be at least 1".to_string(),
            });
        }
        let hold = self.to_hold(hold);
        self.declare(spec, &hold)
    }

    fn declare(&mut self, spec: JobSpec, hold: &[Dependency]) -> EngineResult<String> {
        let name = self.subjob_name(&spec.sub_job);
        if spec.memory_mb.is_none_or(|mb| mb == 0) {
            return Err(EngineError::InvalidJob {
                job: name,
                reason: "no memory requirement given".to_string(),
            });
        }
        if self.graph.contains(&name) {
            return Err(EngineError::DuplicateJob(name));
        }
        let module = self.backend.control_module();
        self.workspace.install_control_module(module)?;

        info!(job = %name, engine = %self.kind(), tasks = spec.task_count(), "submitting job");
        let hold: Vec<Dependency> = hold.iter().map(Dependency::normalized).collect();
        for dep in &hold {
            debug!(job = %name, dependency = %dep, "hold");
        }
        let submission = Submission {
            name: name.clone(),
            spec: &spec,
            hold,
        };
        self.backend.submit(&self.workspace, &submission)?;
        self.graph.declare(&name, spec.array_size, submission.hold)?;
        Ok(name)
    }

    /// Remove `to_clean` once `hold` is done.
    pub fn submit_clean_job(&mut self, hold: &[Dependency], to_clean: &[PathBuf], sub_job: &str) -> EngineResult<String> {
        let list = write_list(
            to_clean.iter().map(|p| p.display().to_string()),
            &self
                .layout()
                .config_dir()
                .join(format!("Clean_{}.txt", random_id(35))),
        )?;
        let spec = utility_spec("Clean", sub_job, CLEAN_SCRIPT).env("ToClean", list.display());
        self.submit_job(spec, hold)
    }

    pub fn submit_copy_job(
        &mut self,
        hold: &[Dependency],
        source: Transfer,
        destination: &Path,
        sub_job: &str,
    ) -> EngineResult<String> {
        self.submit_transfer("Copy", COPY_SCRIPT, hold, source, destination, sub_job)
    }

    pub fn submit_move_job(
        &mut self,
        hold: &[Dependency],
        source: Transfer,
        destination: &Path,
        sub_job: &str,
    ) -> EngineResult<String> {
        self.submit_transfer("Move", MOVE_SCRIPT, hold, source, destination, sub_job)
    }

    fn submit_transfer(
        &mut self,
        kind: &str,
        script: &str,
        hold: &[Dependency],
        source: Transfer,
        destination: &Path,
        sub_job: &str,
    ) -> EngineResult<String> {
        let job = self.subjob_name(&utility_name(kind, sub_job));
        if destination.as_os_str().is_empty() {
            return Err(EngineError::InvalidJob {
                job,
                reason: "no destination given".to_string(),
            });
        }
        let from = match source {
            Transfer::Files(files) if files.is_empty() => {
                return Err(EngineError::InvalidJob {
                    job,
                    reason: "nothing to transfer".to_string(),
                });
            }
            Transfer::Files(files) => write_list(
                files.iter().map(|p| p.display().to_string()),
                &self
                    .layout()
                    .config_dir()
                    .join(format!("{kind}_{}.txt", random_id(35))),
            )?,
            Transfer::Dir(dir) => dir,
        };
        let spec = utility_spec(kind, sub_job, script)
            .env("DestinationDir", destination.display())
            .env("FromDir", from.display());
        self.submit_job(spec, hold)
    }

    /// Hand the submit lock over to the output directory, then remove the
    /// run's tmp dir. Later submissions of the same run are refused.
    pub fn submit_clean_all(&mut self, hold: &[Dependency]) -> EngineResult<()> {
        let lock = self.layout().submit_lock();
        if !lock.exists() {
            self.lock_area()?;
        }
        let out_dir = self.layout().out_dir();
        let copy = self.submit_copy_job(hold, Transfer::Files(vec![lock]), &out_dir, "LCK")?;
        let tmp_dir = self.layout().tmp_dir();
        self.submit_clean_job(&[Dependency::whole(copy)], &[tmp_dir], "")?;
        Ok(())
    }

    /// Plan a merge tree into this run's tmp and output directories.
    pub fn create_merge_interface(&self, request: &MergeRequest) -> EngineResult<MergeNode> {
        let dirs = MergeDirs::for_layout(self.layout(), &self.config().merge.extension);
        MergeNode::plan(request, &dirs, &mut rand::rng())
    }

    /// Hand everything over to the scheduler (or run it, locally).
    pub fn finish(&mut self) -> EngineResult<FinishReport> {
        let report = self.backend.finish(&self.workspace)?;
        match &report {
            FinishReport::Submitted { jobs, tasks } => {
                info!(job = self.job_name(), jobs, tasks, "run submitted")
            }
            FinishReport::Executed(summary) if summary.failed + summary.excluded > 0 => warn!(
                job = self.job_name(),
                failed = summary.failed,
                excluded = summary.excluded,
                "run finished with failures"
            ),
            FinishReport::Executed(_) => info!(job = self.job_name(), "run finished"),
        }
        Ok(report)
    }
}

fn utility_name(kind: &str, sub_job: &str) -> String {
    if sub_job.is_empty() {
        kind.to_string()
    } else {
        format!("{kind}-{sub_job}")
    }
}

fn utility_spec(kind: &str, sub_job: &str, script: &str) -> JobSpec {
    JobSpec::new(utility_name(kind, sub_job), Path::new(script))
        .memory(UTILITY_MEMORY_MB)
        .run_time(RunTime::from_secs(UTILITY_RUN_TIME_SECS))
}
