//! Scheduler backends.
//!
//! The facade validates a job, then hands it to exactly one [`Backend`]:
//!
//! - [`DagBackend`]: accumulates a DAG file and submits it once (HTCondor)
//! - [`SlurmBackend`]: submits immediately, dependencies as id strings
//! - [`SgeBackend`]: submits immediately, arrays unrolled into single jobs
//! - [`LocalBackend`]: runs everything on this machine at finish

pub mod dag;
pub mod local;
pub mod sge;
pub mod slurm;

use batchgrid_core::{Dependency, EngineKind, JobSpec};
use serde::Serialize;
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::workspace::Workspace;

pub use dag::DagBackend;
pub use local::LocalBackend;
pub use sge::SgeBackend;
pub use slurm::SlurmBackend;

/// A validated job on its way to the backend.
#[derive(Debug, Clone)]
pub struct Submission<'a> {
    /// Run-qualified job name.
    pub name: String,
    pub spec: &'a JobSpec,
    /// Dependencies, including the implicit hold on the build job.
    pub hold: Vec<Dependency>,
}

impl Submission<'_> {
    /// File stem for log files: the sub-job name, or the full name for the
    /// run-level job.
    pub fn log_stem(&self) -> &str {
        if self.spec.sub_job.is_empty() {
            &self.name
        } else {
            &self.spec.sub_job
        }
    }
}

/// Counts of a local run. Every declared unit either started (and then
/// succeeded or failed) or was excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecutionSummary {
    pub declared: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub excluded: usize,
}

impl ExecutionSummary {
    pub fn started(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// What `finish` did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReport {
    /// Jobs were handed to a cluster scheduler.
    Submitted { jobs: usize, tasks: usize },
    /// Jobs ran to completion on this machine.
    Executed(ExecutionSummary),
}

pub trait Backend: Send {
    fn kind(&self) -> EngineKind;

    /// File name of the helper script jobs source to talk to this scheduler.
    fn control_module(&self) -> &'static str {
        match self.kind() {
            EngineKind::Slurm => "ClusterControlSLURM.sh",
            EngineKind::Htcondor => "ClusterControlHTCONDOR.sh",
            EngineKind::Sge => "ClusterControlSGE.sh",
            EngineKind::Local => "ClusterControlLOCAL.sh",
        }
    }

    fn submit(&mut self, ws: &Workspace, job: &Submission<'_>) -> EngineResult<()>;

    fn finish(&mut self, ws: &Workspace) -> EngineResult<FinishReport>;
}

/// A dependency that could not be matched to any job. Fatal in strict mode,
/// otherwise the edge is dropped with a warning.
pub(crate) fn unresolved(ws: &Workspace, job: &str, dependency: &Dependency) -> EngineResult<()> {
    if ws.strict_dependencies() {
        return Err(EngineError::UnresolvedDependency {
            job: job.to_string(),
            dependency: dependency.to_string(),
        });
    }
    warn!(job, dependency = %dependency, "dependency is unknown, skipping it");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_stem_prefers_sub_job() {
        let spec = JobSpec::new("Merge", "Merge.sh");
        let sub = Submission {
            name: "Run_Merge".into(),
            spec: &spec,
            hold: vec![],
        };
        assert_eq!(sub.log_stem(), "Merge");

        let top = JobSpec::new("", "Job.sh");
        let sub = Submission {
            name: "Run".into(),
            spec: &top,
            hold: vec![],
        };
        assert_eq!(sub.log_stem(), "Run");
    }

    #[test]
    fn summary_accounts_for_every_unit() {
        let s = ExecutionSummary {
            declared: 5,
            succeeded: 2,
            failed: 1,
            excluded: 2,
        };
        assert_eq!(s.started() + s.excluded, s.declared);
    }

    #[test]
    fn reports_serialize_with_their_kind() {
        let submitted = serde_json::to_value(FinishReport::Submitted { jobs: 3, tasks: 12 }).unwrap();
        assert_eq!(submitted["submitted"]["tasks"], 12);

        let executed = serde_json::to_value(FinishReport::Executed(ExecutionSummary {
            declared: 1,
            succeeded: 1,
            failed: 0,
            excluded: 0,
        }))
        .unwrap();
        assert_eq!(executed["executed"]["succeeded"], 1);
    }
}
