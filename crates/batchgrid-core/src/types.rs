//! Backend-independent job model.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::time::RunTime;

/// An exported environment variable, `(name, value)`.
pub type EnvVar = (String, String);

/// Global job name for `sub_job` within the run named `base`.
pub fn qualified_name(base: &str, sub_job: &str) -> String {
    if sub_job.is_empty() {
        base.to_string()
    } else {
        format!("{base}_{sub_job}")
    }
}

/// A reference from one job to another.
///
/// Task indices are 1-based. Index 0 is never produced and is dropped when a
/// subset is built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dependency {
    /// Wait for every task of the referenced job.
    WholeJob(String),
    /// Wait only for the listed tasks of the referenced array.
    TaskSubset(String, Vec<u32>),
    /// Task *i* of the dependent array waits on task *i* of the referenced array.
    OneToOne(String),
}

impl Dependency {
    pub fn whole(name: impl Into<String>) -> Self {
        Dependency::WholeJob(name.into())
    }

    /// Subset dependency. Zero indices are discarded; an empty subset
    /// collapses into a whole-job dependency.
    pub fn tasks(name: impl Into<String>, ids: impl IntoIterator<Item = u32>) -> Self {
        let mut ids: Vec<u32> = ids.into_iter().filter(|&i| i > 0).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.is_empty() {
            Dependency::WholeJob(name.into())
        } else {
            Dependency::TaskSubset(name.into(), ids)
        }
    }

    pub fn one_to_one(name: impl Into<String>) -> Self {
        Dependency::OneToOne(name.into())
    }

    /// Name of the referenced job.
    pub fn name(&self) -> &str {
        match self {
            Dependency::WholeJob(n) | Dependency::TaskSubset(n, _) | Dependency::OneToOne(n) => n,
        }
    }

    /// The dependency as seen by task `task` of a dependent array.
    ///
    /// A one-to-one reference narrows to the matching parent task; every
    /// other selector is unchanged.
    pub fn for_task(&self, task: u32) -> Dependency {
        match self {
            Dependency::OneToOne(n) => Dependency::tasks(n.clone(), [task]),
            other => other.clone(),
        }
    }

    /// Rebuild a hand-made subset through [`Dependency::tasks`].
    pub fn normalized(&self) -> Dependency {
        match self {
            Dependency::TaskSubset(n, ids) => Dependency::tasks(n.clone(), ids.iter().copied()),
            other => other.clone(),
        }
    }

    /// Tasks of a parent array of `size` tasks picked by a subset dependency,
    /// restricted to `1..=size`. `None` for whole-job and one-to-one references.
    pub fn parent_tasks(&self, size: u32) -> Option<Vec<u32>> {
        match self {
            Dependency::TaskSubset(_, ids) => {
                Some(ids.iter().copied().filter(|t| (1..=size).contains(t)).collect())
            }
            _ => None,
        }
    }
}

impl From<&str> for Dependency {
    fn from(name: &str) -> Self {
        Dependency::WholeJob(name.to_string())
    }
}

impl From<String> for Dependency {
    fn from(name: String) -> Self {
        Dependency::WholeJob(name)
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::WholeJob(n) => f.write_str(n),
            Dependency::TaskSubset(n, ids) => {
                let ids: Vec<String> = ids.iter().map(u32::to_string).collect();
                write!(f, "{n} [{}]", ids.join(","))
            }
            Dependency::OneToOne(n) => write!(f, "{n} [1 by 1]"),
        }
    }
}

/// A named unit of work, optionally replicated as an array.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Sub-name within the run; empty for the run-level job.
    pub sub_job: String,
    /// Script executed by every task.
    pub script: PathBuf,
    /// Required memory in MB. `None` is rejected at submission.
    pub memory_mb: Option<u32>,
    pub run_time: RunTime,
    pub cores: u32,
    pub env: Vec<EnvVar>,
    /// Number of tasks; `None` for a scalar job.
    pub array_size: Option<u32>,
}

impl JobSpec {
    pub fn new(sub_job: impl Into<String>, script: impl AsRef<Path>) -> Self {
        Self {
            sub_job: sub_job.into(),
            script: script.as_ref().to_path_buf(),
            memory_mb: None,
            run_time: RunTime::from_secs(3600),
            cores: 1,
            env: Vec::new(),
            array_size: None,
        }
    }

    pub fn memory(mut self, mb: u32) -> Self {
        self.memory_mb = Some(mb);
        self
    }

    pub fn run_time(mut self, run_time: RunTime) -> Self {
        self.run_time = run_time;
        self
    }

    pub fn cores(mut self, cores: u32) -> Self {
        self.cores = cores.max(1);
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.env.push((name.into(), value.to_string()));
        self
    }

    pub fn array(mut self, size: u32) -> Self {
        self.array_size = Some(size);
        self
    }

    pub fn is_array(&self) -> bool {
        self.array_size.is_some()
    }

    /// Number of schedulable units this job expands to.
    pub fn task_count(&self) -> u32 {
        self.array_size.unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn qualified_names() {
        assert_eq!(qualified_name("Run", ""), "Run");
        assert_eq!(qualified_name("Run", "Build"), "Run_Build");
    }

    #[test]
    fn subset_drops_zero_and_sorts() {
        let dep = Dependency::tasks("A", [3, 0, 1, 3]);
        assert_eq!(dep, Dependency::TaskSubset("A".into(), vec![1, 3]));
        assert_eq!(dep.to_string(), "A [1,3]");
    }

    #[test]
    fn empty_subset_is_whole_job() {
        assert_eq!(Dependency::tasks("A", [0]), Dependency::whole("A"));
    }

    #[test]
    fn hand_built_subsets_are_cleaned_up() {
        let raw = Dependency::TaskSubset("A".into(), vec![0, 7, 2, 7]);
        assert_eq!(raw.normalized(), Dependency::TaskSubset("A".into(), vec![2, 7]));
        assert_eq!(
            Dependency::TaskSubset("A".into(), vec![0]).normalized(),
            Dependency::whole("A")
        );
        assert_eq!(raw.parent_tasks(5), Some(vec![2]));
        assert_eq!(Dependency::one_to_one("A").parent_tasks(5), None);
    }

    #[test]
    fn one_to_one_narrows_per_task() {
        let dep = Dependency::one_to_one("A");
        assert_eq!(dep.for_task(4), Dependency::TaskSubset("A".into(), vec![4]));
        assert_eq!(Dependency::whole("A").for_task(4), Dependency::whole("A"));
        assert_eq!(dep.to_string(), "A [1 by 1]");
    }

    #[test]
    fn job_spec_builder() {
        let job = JobSpec::new("Merge", "scripts/Merge.sh")
            .memory(500)
            .cores(0)
            .env("JobConfigList", "/tmp/list.txt")
            .array(12);
        assert_eq!(job.cores, 1);
        assert_eq!(job.task_count(), 12);
        assert_eq!(job.env[0].1, "/tmp/list.txt");
        assert!(JobSpec::new("x", "y").task_count() == 1);
    }
}
