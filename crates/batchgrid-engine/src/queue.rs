//! Live-queue lookups: job name → scheduler-assigned ids.
//!
//! The dependency-string and single-submission backends have no durable
//! graph; they resolve every dependency by asking the scheduler which ids are
//! currently queued under a name. [`JobIdResolver`] is the seam that keeps
//! queue parsing out of the adapters.

use std::sync::Arc;

use crate::command::{CommandLine, CommandRunner, run_checked};
use crate::error::{EngineError, EngineResult};

pub trait JobIdResolver: Send + Sync {
    /// Ids currently queued under `name`, exactly as the scheduler prints them
    /// (`123`, `123_4`, `123_[1-500%20]`, `4711.pbs.example.org`).
    ///
    /// An empty result means the name is not in the queue: either it already
    /// left it or it was never submitted. Callers decide which.
    fn resolve(&self, name: &str) -> EngineResult<Vec<String>>;

    /// Tasks the user currently has queued, when the scheduler can tell.
    fn queued_tasks(&self, _user: &str) -> EngineResult<Option<u64>> {
        Ok(None)
    }
}

/// Slurm queue via `squeue`.
pub struct SqueueResolver {
    runner: Arc<dyn CommandRunner>,
}

impl SqueueResolver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl JobIdResolver for SqueueResolver {
    fn resolve(&self, name: &str) -> EngineResult<Vec<String>> {
        let cmd = CommandLine::new("squeue").args(["--noheader", "--format=%j %i"]);
        let output = run_checked(self.runner.as_ref(), &cmd)?;
        Ok(parse_name_id_table(&output.stdout, name))
    }

    fn queued_tasks(&self, user: &str) -> EngineResult<Option<u64>> {
        let cmd = CommandLine::new("squeue").args(["--noheader", "--format=%i", "-u", user]);
        let output = run_checked(self.runner.as_ref(), &cmd)?;
        Ok(Some(output.lines().map(count_tasks).sum()))
    }
}

/// Ids listed under `name` in `name id` rows.
pub(crate) fn parse_name_id_table(table: &str, name: &str) -> Vec<String> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some(n), Some(id)) if n == name => Some(id.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Number of tasks a single `squeue` id row stands for. A pending array
/// prints as `123_[1-500%20]`; everything else is one task.
pub(crate) fn count_tasks(id: &str) -> u64 {
    let Some((_, tasks)) = id.split_once('_') else {
        return 1;
    };
    let Some(range) = tasks.strip_prefix('[') else {
        return 1;
    };
    let range = range.trim_end_matches(']');
    let range = range.split('%').next().unwrap_or(range);
    range
        .rsplit(['-', ','])
        .next()
        .and_then(|last| last.parse().ok())
        .unwrap_or(1)
}

/// `qstat` stderr lines that only say the queue holds nothing for us.
const EMPTY_QUEUE_MESSAGES: &[&str] = &["no jobs", "Unknown Job Id"];

/// PBS/SGE-style queue via `qstat -f`.
pub struct QstatResolver {
    runner: Arc<dyn CommandRunner>,
}

impl QstatResolver {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }
}

impl JobIdResolver for QstatResolver {
    fn resolve(&self, name: &str) -> EngineResult<Vec<String>> {
        let cmd = CommandLine::new("qstat").arg("-f");
        match run_checked(self.runner.as_ref(), &cmd) {
            Ok(output) => Ok(parse_qstat_full(&output.stdout, name)),
            // Some qstat builds exit non-zero when nothing is queued.
            Err(EngineError::CommandFailed { stderr, .. })
                if EMPTY_QUEUE_MESSAGES.iter().any(|m| stderr.contains(m)) =>
            {
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }
}

/// Ids of `Job Id:` blocks whose `Job_Name` equals `name`.
pub(crate) fn parse_qstat_full(listing: &str, name: &str) -> Vec<String> {
    let mut ids = Vec::new();
    let mut current: Option<&str> = None;
    for line in listing.lines() {
        let line = line.trim();
        if let Some(id) = line.strip_prefix("Job Id:") {
            current = Some(id.trim());
        } else if let Some(job_name) = line.strip_prefix("Job_Name =") {
            if let Some(id) = current.take() {
                if job_name.trim() == name {
                    ids.push(id.to_string());
                }
            }
        }
    }
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandOutput;
    use crate::testing::ScriptedRunner;

    #[test]
    fn parses_squeue_rows() {
        let table = "Run_Build 100\nRun_Merge 101_[1-500%20]\nRun_Merge 101_7\nRun_Merge2 102\n";
        assert_eq!(parse_name_id_table(table, "Run_Merge"), vec!["101_[1-500%20]", "101_7"]);
        assert!(parse_name_id_table(table, "Missing").is_empty());
    }

    #[test]
    fn counts_array_tasks() {
        assert_eq!(count_tasks("100"), 1);
        assert_eq!(count_tasks("101_7"), 1);
        assert_eq!(count_tasks("101_[1-500%20]"), 500);
        assert_eq!(count_tasks("101_[1-40]"), 40);
        assert_eq!(count_tasks("101_[3,5-9]"), 9);
    }

    #[test]
    fn squeue_resolver_queries_and_filters() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_always("squeue", CommandOutput::ok("A 1\nB 2_[1-3]\nB 3_[1-2]\n"));
        let resolver = SqueueResolver::new(runner.clone());
        assert_eq!(resolver.resolve("B").unwrap(), vec!["2_[1-3]", "3_[1-2]"]);
        assert_eq!(resolver.queued_tasks("me").unwrap(), Some(1 + 3 + 2));
        assert_eq!(runner.calls_to("squeue").len(), 2);
    }

    #[test]
    fn parses_qstat_blocks() {
        let listing = "\
Job Id: 4711.pbs.example.org
    Job_Name = Run_Merge_1
    job_state = Q
Job Id: 4712.pbs.example.org
    Job_Name = Run_Merge_2
Job Id: 4713.pbs.example.org
    Job_Name = Run_Merge_1
";
        assert_eq!(
            parse_qstat_full(listing, "Run_Merge_1"),
            vec!["4711.pbs.example.org", "4713.pbs.example.org"]
        );
    }

    #[test]
    fn qstat_empty_queue_message_is_not_an_error() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_always("qstat", CommandOutput::failed(1, "qstat: no jobs found"));
        let resolver = QstatResolver::new(runner);
        assert!(resolver.resolve("x").unwrap().is_empty());
    }

    #[test]
    fn qstat_failure_is_propagated() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.respond_always(
            "qstat",
            CommandOutput::failed(2, "qstat: cannot connect to server pbs.example.org (errno=111)"),
        );
        let resolver = QstatResolver::new(runner);
        let err = resolver.resolve("x").unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed { status: 2, .. }));
    }
}
