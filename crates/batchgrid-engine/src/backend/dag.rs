//! HTCondor DAGMan backend.
//!
//! Submissions only write per-job `.sub` descriptors and record edges; the
//! whole graph is rendered into a single `.dag` file and handed to
//! `condor_submit_dag` at finish. Array tasks become individual DAG nodes,
//! so node names use short letter abbreviations (`A`, `B`, … `Z`, `AA`, …)
//! instead of job names to keep large DAG files manageable.

use std::collections::{BTreeMap, HashMap};

use batchgrid_core::fsutil::{create_directory, random_id, write_list};
use batchgrid_core::{Dependency, EngineKind};
use tracing::{debug, info, warn};

use super::{Backend, FinishReport, Submission, unresolved};
use crate::command::{CommandLine, run_checked};
use crate::error::{EngineError, EngineResult};
use crate::workspace::Workspace;

/// Which parent nodes gate which child nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Selector {
    /// Every parent node gates every child node.
    Whole,
    /// Parent task *i* gates child task *i*.
    OneToOne,
    /// The listed parent tasks gate every child node.
    Tasks(Vec<u32>),
}

#[derive(Debug, Clone)]
struct Edge {
    child: usize,
    selector: Selector,
}

#[derive(Debug)]
struct CondorJob {
    name: String,
    submission_file: String,
    array_size: Option<u32>,
    abbreviation: String,
    children: Vec<Edge>,
}

impl CondorJob {
    fn node(&self, task: u32) -> String {
        format!("{}{task}", self.abbreviation)
    }

    fn nodes(&self) -> Vec<String> {
        match self.array_size {
            None => vec![self.abbreviation.clone()],
            Some(n) => (1..=n).map(|t| self.node(t)).collect(),
        }
    }

    fn config_lines(&self) -> Vec<String> {
        match self.array_size {
            None => vec![format!("JOB {} {}", self.abbreviation, self.submission_file)],
            Some(n) => (1..=n)
                .map(|t| format!("JOB {} {}", self.node(t), self.submission_file))
                .chain((1..=n).map(|t| format!("VARS {} CONDOR_TASK_ID=\"{t}\"", self.node(t))))
                .collect(),
        }
    }
}

/// Bijective base-26 letters: 0 → `A`, 25 → `Z`, 26 → `AA`.
pub fn abbreviation(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index + 1;
    while n > 0 {
        n -= 1;
        letters.push(b'A' + (n % 26) as u8);
        n /= 26;
    }
    letters.reverse();
    String::from_utf8_lossy(&letters).into_owned()
}

#[derive(Debug, Default)]
pub struct DagBackend {
    jobs: Vec<CondorJob>,
    index: HashMap<String, usize>,
    tasks: usize,
}

impl DagBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node abbreviation assigned to `name`.
    pub fn abbreviation_of(&self, name: &str) -> Option<&str> {
        self.index
            .get(name)
            .map(|&i| self.jobs[i].abbreviation.as_str())
    }

    fn submission_content(ws: &Workspace, job: &Submission<'_>, executable: &str) -> Vec<String> {
        let engine = &ws.config().engine;
        let spec = job.spec;
        let mut log = ws.layout().log_dir().join(job.log_stem()).display().to_string();
        if spec.is_array() {
            log.push_str("_$(CONDOR_TASK_ID)");
        }

        let mut lines = vec![
            "universe                = vanilla".to_string(),
            format!("executable              = {executable}"),
            format!("output                  = {log}.out"),
            format!("error                   = {log}.err"),
            format!("log                     = {log}.log"),
            "notification            = Error".to_string(),
        ];
        if !engine.mail_user.is_empty() {
            lines.push(format!("notify_user             = {}", engine.mail_user));
        }
        lines.push(format!(
            "request_memory          = {}",
            spec.memory_mb.unwrap_or_default()
        ));
        lines.push("on_exit_remove          = (ExitBySignal == False) && (ExitCode == 0)".to_string());
        lines.push(format!("request_cpus            = {}", spec.cores));
        if let Some(secs) = spec.run_time.as_secs() {
            lines.push(format!("+MaxRuntime             = {secs}"));
            lines.push(format!("+RequestRuntime         = {secs}"));
        }
        if !engine.accounting_group.is_empty() {
            lines.push(format!(
                "+MyProject              = \"{}\"",
                engine.accounting_group
            ));
        }
        if spec.is_array() {
            lines.push("environment = CONDOR_TASK_ID=$(CONDOR_TASK_ID)".to_string());
        }
        lines.push("queue".to_string());
        lines
    }

    /// Edge selector for `dep`, or `None` when no parent task qualifies.
    fn selector(parent: &CondorJob, child_size: Option<u32>, dep: &Dependency) -> Option<Selector> {
        match dep {
            Dependency::WholeJob(_) => Some(Selector::Whole),
            Dependency::OneToOne(_) => match (parent.array_size, child_size) {
                (Some(_), Some(_)) => Some(Selector::OneToOne),
                _ => Some(Selector::Whole),
            },
            Dependency::TaskSubset(..) => match parent.array_size {
                None => Some(Selector::Whole),
                Some(n) => {
                    let ids = dep.parent_tasks(n).unwrap_or_default();
                    (!ids.is_empty()).then_some(Selector::Tasks(ids))
                }
            },
        }
    }

    /// Whether `to` is reachable from `from` without crossing one-to-one edges.
    fn reaches(&self, from: usize, to: usize) -> bool {
        let mut stack = vec![from];
        let mut seen = vec![false; self.jobs.len()];
        while let Some(at) = stack.pop() {
            if at == to {
                return true;
            }
            if std::mem::replace(&mut seen[at], true) {
                continue;
            }
            stack.extend(
                self.jobs[at]
                    .children
                    .iter()
                    .filter(|e| e.selector != Selector::OneToOne)
                    .map(|e| e.child),
            );
        }
        false
    }

    /// Edges of `parent` that are not implied by another path: an edge to
    /// `c` is dropped when a sibling `g` waits on the whole of `parent` and
    /// `c` already waits on `g` transitively.
    fn reduced_children(&self, parent: usize) -> Vec<&Edge> {
        let edges = &self.jobs[parent].children;
        edges
            .iter()
            .filter(|e| {
                !edges.iter().any(|g| {
                    g.child != e.child
                        && g.selector == Selector::Whole
                        && self.reaches(g.child, e.child)
                })
            })
            .collect()
    }

    /// Node-level `(parent, child)` pairs after reduction, in emission order.
    pub fn edges(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        for (p, parent) in self.jobs.iter().enumerate() {
            for edge in self.reduced_children(p) {
                let child = &self.jobs[edge.child];
                match &edge.selector {
                    Selector::Whole => {
                        for pn in parent.nodes() {
                            pairs.extend(child.nodes().into_iter().map(|cn| (pn.clone(), cn)));
                        }
                    }
                    Selector::OneToOne => {
                        let n = parent.array_size.unwrap_or(1).min(child.array_size.unwrap_or(1));
                        pairs.extend((1..=n).map(|t| (parent.node(t), child.node(t))));
                    }
                    Selector::Tasks(ids) => {
                        for &t in ids {
                            pairs.extend(child.nodes().into_iter().map(|cn| (parent.node(t), cn)));
                        }
                    }
                }
            }
        }
        pairs
    }

    /// `PARENT … CHILD …` lines, one per parent node.
    fn dependency_lines(&self) -> Vec<String> {
        let mut by_parent: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (parent, child) in self.edges() {
            let children = by_parent.entry(parent).or_default();
            if !children.contains(&child) {
                children.push(child);
            }
        }
        by_parent
            .into_iter()
            .map(|(parent, children)| format!("PARENT {parent} CHILD {}", children.join(" ")))
            .collect()
    }

    /// Full DAG file content.
    pub fn dag_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.jobs.iter().flat_map(CondorJob::config_lines).collect();
        lines.push(String::new());
        lines.extend(self.dependency_lines());
        lines
    }
}

impl Backend for DagBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Htcondor
    }

    fn submit(&mut self, ws: &Workspace, job: &Submission<'_>) -> EngineResult<()> {
        if self.index.contains_key(&job.name) {
            return Err(EngineError::DuplicateJob(job.name.clone()));
        }

        // Resolve parents before recording anything so a strict failure
        // leaves the DAG untouched.
        let child = self.jobs.len();
        let mut parents = Vec::new();
        for dep in &job.hold {
            let Some(&p) = self.index.get(dep.name()) else {
                unresolved(ws, &job.name, dep)?;
                continue;
            };
            match Self::selector(&self.jobs[p], job.spec.array_size, dep) {
                Some(selector) => parents.push((p, selector)),
                None => warn!(job = %job.name, dependency = %dep, "no parent task in range, skipping"),
            }
        }

        let executable = ws.pack_environment(&job.spec.env, &job.spec.script)?;
        let content = Self::submission_content(ws, job, &executable.display().to_string());
        let file = write_list(
            &content,
            &ws.layout().config_dir().join(format!("{}.sub", random_id(25))),
        )?;

        let abbreviation = abbreviation(child);
        debug!(job = %job.name, node = %abbreviation, "registered DAG node");
        self.index.insert(job.name.clone(), child);
        self.jobs.push(CondorJob {
            name: job.name.clone(),
            submission_file: file.display().to_string(),
            array_size: job.spec.array_size,
            abbreviation,
            children: Vec::new(),
        });
        self.tasks += job.spec.task_count() as usize;

        for (p, selector) in parents {
            let parent = &mut self.jobs[p];
            if parent.children.iter().any(|e| e.child == child) {
                continue;
            }
            parent.children.push(Edge { child, selector });
        }
        Ok(())
    }

    fn finish(&mut self, ws: &Workspace) -> EngineResult<FinishReport> {
        if self.jobs.is_empty() {
            return Err(EngineError::NothingScheduled);
        }

        let dag_dir = ws.layout().log_dir().join("DAG");
        create_directory(&dag_dir, false)?;
        let dag_file = format!("{}.dag", ws.job_name());
        write_list(self.dag_lines(), &dag_dir.join(&dag_file))?;

        let engine = &ws.config().engine;
        let mut cmd = CommandLine::new("condor_submit_dag").arg("-verbose").cwd(&dag_dir);
        if engine.max_current_jobs > 0 {
            cmd = cmd.args(["-maxidle".to_string(), engine.max_current_jobs.to_string()]);
        }
        if !engine.accounting_group.is_empty() {
            cmd = cmd.args([
                "-append".to_string(),
                format!("+MyProject = \"{}\"", engine.accounting_group),
            ]);
        }
        run_checked(ws.runner(), &cmd.arg(dag_file))?;

        let jobs = self.jobs.len();
        let tasks = self.tasks;
        info!(jobs, tasks, names = ?self.jobs.iter().map(|j| j.name.as_str()).collect::<Vec<_>>(), "DAG submitted");
        self.jobs.clear();
        self.index.clear();
        self.tasks = 0;
        Ok(FinishReport::Submitted { jobs, tasks })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::tests::scratch_workspace;
    use batchgrid_core::{JobSpec, RunTime};

    fn submit(
        backend: &mut DagBackend,
        ws: &Workspace,
        name: &str,
        array: Option<u32>,
        hold: Vec<Dependency>,
    ) -> EngineResult<()> {
        let mut spec = JobSpec::new(name, "Job.sh").memory(100);
        if let Some(n) = array {
            spec = spec.array(n);
        }
        backend.submit(
            ws,
            &Submission {
                name: name.to_string(),
                spec: &spec,
                hold,
            },
        )
    }

    fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
        list.iter()
            .map(|(a, b)| (a.to_string(), b.to_string()))
            .collect()
    }

    #[test]
    fn abbreviations_count_in_base_26() {
        assert_eq!(abbreviation(0), "A");
        assert_eq!(abbreviation(25), "Z");
        assert_eq!(abbreviation(26), "AA");
        assert_eq!(abbreviation(27), "AB");
        assert_eq!(abbreviation(26 + 26 * 26), "AAA");
    }

    #[test]
    fn arrays_expand_into_nodes_with_task_vars() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Htcondor);
        let mut dag = DagBackend::new();
        submit(&mut dag, &ws, "P", Some(2), vec![]).unwrap();
        let lines = dag.dag_lines();
        assert!(lines[0].starts_with("JOB A1 "));
        assert!(lines[1].starts_with("JOB A2 "));
        assert_eq!(lines[2], "VARS A1 CONDOR_TASK_ID=\"1\"");
        assert_eq!(lines[3], "VARS A2 CONDOR_TASK_ID=\"2\"");
    }

    #[test]
    fn whole_job_edges_connect_every_node_pair() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Htcondor);
        let mut dag = DagBackend::new();
        submit(&mut dag, &ws, "P", Some(2), vec![]).unwrap();
        submit(&mut dag, &ws, "C", Some(3), vec![Dependency::whole("P")]).unwrap();
        assert_eq!(dag.edges().len(), 6);
        assert!(dag.dag_lines().contains(&"PARENT A1 CHILD B1 B2 B3".to_string()));
    }

    #[test]
    fn one_to_one_pairs_matching_tasks() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Htcondor);
        let mut dag = DagBackend::new();
        submit(&mut dag, &ws, "P", Some(3), vec![]).unwrap();
        submit(&mut dag, &ws, "C", Some(2), vec![Dependency::one_to_one("P")]).unwrap();
        assert_eq!(dag.edges(), pairs(&[("A1", "B1"), ("A2", "B2")]));
    }

    #[test]
    fn subset_only_gates_listed_tasks() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Htcondor);
        let mut dag = DagBackend::new();
        submit(&mut dag, &ws, "P", Some(4), vec![]).unwrap();
        submit(&mut dag, &ws, "C", None, vec![Dependency::tasks("P", [2, 4, 9])]).unwrap();
        assert_eq!(dag.edges(), pairs(&[("A2", "B"), ("A4", "B")]));
    }

    #[test]
    fn task_zero_never_becomes_a_node() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Htcondor);
        let mut dag = DagBackend::new();
        submit(&mut dag, &ws, "P", Some(3), vec![]).unwrap();
        submit(&mut dag, &ws, "C", None, vec![Dependency::TaskSubset("P".into(), vec![0])]).unwrap();
        submit(&mut dag, &ws, "D", None, vec![Dependency::TaskSubset("P".into(), vec![0, 3])]).unwrap();
        assert_eq!(dag.edges(), pairs(&[("A3", "C")]));
    }

    #[test]
    fn transitive_edges_are_reduced() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Htcondor);
        let mut dag = DagBackend::new();
        submit(&mut dag, &ws, "A", None, vec![]).unwrap();
        submit(&mut dag, &ws, "B", None, vec![Dependency::whole("A")]).unwrap();
        submit(
            &mut dag,
            &ws,
            "C",
            None,
            vec![Dependency::whole("A"), Dependency::whole("B")],
        )
        .unwrap();
        assert_eq!(dag.edges(), pairs(&[("A", "B"), ("B", "C")]));
    }

    #[test]
    fn one_to_one_paths_do_not_imply_whole_edges() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Htcondor);
        let mut dag = DagBackend::new();
        submit(&mut dag, &ws, "A", Some(2), vec![]).unwrap();
        submit(&mut dag, &ws, "B", Some(2), vec![Dependency::one_to_one("A")]).unwrap();
        submit(
            &mut dag,
            &ws,
            "C",
            None,
            vec![Dependency::whole("A"), Dependency::whole("B")],
        )
        .unwrap();
        let edges = dag.edges();
        assert!(edges.contains(&("A1".into(), "C".into())));
        assert!(edges.contains(&("B2".into(), "C".into())));
    }

    #[test]
    fn unknown_parent_is_skipped_unless_strict() {
        let (_dir, mut ws, _) = scratch_workspace(EngineKind::Htcondor);
        let mut dag = DagBackend::new();
        submit(&mut dag, &ws, "C", None, vec![Dependency::whole("Ghost")]).unwrap();
        assert!(dag.edges().is_empty());

        let mut config = ws.config().clone();
        config.engine.strict_dependencies = true;
        ws = Workspace::new(config, ws.layout().clone(), ws.runner_handle());
        let err = submit(&mut dag, &ws, "D", None, vec![Dependency::whole("Ghost")]).unwrap_err();
        assert!(matches!(err, EngineError::UnresolvedDependency { .. }));
        assert!(dag.abbreviation_of("D").is_none());
    }

    #[test]
    fn submission_file_carries_resources() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Htcondor);
        let spec = JobSpec::new("Merge", "Job.sh")
            .memory(2000)
            .cores(4)
            .run_time(RunTime::from_secs(90))
            .array(3);
        let sub = Submission {
            name: "Run_Merge".into(),
            spec: &spec,
            hold: vec![],
        };
        let lines = DagBackend::submission_content(&ws, &sub, "/tmp/x.sh");
        assert!(lines.contains(&"request_memory          = 2000".to_string()));
        assert!(lines.contains(&"request_cpus            = 4".to_string()));
        assert!(lines.contains(&"+MaxRuntime             = 90".to_string()));
        assert!(lines.iter().any(|l| l.ends_with("Merge_$(CONDOR_TASK_ID).out")));
        assert_eq!(lines.last().unwrap(), "queue");
    }

    #[test]
    fn finish_writes_dag_and_drains() {
        let (_dir, ws, runner) = scratch_workspace(EngineKind::Htcondor);
        let mut dag = DagBackend::new();
        assert!(matches!(dag.finish(&ws), Err(EngineError::NothingScheduled)));

        submit(&mut dag, &ws, "A", Some(2), vec![]).unwrap();
        let report = dag.finish(&ws).unwrap();
        assert_eq!(report, FinishReport::Submitted { jobs: 1, tasks: 2 });
        assert!(ws.layout().log_dir().join("DAG/Run.dag").exists());

        let calls = runner.calls_to("condor_submit_dag");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args.last().unwrap(), "Run.dag");
        assert!(matches!(dag.finish(&ws), Err(EngineError::NothingScheduled)));
    }
}
