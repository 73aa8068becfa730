//! The set of jobs declared during one orchestration run.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use crate::types::Dependency;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("the job {0} has already been declared; job names must be unique")]
pub struct DuplicateJob(pub String);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredJob {
    pub name: String,
    pub array_size: Option<u32>,
    pub dependencies: Vec<Dependency>,
}

/// Jobs and dependencies accumulated during a run, in declaration order.
#[derive(Debug, Default, Clone)]
pub struct JobGraph {
    jobs: Vec<DeclaredJob>,
    index: HashMap<String, usize>,
}

impl JobGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job. A name that already exists is rejected and the graph
    /// is left untouched.
    pub fn declare(
        &mut self,
        name: &str,
        array_size: Option<u32>,
        dependencies: Vec<Dependency>,
    ) -> Result<(), DuplicateJob> {
        if self.index.contains_key(name) {
            return Err(DuplicateJob(name.to_string()));
        }
        self.index.insert(name.to_string(), self.jobs.len());
        self.jobs.push(DeclaredJob {
            name: name.to_string(),
            array_size,
            dependencies,
        });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&DeclaredJob> {
        self.index.get(name).map(|&i| &self.jobs[i])
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &DeclaredJob> {
        self.jobs.iter()
    }

    /// Total schedulable units (array tasks count individually).
    pub fn unit_count(&self) -> usize {
        self.jobs
            .iter()
            .map(|j| j.array_size.unwrap_or(1) as usize)
            .sum()
    }

    /// Kahn's algorithm with declaration order as tie-break. Dependencies on
    /// names outside the graph are ignored. Returns `None` on a cycle.
    pub fn topological_order(&self) -> Option<Vec<String>> {
        let mut indegree = vec![0usize; self.jobs.len()];
        let mut children: Vec<Vec<usize>> = vec![Vec::new(); self.jobs.len()];
        for (i, job) in self.jobs.iter().enumerate() {
            let parents: HashSet<usize> = job
                .dependencies
                .iter()
                .filter_map(|d| self.index.get(d.name()).copied())
                .filter(|&p| p != i)
                .collect();
            indegree[i] = parents.len();
            for p in parents {
                children[p].push(i);
            }
        }

        let mut order = Vec::with_capacity(self.jobs.len());
        let mut ready: Vec<usize> = (0..self.jobs.len()).filter(|&i| indegree[i] == 0).collect();
        while !ready.is_empty() {
            ready.sort_unstable_by(|a, b| b.cmp(a));
            let Some(next) = ready.pop() else { break };
            order.push(self.jobs[next].name.clone());
            for &c in &children[next] {
                indegree[c] -= 1;
                if indegree[c] == 0 {
                    ready.push(c);
                }
            }
        }
        (order.len() == self.jobs.len()).then_some(order)
    }

    /// Whether `order` runs every job after all of the jobs it depends on.
    pub fn is_valid_order(&self, order: &[String]) -> bool {
        let position: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        self.jobs.iter().all(|job| {
            let Some(&at) = position.get(job.name.as_str()) else {
                return false;
            };
            job.dependencies
                .iter()
                .filter(|d| self.contains(d.name()))
                .all(|d| position.get(d.name()).is_some_and(|&p| p < at))
        })
    }
}
