//! Hierarchical merge trees.
//!
//! A merge request over N files becomes a chain of array jobs. Each layer
//! merges batches of `files_per_job` inputs into one output per batch; when
//! a layer still produces more outputs than the requested final split, its
//! outputs feed a child layer that batches half as many files per task. The
//! last layer writes into the run's output directory.
//!
//! ```text
//! 97 files, 10 per job, split 1
//!   MergeLvl_2-out   10 tasks → 10 tmp files
//!   MergeLvl_1-out    2 tasks →  2 tmp files
//!   merge-out         1 task  →  out/out.root
//! ```
//!
//! Planning is pure (see [`MergeNode::plan`]); nothing touches the disk until
//! [`MergeNode::submit`].

use std::fs;
use std::path::{Path, PathBuf};

use batchgrid_core::fsutil::{create_directory, random_id, write_list};
use batchgrid_core::{Dependency, JobSpec, RunLayout, RunTime};
use rand::Rng;
use rand::distr::Alphanumeric;
use rand::seq::SliceRandom;
use serde::Serialize;
use tracing::info;

use crate::catalog::FileEntry;
use crate::engine::Engine;
use crate::error::{EngineError, EngineResult};

pub const MERGE_SCRIPT: &str = "Merge.sh";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Stem of the final file(s).
    pub out_name: String,
    pub files: Vec<String>,
    pub files_per_job: usize,
    pub hold: Vec<Dependency>,
    /// Upper bound on the number of final outputs.
    pub final_split: usize,
    pub shuffle: bool,
}

impl MergeRequest {
    pub fn new(out_name: impl Into<String>, files: Vec<String>) -> Self {
        Self {
            out_name: out_name.into(),
            files,
            files_per_job: 10,
            hold: Vec::new(),
            final_split: 1,
            shuffle: true,
        }
    }

    pub fn files_per_job(mut self, n: usize) -> Self {
        self.files_per_job = n;
        self
    }

    pub fn hold(mut self, hold: Vec<Dependency>) -> Self {
        self.hold = hold;
        self
    }

    pub fn final_split(mut self, n: usize) -> Self {
        self.final_split = n;
        self
    }

    pub fn shuffle(mut self, shuffle: bool) -> Self {
        self.shuffle = shuffle;
        self
    }
}

/// Where layers put their outputs.
#[derive(Debug, Clone)]
pub struct MergeDirs {
    pub tmp_dir: PathBuf,
    pub out_dir: PathBuf,
    pub extension: String,
}

impl MergeDirs {
    pub fn for_layout(layout: &RunLayout, extension: &str) -> Self {
        Self {
            tmp_dir: layout.tmp_dir(),
            out_dir: layout.out_dir(),
            extension: extension.to_string(),
        }
    }
}

/// One layer of a merge tree, owning the layers below it.
#[derive(Debug, Clone)]
pub struct MergeNode {
    out_name: String,
    files_per_job: usize,
    batches: Vec<Vec<String>>,
    outputs: Vec<PathBuf>,
    hold: Vec<Dependency>,
    child: Option<Box<MergeNode>>,
    submitted: bool,
}

/// Plan view of one layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerSummary {
    pub job_name: String,
    pub tasks: usize,
    pub files_per_job: usize,
    pub outputs: Vec<PathBuf>,
}

fn random_name(rng: &mut impl Rng, len: usize) -> String {
    (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
}

impl MergeNode {
    /// Plan the full tree for `request`.
    ///
    /// `files_per_job` below 2 is raised to 2 and `final_split` below 1 is
    /// raised to 1, so every layer shrinks the file count and the tree
    /// terminates.
    pub fn plan(request: &MergeRequest, dirs: &MergeDirs, rng: &mut impl Rng) -> EngineResult<Self> {
        if request.files.is_empty() {
            return Err(EngineError::NothingToMerge(request.out_name.clone()));
        }
        let per_job = request.files_per_job.max(2);
        let final_split = request.final_split.max(1);

        let mut files = request.files.clone();
        if request.shuffle {
            files.shuffle(rng);
        }
        let batches: Vec<Vec<String>> = files.chunks(per_job).map(<[String]>::to_vec).collect();

        let ext = &dirs.extension;
        let (outputs, child) = if batches.len() > final_split {
            let outputs: Vec<PathBuf> = batches
                .iter()
                .map(|_| dirs.tmp_dir.join(format!("{}.{ext}", random_name(rng, 50))))
                .collect();
            let child_request = MergeRequest {
                out_name: request.out_name.clone(),
                files: outputs.iter().map(|p| p.display().to_string()).collect(),
                files_per_job: per_job / 2,
                hold: Vec::new(),
                final_split,
                shuffle: request.shuffle,
            };
            let child = Self::plan(&child_request, dirs, rng)?;
            (outputs, Some(Box::new(child)))
        } else if batches.len() == 1 {
            (vec![dirs.out_dir.join(format!("{}.{ext}", request.out_name))], None)
        } else {
            let outputs = (1..=batches.len())
                .map(|i| dirs.out_dir.join(format!("{}_{i}.{ext}", request.out_name)))
                .collect();
            (outputs, None)
        };

        Ok(Self {
            out_name: request.out_name.clone(),
            files_per_job: per_job,
            batches,
            outputs,
            hold: request.hold.clone(),
            child,
            submitted: false,
        })
    }

    pub fn out_name(&self) -> &str {
        &self.out_name
    }

    pub fn batches(&self) -> &[Vec<String>] {
        &self.batches
    }

    pub fn outputs(&self) -> &[PathBuf] {
        &self.outputs
    }

    pub fn child(&self) -> Option<&MergeNode> {
        self.child.as_deref()
    }

    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    /// Replace what the first layer waits on.
    pub fn set_hold(&mut self, hold: Vec<Dependency>) {
        self.hold = hold;
    }

    /// Number of layers below this one.
    pub fn childs_in_chain(&self) -> usize {
        self.child.as_ref().map_or(0, |c| 1 + c.childs_in_chain())
    }

    pub fn layers(&self) -> usize {
        1 + self.childs_in_chain()
    }

    /// Sub-job name of this layer.
    pub fn job_name(&self) -> String {
        if self.child.is_some() {
            format!("MergeLvl_{}-{}", self.childs_in_chain(), self.out_name)
        } else {
            format!("merge-{}", self.out_name)
        }
    }

    /// Sub-job name of the last layer; finishing it means the tree is done.
    pub fn final_job_name(&self) -> String {
        self.terminal().job_name()
    }

    pub fn terminal(&self) -> &MergeNode {
        match &self.child {
            Some(child) => child.terminal(),
            None => self,
        }
    }

    /// Final output files of the tree.
    pub fn final_outputs(&self) -> &[PathBuf] {
        self.terminal().outputs()
    }

    pub fn summary(&self) -> Vec<LayerSummary> {
        let mut layers = vec![LayerSummary {
            job_name: self.job_name(),
            tasks: self.batches.len(),
            files_per_job: self.files_per_job,
            outputs: self.outputs.clone(),
        }];
        if let Some(child) = &self.child {
            layers.extend(child.summary());
        }
        layers
    }

    /// Submit this layer, then its child waiting on it, then a clean job
    /// removing this layer's intermediate outputs once the child is done.
    pub fn submit(&mut self, engine: &mut Engine) -> EngineResult<()> {
        let hold = self.hold.clone();
        self.submit_layer(engine, hold)
    }

    fn submit_layer(&mut self, engine: &mut Engine, hold: Vec<Dependency>) -> EngineResult<()> {
        let job_name = self.job_name();
        if self.submitted {
            return Err(EngineError::MergeAlreadySubmitted(job_name));
        }

        let config_dir = engine.layout().config_dir();
        fs::create_dir_all(&config_dir)?;
        let mut lists = Vec::with_capacity(self.batches.len());
        for batch in &self.batches {
            lists.push(write_list(batch, &config_dir.join(format!("{}.txt", random_id(85))))?);
        }
        let job_array = write_list(
            lists.iter().map(|p| p.display().to_string()),
            &config_dir.join(format!("{}.txt", random_id(31))),
        )?;
        let out_list = write_list(
            self.outputs.iter().map(|p| p.display().to_string()),
            &config_dir.join(format!("{}.txt", random_id(30))),
        )?;
        if self.child.is_none() {
            create_directory(&engine.layout().out_dir(), false)?;
        }

        let merge = &engine.config().merge;
        let spec = JobSpec::new(job_name.clone(), Path::new(MERGE_SCRIPT))
            .memory(merge.memory_mb)
            .run_time(RunTime::parse(&merge.run_time)?)
            .env("JobConfigList", job_array.display())
            .env("OutFileList", out_list.display())
            .array(self.batches.len() as u32);
        info!(layer = %job_name, tasks = self.batches.len(), "submitting merge layer");
        engine.submit_array(spec, &hold)?;
        self.submitted = true;

        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let wait_on_layer = vec![Dependency::whole(engine.subjob_name(&job_name))];
        child.submit_layer(engine, wait_on_layer)?;
        let child_name = engine.subjob_name(&child.job_name());
        engine.submit_clean_job(&[Dependency::whole(child_name)], &self.outputs, &job_name)?;
        Ok(())
    }
}

/// Group files so each group totals roughly `max_bytes`.
///
/// Files are taken largest first. A group accepts a file while its running
/// total stays within `max_bytes` plus the spread of the file sizes; a file
/// larger than the bound forms a group of its own.
pub fn group_by_size(mut entries: Vec<FileEntry>, max_bytes: u64) -> Vec<Vec<FileEntry>> {
    if entries.is_empty() {
        return Vec::new();
    }
    entries.sort_by(|a, b| b.size.cmp(&a.size));
    let n = entries.len() as f64;
    let mean = entries.iter().map(|e| e.size as f64).sum::<f64>() / n;
    let spread = entries
        .iter()
        .map(|e| (e.size as f64 - mean).powi(2))
        .sum::<f64>()
        .sqrt()
        / n;
    let bound = max_bytes as f64 + spread;

    let mut groups = Vec::new();
    let mut remaining = entries;
    while !remaining.is_empty() {
        let mut total: u64 = 0;
        let mut group = Vec::new();
        let mut rest = Vec::new();
        for entry in remaining {
            if total <= max_bytes && (group.is_empty() || (total + entry.size) as f64 <= bound) {
                total += entry.size;
                group.push(entry);
            } else {
                rest.push(entry);
            }
        }
        groups.push(group);
        remaining = rest;
    }
    groups
}

/// Merges a dataset into files of bounded size and moves them into
/// `<out>/<name>` once every group is done.
#[derive(Debug)]
pub struct SizeBalancedMerge {
    name: String,
    groups: Vec<MergeNode>,
    destination: PathBuf,
}

impl SizeBalancedMerge {
    pub fn plan(
        engine: &Engine,
        name: &str,
        entries: Vec<FileEntry>,
        max_bytes: u64,
        files_per_job: usize,
        hold: Vec<Dependency>,
    ) -> EngineResult<Self> {
        let groups = group_by_size(entries, max_bytes);
        if groups.is_empty() {
            return Err(EngineError::NothingToMerge(name.to_string()));
        }
        let mut nodes = Vec::with_capacity(groups.len());
        for (i, group) in groups.into_iter().enumerate() {
            let request = MergeRequest::new(
                format!("{name}_{i}"),
                group.into_iter().map(|e| e.path).collect(),
            )
            .files_per_job(files_per_job)
            .hold(hold.clone());
            nodes.push(engine.create_merge_interface(&request)?);
        }
        info!(dataset = name, files = nodes.len(), "dataset will be merged into size-balanced files");
        Ok(Self {
            name: name.to_string(),
            groups: nodes,
            destination: engine.layout().out_dir().join(name),
        })
    }

    pub fn groups(&self) -> &[MergeNode] {
        &self.groups
    }

    pub fn set_hold(&mut self, hold: Vec<Dependency>) {
        for node in &mut self.groups {
            node.set_hold(hold.clone());
        }
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Sub-job name of the final move job.
    pub fn job_name(&self) -> String {
        format!("Move-{}", self.name)
    }

    pub fn submit(&mut self, engine: &mut Engine) -> EngineResult<()> {
        create_directory(&self.destination, true)?;
        let mut finals = Vec::with_capacity(self.groups.len());
        let mut outputs = Vec::new();
        for node in &mut self.groups {
            node.submit(engine)?;
            finals.push(Dependency::whole(engine.subjob_name(&node.final_job_name())));
            outputs.extend(node.final_outputs().iter().cloned());
        }
        engine.submit_move_job(
            &finals,
            crate::engine::Transfer::Files(outputs),
            &self.destination,
            &self.name,
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn dirs() -> MergeDirs {
        MergeDirs {
            tmp_dir: PathBuf::from("/base/tmp"),
            out_dir: PathBuf::from("/base/out"),
            extension: "root".into(),
        }
    }

    fn files(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("/data/f{i}.root")).collect()
    }

    fn plan(request: MergeRequest) -> MergeNode {
        MergeNode::plan(&request, &dirs(), &mut StdRng::seed_from_u64(7)).unwrap()
    }

    #[test]
    fn ninety_seven_files_take_three_layers() {
        let tree = plan(MergeRequest::new("out", files(97)).files_per_job(10));
        let sizes: Vec<usize> = tree.summary().iter().map(|l| l.tasks).collect();
        assert_eq!(sizes, vec![10, 2, 1]);
        assert_eq!(tree.layers(), 3);
        assert_eq!(tree.job_name(), "MergeLvl_2-out");
        assert_eq!(tree.child().unwrap().job_name(), "MergeLvl_1-out");
        assert_eq!(tree.final_job_name(), "merge-out");
        assert_eq!(tree.final_outputs(), &[PathBuf::from("/base/out/out.root")]);
        assert_eq!(tree.child().unwrap().batches()[0].len(), 5);
    }

    #[test]
    fn every_input_lands_in_exactly_one_batch() {
        let tree = plan(MergeRequest::new("out", files(23)).files_per_job(4));
        let mut seen: Vec<String> = tree.batches().iter().flatten().cloned().collect();
        seen.sort();
        let mut expected = files(23);
        expected.sort();
        assert_eq!(seen, expected);
        assert!(tree.batches().iter().all(|b| b.len() <= 4));
        assert!(tree.outputs().iter().all(|p| p.starts_with("/base/tmp")));
    }

    #[test]
    fn final_split_keeps_numbered_outputs() {
        let tree = plan(MergeRequest::new("out", files(30)).files_per_job(10).final_split(3));
        assert_eq!(tree.layers(), 1);
        assert_eq!(
            tree.outputs(),
            &[
                PathBuf::from("/base/out/out_1.root"),
                PathBuf::from("/base/out/out_2.root"),
                PathBuf::from("/base/out/out_3.root"),
            ]
        );
    }

    #[test]
    fn tiny_batches_are_raised_to_two() {
        let tree = plan(MergeRequest::new("out", files(4)).files_per_job(1));
        assert_eq!(tree.summary()[0].files_per_job, 2);
        assert_eq!(tree.layers(), 2);
        assert_eq!(tree.child().unwrap().summary()[0].files_per_job, 2);
    }

    #[test]
    fn shuffling_is_optional_and_seeded() {
        let ordered = plan(MergeRequest::new("out", files(6)).files_per_job(6).shuffle(false));
        assert_eq!(ordered.batches()[0], files(6));
        let a = plan(MergeRequest::new("out", files(6)).files_per_job(6));
        let b = plan(MergeRequest::new("out", files(6)).files_per_job(6));
        assert_eq!(a.batches(), b.batches());
    }

    #[test]
    fn empty_request_is_rejected() {
        let err = MergeNode::plan(
            &MergeRequest::new("out", vec![]),
            &dirs(),
            &mut StdRng::seed_from_u64(1),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::NothingToMerge(name) if name == "out"));
    }

    fn entry(path: &str, size: u64) -> FileEntry {
        FileEntry {
            path: path.into(),
            size,
        }
    }

    #[test]
    fn size_groups_stay_near_the_bound() {
        let groups = group_by_size(
            vec![
                entry("a", 6),
                entry("b", 5),
                entry("c", 4),
                entry("d", 3),
                entry("e", 2),
            ],
            10,
        );
        let names: Vec<Vec<&str>> = groups
            .iter()
            .map(|g| g.iter().map(|e| e.path.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["a", "c"], vec!["b", "d", "e"]]);
    }

    #[test]
    fn oversized_file_forms_its_own_group() {
        let groups = group_by_size(vec![entry("big", 100), entry("small", 1)], 10);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0].path, "big");
    }
}
