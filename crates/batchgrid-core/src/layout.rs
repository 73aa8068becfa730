//! Per-run directory layout.
//!
//! ```text
//! <base>
//!   ├── logs/<date>/<job>
//!   ├── tmp/<date>/<job>
//!   │     ├── build
//!   │     └── config
//!   └── output/<date>/<job>
//! ```
//!
//! Every backend writes into this tree so that clean-up jobs can remove
//! `tmp` wholesale once its consumers are done.

use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = ".job.lck";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    base_dir: PathBuf,
    date: String,
    job_name: String,
}

impl RunLayout {
    /// Layout for a run started today (local time).
    pub fn today(base_dir: &Path, job_name: &str) -> Self {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        Self::dated(base_dir, job_name, &date)
    }

    pub fn dated(base_dir: &Path, job_name: &str, date: &str) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
            date: date.to_string(),
            job_name: job_name.to_string(),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn date(&self) -> &str {
        &self.date
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs").join(&self.date).join(&self.job_name)
    }

    /// Job configuration files, temporary builds and intermediate outputs.
    pub fn tmp_dir(&self) -> PathBuf {
        self.base_dir.join("tmp").join(&self.date).join(&self.job_name)
    }

    /// Copy of the source area compiled by the build job.
    pub fn build_dir(&self) -> PathBuf {
        self.tmp_dir().join("build")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.tmp_dir().join("config")
    }

    pub fn out_dir(&self) -> PathBuf {
        self.base_dir.join("output").join(&self.date).join(&self.job_name)
    }

    /// Marks a run whose jobs have been submitted.
    pub fn submit_lock(&self) -> PathBuf {
        self.tmp_dir().join(LOCK_FILE)
    }

    /// Marks a run whose output has been produced.
    pub fn output_lock(&self) -> PathBuf {
        self.out_dir().join(LOCK_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directories_are_namespaced_by_date_and_job() {
        let layout = RunLayout::dated(Path::new("/data"), "Ntuples", "2026-10-19");
        assert_eq!(layout.log_dir(), PathBuf::from("/data/logs/2026-10-19/Ntuples"));
        assert_eq!(layout.tmp_dir(), PathBuf::from("/data/tmp/2026-10-19/Ntuples"));
        assert_eq!(layout.build_dir(), PathBuf::from("/data/tmp/2026-10-19/Ntuples/build"));
        assert_eq!(layout.config_dir(), PathBuf::from("/data/tmp/2026-10-19/Ntuples/config"));
        assert_eq!(layout.out_dir(), PathBuf::from("/data/output/2026-10-19/Ntuples"));
        assert!(layout.submit_lock().starts_with(layout.tmp_dir()));
        assert!(layout.output_lock().starts_with(layout.out_dir()));
    }

    #[test]
    fn today_uses_iso_date() {
        let layout = RunLayout::today(Path::new("/data"), "x");
        assert_eq!(layout.date().len(), 10);
        assert_eq!(layout.date().matches('-').count(), 2);
    }
}
