//! Dataset listings and grid credentials.

use std::path::{Path, PathBuf};
use std::time::Duration;

use batchgrid_core::fsutil::has_extension;
use serde::Serialize;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::command::{CommandLine, CommandRunner, run_checked};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileEntry {
    pub path: String,
    /// Size in bytes.
    pub size: u64,
}

/// Lists the files of a dataset.
pub trait FileCatalog {
    fn list_files(&self, dataset: &str) -> EngineResult<Vec<FileEntry>>;
}

/// Datasets stored as directories below a common root.
#[derive(Debug, Clone)]
pub struct LocalDirCatalog {
    root: PathBuf,
    extension: String,
}

impl LocalDirCatalog {
    pub fn new(root: &Path, extension: &str) -> Self {
        Self {
            root: root.to_path_buf(),
            extension: extension.to_string(),
        }
    }

    /// Directory of `dataset`, ignoring a `scope:` prefix.
    pub fn dataset_dir(&self, dataset: &str) -> PathBuf {
        let name = dataset.split_once(':').map_or(dataset, |(_, n)| n);
        self.root.join(name)
    }
}

impl FileCatalog for LocalDirCatalog {
    fn list_files(&self, dataset: &str) -> EngineResult<Vec<FileEntry>> {
        let dir = self.dataset_dir(dataset);
        let mut entries = Vec::new();
        for entry in WalkDir::new(&dir).follow_links(true) {
            let entry = entry.map_err(|e| {
                std::io::Error::other(format!("cannot list {}: {e}", dir.display()))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            if !has_extension(&name, &self.extension) {
                continue;
            }
            entries.push(FileEntry {
                path: entry.path().display().to_string(),
                size: entry.metadata().map(|m| m.len()).unwrap_or(0),
            });
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(dataset, files = entries.len(), "listed dataset");
        Ok(entries)
    }
}

/// Grid credentials that expire.
pub trait CredentialCheck {
    fn time_left(&self) -> EngineResult<Duration>;
    fn renew(&self) -> EngineResult<()>;
}

/// VOMS proxy via `voms-proxy-info` / `voms-proxy-init`.
pub struct VomsProxyCheck<'a> {
    runner: &'a dyn CommandRunner,
    vo: String,
}

impl<'a> VomsProxyCheck<'a> {
    pub fn new(runner: &'a dyn CommandRunner, vo: &str) -> Self {
        Self {
            runner,
            vo: vo.to_string(),
        }
    }
}

impl CredentialCheck for VomsProxyCheck<'_> {
    fn time_left(&self) -> EngineResult<Duration> {
        let output = self
            .runner
            .run(&CommandLine::new("voms-proxy-info").arg("--timeleft"))?;
        // Anything unparsable counts as expired.
        let secs = output
            .lines()
            .last()
            .and_then(|l| l.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(Duration::from_secs(secs))
    }

    fn renew(&self) -> EngineResult<()> {
        info!(vo = %self.vo, "no valid VOMS proxy, creating one");
        run_checked(
            self.runner,
            &CommandLine::new("voms-proxy-init").args(["--voms", self.vo.as_str()]),
        )?;
        Ok(())
    }
}

/// Make sure credentials are valid, renewing them once if needed.
pub fn require_credentials(check: &dyn CredentialCheck) -> EngineResult<Duration> {
    let left = check.time_left()?;
    if !left.is_zero() {
        return Ok(left);
    }
    check.renew()?;
    let left = check.time_left()?;
    if left.is_zero() {
        warn!("credentials are still not valid after renewal");
        return Err(EngineError::CredentialsExpired(
            "no time left after renewal".to_string(),
        ));
    }
    Ok(left)
}
