//! batchgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable overriding `[engine].base_dir`.
pub const BASE_DIR_ENV: &str = "BATCHGRID_BASE_DIR";
/// Environment variable overriding `[engine].kind`.
pub const ENGINE_ENV: &str = "BATCHGRID_ENGINE";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),
    #[error("unknown engine kind: {0} (expected slurm, htcondor, sge or local)")]
    UnknownEngine(String),
    #[error("invalid run time: {0}")]
    InvalidRunTime(String),
}

/// The scheduler a run is emitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Array + dependency-string scheduler (`sbatch`).
    Slurm,
    /// DAG scheduler (`condor_submit_dag`).
    Htcondor,
    /// One-job-at-a-time scheduler (`qsub`), no native arrays.
    Sge,
    /// In-process thread pool.
    Local,
}

impl EngineKind {
    pub fn label(&self) -> &'static str {
        match self {
            EngineKind::Slurm => "slurm",
            EngineKind::Htcondor => "htcondor",
            EngineKind::Sge => "sge",
            EngineKind::Local => "local",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EngineKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "slurm" => Ok(EngineKind::Slurm),
            "htcondor" | "condor" => Ok(EngineKind::Htcondor),
            "sge" | "pbs" => Ok(EngineKind::Sge),
            "local" => Ok(EngineKind::Local),
            _ => Err(ConfigError::UnknownEngine(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub engine: EngineConfig,
    pub build: BuildConfig,
    pub merge: MergeConfig,
    pub container: ContainerConfig,
    pub environment: EnvironmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub kind: EngineKind,
    pub base_dir: PathBuf,
    /// Arrays larger than this are split into consecutive batches.
    pub max_array_size: u32,
    /// Per-array throttle on cluster backends, concurrency ceiling locally.
    /// Non-positive means unlimited.
    pub max_current_jobs: i64,
    pub mail_user: String,
    pub accounting_group: String,
    pub exclude_nodes: Vec<String>,
    pub scripts_dir: PathBuf,
    /// Reject dependencies that cannot be resolved instead of skipping them.
    pub strict_dependencies: bool,
    pub poll_interval_ms: u64,
    pub report_every: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kind: EngineKind::Local,
            base_dir: PathBuf::from("."),
            max_array_size: 7500,
            max_current_jobs: 400,
            mail_user: String::new(),
            accounting_group: String::new(),
            exclude_nodes: Vec::new(),
            scripts_dir: PathBuf::from("scripts"),
            strict_dependencies: false,
            poll_interval_ms: 1000,
            report_every: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Recompile the source area on the cluster before anything else runs.
    pub enabled: bool,
    pub run_time: String,
    pub memory_mb: u32,
    pub cores: u32,
    /// Job names the build job waits for.
    pub hold: Vec<String>,
    pub source_area: PathBuf,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            run_time: "01:59:59".to_string(),
            memory_mb: 8000,
            cores: 2,
            hold: Vec::new(),
            source_area: PathBuf::from("."),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    pub run_time: String,
    pub memory_mb: u32,
    pub files_per_job: usize,
    pub extension: String,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            run_time: "01:59:59".to_string(),
            memory_mb: 500,
            files_per_job: 10,
            extension: "root".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub enabled: bool,
    pub image: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Variables copied from the submitting shell into every job.
    pub forward: Vec<String>,
}

impl BatchConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Apply `BATCHGRID_BASE_DIR` / `BATCHGRID_ENGINE` from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(
            std::env::var(BASE_DIR_ENV).ok().as_deref(),
            std::env::var(ENGINE_ENV).ok().as_deref(),
        )
    }

    pub fn apply_overrides(
        &mut self,
        base_dir: Option<&str>,
        engine: Option<&str>,
    ) -> Result<(), ConfigError> {
        if let Some(dir) = base_dir.filter(|d| !d.is_empty()) {
            tracing::debug!(base_dir = dir, "base dir overridden");
            self.engine.base_dir = PathBuf::from(dir);
        }
        if let Some(kind) = engine.filter(|k| !k.is_empty()) {
            self.engine.kind = kind.parse()?;
            tracing::debug!(engine = %self.engine.kind, "engine overridden");
        }
        Ok(())
    }

    /// Scaffold a config for the given engine and base directory.
    pub fn scaffold(kind: EngineKind, base_dir: &Path) -> Self {
        let mut config = BatchConfig::default();
        config.engine.kind = kind;
        config.engine.base_dir = base_dir.to_path_buf();
        if kind == EngineKind::Local {
            config.engine.max_current_jobs = 4;
            config.build.enabled = false;
        }
        config
    }

    /// Concurrency ceiling of the local backend, clamped into `1..=16`.
    pub fn local_concurrency(&self) -> usize {
        self.engine.max_current_jobs.clamp(1, 16) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let config = BatchConfig::from_toml_str(
            r#"
[engine]
kind = "slurm"
base_dir = "/ptmp/me/Cluster"
"#,
        )
        .unwrap();
        assert_eq!(config.engine.kind, EngineKind::Slurm);
        assert_eq!(config.engine.max_array_size, 7500);
        assert_eq!(config.merge.files_per_job, 10);
        assert!(config.build.enabled);
    }

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = BatchConfig::from_toml_str("").unwrap();
        assert_eq!(config.engine.kind, EngineKind::Local);
        assert_eq!(config.merge.extension, "root");
    }

    #[test]
    fn test_scaffold_round_trips() {
        let config = BatchConfig::scaffold(EngineKind::Htcondor, Path::new("/data/me"));
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("htcondor"));
        let parsed = BatchConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(parsed.engine.base_dir, PathBuf::from("/data/me"));
    }

    #[test]
    fn test_overrides() {
        let mut config = BatchConfig::default();
        config
            .apply_overrides(Some("/scratch/run"), Some("SGE"))
            .unwrap();
        assert_eq!(config.engine.kind, EngineKind::Sge);
        assert_eq!(config.engine.base_dir, PathBuf::from("/scratch/run"));

        let err = config.apply_overrides(None, Some("torque")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownEngine(_)));
    }

    #[test]
    fn test_local_concurrency_is_clamped() {
        let mut config = BatchConfig::default();
        config.engine.max_current_jobs = -1;
        assert_eq!(config.local_concurrency(), 1);
        config.engine.max_current_jobs = 400;
        assert_eq!(config.local_concurrency(), 16);
        config.engine.max_current_jobs = 3;
        assert_eq!(config.local_concurrency(), 3);
    }
}
