pub mod init;
pub mod merge;
pub mod submit;

use std::path::PathBuf;

use anyhow::Context;
use batchgrid_core::{BatchConfig, Dependency};
use batchgrid_engine::FinishReport;

/// Config location and the global flags that override it.
pub struct Overrides {
    pub config: PathBuf,
    pub engine: Option<String>,
    pub base_dir: Option<String>,
}

impl Overrides {
    /// Read the config file (defaults when absent), then apply the
    /// environment and finally the command line.
    pub fn load(&self) -> anyhow::Result<BatchConfig> {
        let mut config = if self.config.exists() {
            BatchConfig::from_file(&self.config)
                .with_context(|| format!("loading {}", self.config.display()))?
        } else {
            tracing::warn!(path = %self.config.display(), "no config file, using defaults");
            BatchConfig::default()
        };
        config.apply_env()?;
        config.apply_overrides(self.base_dir.as_deref(), self.engine.as_deref())?;
        Ok(config)
    }
}

/// `NAME` holds on the whole job, `NAME:1,3` on some of its tasks.
pub fn parse_hold(value: &str) -> anyhow::Result<Dependency> {
    let Some((name, tasks)) = value.split_once(':') else {
        return Ok(Dependency::whole(value));
    };
    let ids = tasks
        .split(',')
        .map(|t| t.trim().parse::<u32>().with_context(|| format!("bad task index in {value}")))
        .collect::<anyhow::Result<Vec<u32>>>()?;
    Ok(Dependency::tasks(name, ids))
}

pub fn print_report(report: &FinishReport, format: &str) -> anyhow::Result<()> {
    match format {
        "json" => println!("{}", serde_json::to_string_pretty(report)?),
        _ => match report {
            FinishReport::Submitted { jobs, tasks } => {
                println!("✓ Submitted {jobs} jobs ({tasks} tasks)")
            }
            FinishReport::Executed(summary) => println!(
                "✓ Ran {} of {} units: {} succeeded, {} failed, {} excluded",
                summary.started(),
                summary.declared,
                summary.succeeded,
                summary.failed,
                summary.excluded
            ),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hold_without_tasks_is_whole_job() {
        assert_eq!(parse_hold("Run_Sim").unwrap(), Dependency::whole("Run_Sim"));
    }

    #[test]
    fn hold_with_tasks_is_subset() {
        assert_eq!(
            parse_hold("Run_Sim:1, 3").unwrap(),
            Dependency::tasks("Run_Sim", [1, 3])
        );
        assert!(parse_hold("Run_Sim:x").is_err());
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let overrides = Overrides {
            config: dir.path().join("batchgrid.toml"),
            engine: Some("local".into()),
            base_dir: Some(dir.path().display().to_string()),
        };
        let config = overrides.load().unwrap();
        assert_eq!(config.engine.kind, batchgrid_core::EngineKind::Local);
        assert_eq!(config.engine.base_dir, dir.path());
    }
}
