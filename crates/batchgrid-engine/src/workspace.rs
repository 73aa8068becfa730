//! Shared per-run state handed to every backend.
//!
//! Owns the configuration, the directory layout and the command runner, and
//! packs job environments into self-contained wrapper scripts. A wrapper
//! sources a "ship file" of exports and then the job's own script, so every
//! backend can submit a single executable regardless of how it forwards
//! environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use batchgrid_core::fsutil::{make_executable, random_id, shell_quote, write_list};
use batchgrid_core::{BatchConfig, EnvVar, RunLayout, qualified_name};
use tracing::{debug, warn};

use crate::command::CommandRunner;
use crate::error::{EngineError, EngineResult};

pub const CONTAINER_SCRIPT: &str = "Container.sh";

pub struct Workspace {
    config: BatchConfig,
    layout: RunLayout,
    runner: Arc<dyn CommandRunner>,
    build_submitted: bool,
    control_module: Option<PathBuf>,
}

impl Workspace {
    pub fn new(config: BatchConfig, layout: RunLayout, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            layout,
            runner,
            build_submitted: false,
            control_module: None,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn runner_handle(&self) -> Arc<dyn CommandRunner> {
        Arc::clone(&self.runner)
    }

    pub fn job_name(&self) -> &str {
        self.layout.job_name()
    }

    pub fn subjob_name(&self, sub_job: &str) -> String {
        qualified_name(self.job_name(), sub_job)
    }

    pub fn strict_dependencies(&self) -> bool {
        self.config.engine.strict_dependencies
    }

    pub fn build_submitted(&self) -> bool {
        self.build_submitted
    }

    pub(crate) fn mark_build_submitted(&mut self) {
        self.build_submitted = true;
    }

    pub fn control_module(&self) -> Option<&Path> {
        self.control_module.as_deref()
    }

    /// Copy the backend's cluster-control helper into the config area once.
    /// A missing helper is not an error; jobs simply run without it.
    pub(crate) fn install_control_module(&mut self, name: &str) -> EngineResult<()> {
        if self.control_module.is_some() {
            return Ok(());
        }
        let candidate = self.config.engine.scripts_dir.join(name);
        if !candidate.exists() {
            debug!(module = %candidate.display(), "no cluster control module found");
            return Ok(());
        }
        self.control_module = Some(self.link_to_copy_area(&candidate)?);
        Ok(())
    }

    /// Locate `script`: as given, else relative to the configured scripts directory.
    pub fn resolve_script(&self, script: &Path) -> EngineResult<PathBuf> {
        if script.exists() {
            return Ok(script.to_path_buf());
        }
        let in_scripts = self.config.engine.scripts_dir.join(script);
        if in_scripts.exists() {
            return Ok(in_scripts);
        }
        Err(EngineError::MissingScript(script.to_path_buf()))
    }

    /// Copy `script` under a random name into the config directory so later
    /// edits to the original cannot affect queued jobs.
    pub fn link_to_copy_area(&self, script: &Path) -> EngineResult<PathBuf> {
        let source = self.resolve_script(script)?;
        let config_dir = self.layout.config_dir();
        fs::create_dir_all(&config_dir)?;
        let name = match source.extension().and_then(|e| e.to_str()) {
            Some(ext) => format!("{}.{ext}", random_id(99)),
            None => random_id(99),
        };
        let dest = config_dir.join(name);
        fs::copy(&source, &dest)?;
        make_executable(&dest)?;
        Ok(dest)
    }

    /// Variables every job receives on top of its own.
    pub fn common_env(&self) -> Vec<EnvVar> {
        let mut vars = vec![
            ("Name".to_string(), self.job_name().to_string()),
            (
                "OriginalArea".to_string(),
                self.original_area().display().to_string(),
            ),
        ];
        for name in &self.config.environment.forward {
            match std::env::var(name) {
                Ok(value) => vars.push((name.clone(), value)),
                Err(_) => warn!(variable = %name, "forwarded variable is not set"),
            }
        }
        if let Some(module) = &self.control_module {
            vars.push((
                "ClusterControlModule".to_string(),
                module.display().to_string(),
            ));
        }
        vars
    }

    /// Source area jobs should run from: the build copy once a build job is
    /// queued, the original checkout otherwise.
    fn original_area(&self) -> PathBuf {
        if self.build_submitted && self.config.build.enabled {
            self.layout.build_dir().join("source")
        } else {
            self.config.build.source_area.clone()
        }
    }

    /// Write an executable file exporting `env` plus the common variables.
    pub fn write_ship_file(&self, env: &[EnvVar]) -> EngineResult<PathBuf> {
        let mut lines = vec!["#!/bin/bash".to_string()];
        lines.extend(
            env.iter()
                .chain(self.common_env().iter())
                .map(|(k, v)| format!("export {k}={}", shell_quote(v))),
        );
        let path = write_list(
            &lines,
            &self.layout.config_dir().join(format!("{}.sh", random_id(74))),
        )?;
        make_executable(&path)?;
        Ok(path)
    }

    /// Wrap `script` into `EnvScript_<id>.sh` that exports `env` first.
    ///
    /// With containers enabled the script is executed through `Container.sh`,
    /// which receives the image in `CONTAINER_IMAGE`.
    pub fn pack_environment(&self, env: &[EnvVar], script: &Path) -> EngineResult<PathBuf> {
        let exec = self.link_to_copy_area(script)?;
        let ship = self.write_ship_file(env)?;

        let mut lines = vec![
            "#!/bin/bash".to_string(),
            format!("source {}", shell_quote(&ship.display().to_string())),
        ];
        if self.config.container.enabled {
            let wrapper = self.link_to_copy_area(Path::new(CONTAINER_SCRIPT))?;
            lines.push(format!(
                "export CONTAINER_IMAGE={}",
                shell_quote(&self.config.container.image)
            ));
            lines.push(format!(
                "exec {} {}",
                shell_quote(&wrapper.display().to_string()),
                shell_quote(&exec.display().to_string())
            ));
        } else {
            lines.push(format!("source {}", shell_quote(&exec.display().to_string())));
        }

        let path = write_list(
            &lines,
            &self
                .layout
                .config_dir()
                .join(format!("EnvScript_{}.sh", random_id(50))),
        )?;
        make_executable(&path)?;
        debug!(script = %script.display(), wrapper = %path.display(), "packed environment");
        Ok(path)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use batchgrid_core::EngineKind;

    /// A workspace rooted in a fresh temp dir with a `scripts/` directory
    /// holding `Job.sh`.
    pub(crate) fn scratch_workspace(kind: EngineKind) -> (tempfile::TempDir, Workspace, Arc<ScriptedRunner>) {
        let dir = tempfile::tempdir().unwrap();
        let scripts = dir.path().join("scripts");
        fs::create_dir_all(&scripts).unwrap();
        fs::write(scripts.join("Job.sh"), "#!/bin/bash\necho job\n").unwrap();

        let mut config = BatchConfig::scaffold(kind, dir.path());
        config.engine.scripts_dir = scripts;
        config.build.source_area = dir.path().join("src");
        config.engine.poll_interval_ms = 10;

        let runner = Arc::new(ScriptedRunner::new());
        let layout = RunLayout::dated(dir.path(), "Run", "2026-10-19");
        let ws = Workspace::new(config, layout, runner.clone());
        (dir, ws, runner)
    }

    #[test]
    fn resolves_scripts_from_scripts_dir() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Local);
        assert!(ws.resolve_script(Path::new("Job.sh")).unwrap().ends_with("scripts/Job.sh"));
        assert!(matches!(
            ws.resolve_script(Path::new("Nope.sh")),
            Err(EngineError::MissingScript(_))
        ));
    }

    #[test]
    fn copies_keep_extension_and_land_in_config_dir() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Local);
        let copy = ws.link_to_copy_area(Path::new("Job.sh")).unwrap();
        assert_eq!(copy.parent().unwrap(), ws.layout().config_dir());
        assert_eq!(copy.extension().unwrap(), "sh");
        assert_eq!(fs::read_to_string(copy).unwrap(), "#!/bin/bash\necho job\n");
    }

    #[test]
    fn ship_file_exports_job_and_common_variables() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Local);
        let ship = ws
            .write_ship_file(&[("OutFile".into(), "it's.root".into())])
            .unwrap();
        let content = fs::read_to_string(ship).unwrap();
        assert!(content.starts_with("#!/bin/bash\n"));
        assert!(content.contains(r"export OutFile='it'\''s.root'"));
        assert!(content.contains("export Name='Run'"));
        assert!(content.contains("export OriginalArea="));
    }

    #[test]
    fn original_area_switches_to_build_copy() {
        let (dir, mut ws, _) = scratch_workspace(EngineKind::Slurm);
        assert_eq!(ws.original_area(), dir.path().join("src"));
        ws.mark_build_submitted();
        assert_eq!(ws.original_area(), ws.layout().build_dir().join("source"));
    }

    #[test]
    fn env_script_sources_ship_file_then_job() {
        let (_dir, ws, _) = scratch_workspace(EngineKind::Local);
        let wrapper = ws.pack_environment(&[], Path::new("Job.sh")).unwrap();
        let name = wrapper.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("EnvScript_"));
        let lines: Vec<String> = fs::read_to_string(&wrapper)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].starts_with("source "));
        assert!(lines[2].starts_with("source "));
    }

    #[test]
    fn container_wraps_execution() {
        let (_dir, mut ws, _) = scratch_workspace(EngineKind::Local);
        fs::write(
            ws.config().engine.scripts_dir.join(CONTAINER_SCRIPT),
            "#!/bin/bash\nexec \"$@\"\n",
        )
        .unwrap();
        ws.config.container.enabled = true;
        ws.config.container.image = "centos7".into();
        let wrapper = ws.pack_environment(&[], Path::new("Job.sh")).unwrap();
        let content = fs::read_to_string(wrapper).unwrap();
        assert!(content.contains("export CONTAINER_IMAGE='centos7'"));
        assert!(content.lines().last().unwrap().starts_with("exec "));
    }

    #[test]
    fn control_module_is_optional_and_installed_once() {
        let (_dir, mut ws, _) = scratch_workspace(EngineKind::Slurm);
        ws.install_control_module("ClusterControlSLURM.sh").unwrap();
        assert!(ws.control_module().is_none());

        fs::write(
            ws.config().engine.scripts_dir.join("ClusterControlSLURM.sh"),
            "#!/bin/bash\n",
        )
        .unwrap();
        ws.install_control_module("ClusterControlSLURM.sh").unwrap();
        let first = ws.control_module().unwrap().to_path_buf();
        ws.install_control_module("ClusterControlSLURM.sh").unwrap();
        assert_eq!(ws.control_module().unwrap(), first);
        assert!(
            ws.common_env()
                .iter()
                .any(|(k, _)| k == "ClusterControlModule")
        );
    }
}
