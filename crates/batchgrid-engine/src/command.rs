//! External command execution.
//!
//! Every scheduler interaction (submission, queue listing, partition listing)
//! and every local task goes through [`CommandRunner`], so tests can swap the
//! real processes for [`crate::testing::ScriptedRunner`].

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use batchgrid_core::EnvVar;
use tracing::debug;

use crate::error::{EngineError, EngineResult};

/// A program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<EnvVar>,
    /// Send stdout and stderr to this file instead of capturing them.
    pub log_file: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            log_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn log_to(mut self, file: &Path) -> Self {
        self.log_file = Some(file.to_path_buf());
        self
    }

    /// Whether any argument equals or starts with `prefix`.
    pub fn has_arg(&self, prefix: &str) -> bool {
        self.args.iter().any(|a| a.starts_with(prefix))
    }

    /// Value of a `--flag=value` argument.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        let prefix = format!("{flag}=");
        self.args
            .iter()
            .find_map(|a| a.strip_prefix(prefix.as_str()))
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Non-empty stdout lines, trimmed.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim).filter(|l| !l.is_empty())
    }
}

/// Runs external programs.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &CommandLine) -> EngineResult<CommandOutput>;
}

/// Run `command` and turn a non-zero exit into [`EngineError::CommandFailed`].
pub fn run_checked(runner: &dyn CommandRunner, command: &CommandLine) -> EngineResult<CommandOutput> {
    let output = runner.run(command)?;
    if !output.success() {
        return Err(EngineError::CommandFailed {
            command: command.to_string(),
            status: output.status,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// Spawns real processes via `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, command: &CommandLine) -> EngineResult<CommandOutput> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }
        for (name, value) in &command.env {
            cmd.env(name, value);
        }

        debug!("Running: {}", command);

        let spawn_err = |source| EngineError::CommandSpawn {
            command: command.to_string(),
            source,
        };

        if let Some(log) = &command.log_file {
            let out = File::create(log).map_err(spawn_err)?;
            let err = out.try_clone().map_err(spawn_err)?;
            let status = cmd
                .stdin(Stdio::null())
                .stdout(out)
                .stderr(err)
                .status()
                .map_err(spawn_err)?;
            return Ok(CommandOutput {
                status: status.code().unwrap_or(-1),
                ..CommandOutput::default()
            });
        }

        let output = cmd.stdin(Stdio::null()).output().map_err(spawn_err)?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_quotes_arguments_with_spaces() {
        let cmd = CommandLine::new("sbatch")
            .arg("--job-name=Run_Build")
            .arg("--mail-type=FAIL")
            .arg("a b");
        assert_eq!(cmd.to_string(), "sbatch --job-name=Run_Build --mail-type=FAIL 'a b'");
        assert_eq!(cmd.flag_value("--job-name"), Some("Run_Build"));
        assert!(cmd.has_arg("--mail"));
    }

    #[test]
    fn output_lines_are_trimmed() {
        let out = CommandOutput::ok("  a \n\n b\n");
        assert_eq!(out.lines().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_captures_stdout_and_status() {
        let out = SystemRunner
            .run(&CommandLine::new("sh").args(["-c", "echo hello; exit 3"]))
            .unwrap();
        assert_eq!(out.status, 3);
        assert_eq!(out.stdout.trim(), "hello");

        let err = run_checked(&SystemRunner, &CommandLine::new("sh").args(["-c", "exit 1"]))
            .unwrap_err();
        assert!(matches!(err, EngineError::CommandFailed { status: 1, .. }));
    }

    #[cfg(unix)]
    #[test]
    fn system_runner_redirects_into_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("task.log");
        let out = SystemRunner
            .run(
                &CommandLine::new("sh")
                    .args(["-c", "echo $GREETING"])
                    .env("GREETING", "hi")
                    .log_to(&log),
            )
            .unwrap();
        assert!(out.success());
        assert_eq!(std::fs::read_to_string(&log).unwrap().trim(), "hi");
    }
}
