//! External tool execution.
//!
//! Native simulation binaries are opaque: they read a pars file on stdin and
//! write files into their working directory. Invocations carry a typed
//! argument vector and never pass through a shell.

use crate::errors::StageError;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// One call of an external program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// File whose contents become the program's stdin
    pub stdin_file: Option<PathBuf>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin_file: None,
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin_file = Some(path.into());
        self
    }

    /// Program file name, used in logs and errors.
    pub fn tool_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        if let Some(stdin) = &self.stdin_file {
            write!(f, " < {}", stdin.display())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Runs to completion and reports the exit code, whatever it is.
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, StageError>;

    /// Like [`ToolExecutor::run`], but a non-zero exit is a
    /// [`StageError::ToolFailed`]. There is no retry.
    async fn run_checked(&self, invocation: &ToolInvocation) -> Result<ToolOutput, StageError> {
        let output = self.run(invocation).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(StageError::ToolFailed {
                tool: invocation.tool_name(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Spawns real processes with tokio.
#[derive(Debug, Clone, Default)]
pub struct ProcessExecutor {
    timeout: Option<Duration>,
}

impl ProcessExecutor {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

fn open_stdin(path: &Path) -> Result<Stdio, StageError> {
    std::fs::File::open(path)
        .map(Stdio::from)
        .map_err(|source| StageError::io(path, source))
}

#[async_trait]
impl ToolExecutor for ProcessExecutor {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, StageError> {
        let tool = invocation.tool_name();
        let stdin = match &invocation.stdin_file {
            Some(path) => open_stdin(path)?,
            None => Stdio::null(),
        };

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }

        tracing::debug!(command = %invocation, "Running tool");
        let started = Instant::now();
        let child = command.spawn().map_err(|source| StageError::SpawnFailed {
            tool: tool.clone(),
            source,
        })?;

        let output = match self.timeout {
            Some(limit) => match timeout(limit, child.wait_with_output()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(StageError::TimedOut {
                        tool,
                        secs: limit.as_secs(),
                    });
                }
            },
            None => child.wait_with_output().await,
        }
        .map_err(|source| StageError::SpawnFailed {
            tool: tool.clone(),
            source,
        })?;

        let elapsed = started.elapsed();
        let exit_code = output.status.code().unwrap_or(-1);
        tracing::info!(
            tool = %tool,
            command = %invocation,
            exit_code,
            wall_secs = elapsed.as_secs_f64(),
            "TIMER[{}]: {:.3}s",
            tool,
            elapsed.as_secs_f64()
        );

        Ok(ToolOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            elapsed,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sh(script: &str) -> ToolInvocation {
        ToolInvocation::new("sh").arg("-c").arg(script)
    }

    #[test]
    fn test_invocation_builder_and_display() {
        let inv = ToolInvocation::new("/opt/phosim/bin/turb2d")
            .args(["-seed", "10000"])
            .arg("-pix")
            .arg("100")
            .stdin_file("atmosphere_1.pars");
        assert_eq!(inv.tool_name(), "turb2d");
        assert_eq!(
            inv.to_string(),
            "/opt/phosim/bin/turb2d -seed 10000 -pix 100 < atmosphere_1.pars"
        );
    }

    #[tokio::test]
    async fn test_run_captures_exit_code_and_streams() {
        let out = ProcessExecutor::default()
            .run(&sh("echo out; echo err >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_checked_fails_on_nonzero_exit() {
        let err = ProcessExecutor::default()
            .run_checked(&sh("echo 'bad catalog' >&2; exit 2"))
            .await
            .unwrap_err();
        match err {
            StageError::ToolFailed { tool, code, stderr } => {
                assert_eq!(tool, "sh");
                assert_eq!(code, 2);
                assert_eq!(stderr, "bad catalog");
            }
            other => panic!("Expected ToolFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stdin_file_and_cwd() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("in.pars"), "seed 42\n").unwrap();
        let inv = ToolInvocation::new("cat")
            .current_dir(dir.path())
            .stdin_file(dir.path().join("in.pars"));
        let out = ProcessExecutor::default().run_checked(&inv).await.unwrap();
        assert_eq!(out.stdout, "seed 42\n");

        let out = ProcessExecutor::default()
            .run_checked(&sh("pwd").current_dir(dir.path()))
            .await
            .unwrap();
        let reported = std::fs::canonicalize(out.stdout.trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
    }

    #[tokio::test]
    async fn test_missing_stdin_file_is_io_error() {
        let inv = ToolInvocation::new("cat").stdin_file("/nonexistent/in.pars");
        let err = ProcessExecutor::default().run(&inv).await.unwrap_err();
        assert!(matches!(err, StageError::Io { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let inv = ToolInvocation::new("/nonexistent/bin/create_atmosphere");
        let err = ProcessExecutor::default().run(&inv).await.unwrap_err();
        match err {
            StageError::SpawnFailed { tool, .. } => assert_eq!(tool, "create_atmosphere"),
            other => panic!("Expected SpawnFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_timeout() {
        let executor = ProcessExecutor::new(Some(Duration::from_millis(100)));
        let err = executor.run(&sh("sleep 5")).await.unwrap_err();
        assert!(matches!(err, StageError::TimedOut { .. }));
    }
}
