//! External process execution.
//!
//! Conversion, OCR and annotation are done by external executables. Each is
//! described by a [`CommandSpec`] template and executed through the narrow
//! [`ProcessRunner`] interface, so tests can substitute a scripted runner and
//! deployments can wrap the call (containers, sandboxes) without touching the
//! pipeline.
//!
//! Invocations are blocking and have no timeout of their own; they run on the
//! tokio blocking pool via [`run_command`].

use crate::config::CommandSpec;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use tracing::debug;

/// Maximum characters of diagnostic output carried into errors.
const DIAGNOSTIC_LIMIT: usize = 4000;

/// Captured result of one process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    /// Exit code, `None` when killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    /// Short status line, e.g. `exit status 2`.
    pub fn status_line(&self) -> String {
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }

    /// stderr (or stdout when stderr is empty), trimmed to a bounded length.
    pub fn diagnostics(&self) -> String {
        let text = if self.stderr.trim().is_empty() {
            self.stdout.trim()
        } else {
            self.stderr.trim()
        };
        if text.chars().count() <= DIAGNOSTIC_LIMIT {
            text.to_string()
        } else {
            let tail: String = text
                .chars()
                .rev()
                .take(DIAGNOSTIC_LIMIT)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            format!("…{tail}")
        }
    }
}

/// Runs one external program to completion.
pub trait ProcessRunner: Send + Sync {
    /// Run `program` with `args` in `workdir`. Spawn failures (missing
    /// executable, permissions) are `Err`; a non-zero exit is `Ok` with
    /// `success == false`.
    fn run(&self, program: &str, args: &[String], workdir: &Path) -> io::Result<ProcessOutput>;
}

/// Spawns real processes with [`std::process::Command`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, program: &str, args: &[String], workdir: &Path) -> io::Result<ProcessOutput> {
        let output = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .output()
            .map_err(|e| {
                if e.kind() == io::ErrorKind::NotFound {
                    io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("'{program}' not found in PATH"),
                    )
                } else {
                    e
                }
            })?;

        Ok(ProcessOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Render `spec` with `vars` and run it on the blocking pool.
pub async fn run_command(
    runner: &Arc<dyn ProcessRunner>,
    spec: &CommandSpec,
    vars: &[(&str, &str)],
    workdir: &Path,
) -> io::Result<ProcessOutput> {
    let runner = Arc::clone(runner);
    let program = spec.program.clone();
    let args = spec.render(vars);
    let workdir: PathBuf = workdir.to_path_buf();
    debug!("Running {} {:?}", program, args);

    tokio::task::spawn_blocking(move || runner.run(&program, &args, &workdir))
        .await
        .map_err(|e| io::Error::other(format!("process task panicked: {e}")))?
}


#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn system_runner_captures_output() {
        let dir = TempDir::new().unwrap();
        let out = SystemProcessRunner
            .run(
                "sh",
                &["-c".into(), "echo out; echo err >&2; exit 3".into()],
                dir.path(),
            )
            .unwrap();
        assert!(!out.success);
        assert_eq!(out.code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.diagnostics(), "err");
        assert_eq!(out.status_line(), "exit status 3");
    }

    #[test]
    fn missing_program_is_not_found() {
        let dir = TempDir::new().unwrap();
        let err = SystemProcessRunner
            .run("definitely-not-a-real-binary-xyz", &[], dir.path())
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn diagnostics_are_bounded() {
        let out = ProcessOutput {
            stderr: "x".repeat(DIAGNOSTIC_LIMIT + 100),
            ..Default::default()
        };
        assert_eq!(out.diagnostics().chars().count(), DIAGNOSTIC_LIMIT + 1);
    }

    #[tokio::test]
    async fn run_command_renders_placeholders() {
        let dir = TempDir::new().unwrap();
        let runner: Arc<dyn ProcessRunner> = Arc::new(SystemProcessRunner);
        let spec = CommandSpec::new("sh", ["-c", "echo {input}"]);
        let out = run_command(&runner, &spec, &[("input", "hello")], dir.path())
            .await
            .unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");
    }
}
