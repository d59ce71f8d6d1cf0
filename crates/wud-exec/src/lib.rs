//! Runs a work-unit's command list: `${NAME}` substitution, subprocess
//! spawn with optional niceness, stdio capture, stop-on-first-failure.
//!
//! Mirrors `wuclient.py`'s `Workunit.run` loop, but records every command's
//! captured output rather than only the failing one, and makes the
//! stop-on-failure behavior an explicit return value instead of a thrown
//! exception the caller has to reconstruct the index from.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use thiserror::Error;
use tracing::{info, warn};
use wud_model::safe_substitute;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn command {index} ({command:?}): {source}")]
    Spawn {
        index: usize,
        command: String,
        #[source]
        source: std::io::Error,
    },
}

/// One command's captured output. `None` means the stream produced no
/// bytes, matching the source's "nil marker" for empty stdout/stderr.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandCapture {
    pub stdout: Option<Vec<u8>>,
    pub stderr: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub captures: Vec<CommandCapture>,
    /// Index of the first command that exited non-zero, if any.
    pub failed_command: Option<usize>,
    /// That command's exit code, or 0 if every command succeeded.
    pub error_code: i64,
}

impl CommandOutcome {
    pub fn succeeded(&self) -> bool {
        self.failed_command.is_none()
    }
}

pub struct RunnerConfig {
    pub workdir: PathBuf,
    /// 0 means leave the default scheduling priority alone.
    pub niceness: i32,
}

/// Run every command in order, substituting `vars` into each first.
/// Stops at the first non-zero exit; later commands are not run (their
/// outcome is simply absent from `captures`, one entry shorter than
/// `commands`).
pub async fn run_commands(
    commands: &[String],
    vars: &BTreeMap<String, String>,
    config: &RunnerConfig,
) -> Result<CommandOutcome, ExecError> {
    let mut captures = Vec::with_capacity(commands.len());

    for (index, template) in commands.iter().enumerate() {
        let expanded = safe_substitute(template, vars);
        info!(index, command = %expanded, "running command");

        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c")
            .arg(&expanded)
            .current_dir(&config.workdir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        apply_niceness(&mut cmd, config.niceness);

        let child = cmd.spawn().map_err(|source| ExecError::Spawn {
            index,
            command: expanded.clone(),
            source,
        })?;
        let output = child.wait_with_output().await.map_err(|source| ExecError::Spawn {
            index,
            command: expanded.clone(),
            source,
        })?;

        captures.push(CommandCapture {
            stdout: non_empty(output.stdout),
            stderr: non_empty(output.stderr),
        });

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1) as i64;
            warn!(index, code, "command failed, stopping sequence");
            return Ok(CommandOutcome {
                captures,
                failed_command: Some(index),
                error_code: code,
            });
        }
    }

    Ok(CommandOutcome {
        captures,
        failed_command: None,
        error_code: 0,
    })
}

fn non_empty(buf: Vec<u8>) -> Option<Vec<u8>> {
    if buf.is_empty() {
        None
    } else {
        Some(buf)
    }
}

#[cfg(unix)]
fn apply_niceness(cmd: &mut tokio::process::Command, niceness: i32) {
    use std::os::unix::process::CommandExt;
    if niceness == 0 {
        return;
    }
    unsafe {
        cmd.pre_exec(move || {
            // SAFETY: libc::nice is async-signal-safe; this runs in the
            // forked child before exec, with no other code in between.
            libc::nice(niceness);
            Ok(())
        });
    }
}

#[cfg(not(unix))]
fn apply_niceness(_cmd: &mut tokio::process::Command, _niceness: i32) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunnerConfig {
        RunnerConfig { workdir: std::env::temp_dir(), niceness: 0 }
    }

    #[tokio::test]
    async fn runs_all_commands_and_captures_stdout() {
        let commands = vec!["echo one".to_string(), "echo two".to_string()];
        let outcome = run_commands(&commands, &BTreeMap::new(), &config()).await.unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.captures.len(), 2);
        assert_eq!(outcome.captures[0].stdout.as_deref(), Some(b"one\n".as_slice()));
        assert_eq!(outcome.captures[1].stdout.as_deref(), Some(b"two\n".as_slice()));
    }

    #[tokio::test]
    async fn stops_at_first_failure_and_records_index() {
        let commands = vec![
            "echo ok".to_string(),
            "exit 7".to_string(),
            "echo never".to_string(),
        ];
        let outcome = run_commands(&commands, &BTreeMap::new(), &config()).await.unwrap();

        assert!(!outcome.succeeded());
        assert_eq!(outcome.failed_command, Some(1));
        assert_eq!(outcome.error_code, 7);
        assert_eq!(outcome.captures.len(), 2);
    }

    #[tokio::test]
    async fn substitutes_vars_before_running() {
        let mut vars = BTreeMap::new();
        vars.insert("MSG".to_string(), "substituted".to_string());
        let commands = vec!["echo ${MSG}".to_string()];
        let outcome = run_commands(&commands, &vars, &config()).await.unwrap();

        assert_eq!(outcome.captures[0].stdout.as_deref(), Some(b"substituted\n".as_slice()));
    }

    #[tokio::test]
    async fn empty_stderr_is_none() {
        let commands = vec!["echo quiet".to_string()];
        let outcome = run_commands(&commands, &BTreeMap::new(), &config()).await.unwrap();
        assert_eq!(outcome.captures[0].stderr, None);
    }
}
