//! Shell command execution for host network tooling.
//!
//! Commands are assembled as strings with every operand passed through
//! [`shellquote`], then run via `/bin/sh -c`, optionally behind a privilege
//! helper such as `sudo`.
//!
//! # Example
//!
//! ```ignore
//! use eswitch_common::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link set dev {} up", IP_CMD, shellquote("eth2"));
//! let result = shell::exec(&cmd).await?;
//! ```

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{CommandError, CommandResult};

/// Path to the `ip` command for link and VF configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Root of the network class in sysfs.
pub const SYSFS_NET: &str = "/sys/class/net";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// # Example
///
/// ```
/// use eswitch_common::shell::shellquote;
///
/// assert_eq!(shellquote("eth2"), "\"eth2\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// Trimmed stdout.
    pub stdout: String,
    /// Trimmed stderr.
    pub stderr: String,
}

impl ExecResult {
    /// Creates a successful result carrying `stdout`.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Runs `cmd` through `/bin/sh -c`.
///
/// Returns `Err` only when the process cannot be spawned; a non-zero exit is
/// reported through [`ExecResult::exit_code`].
pub async fn exec(cmd: &str) -> CommandResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| CommandError::Spawn {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let result = ExecResult {
        exit_code,
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code, "Command succeeded");
    } else {
        tracing::warn!(
            command = %cmd,
            exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Runs `cmd` and turns a non-zero exit into [`CommandError::Failed`].
pub async fn exec_or_throw(cmd: &str) -> CommandResult<String> {
    check(cmd, exec(cmd).await?)
}

fn check(cmd: &str, result: ExecResult) -> CommandResult<String> {
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(CommandError::Failed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

/// Something that can run host commands.
///
/// The device control layer is written against this trait so that command
/// sequences can be captured instead of executed.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs a command, returning its result even on non-zero exit.
    async fn run(&self, cmd: &str) -> CommandResult<ExecResult>;

    /// Runs a command and fails on non-zero exit.
    async fn run_or_throw(&self, cmd: &str) -> CommandResult<String> {
        let result = self.run(cmd).await?;
        check(cmd, result)
    }
}

/// Runs commands on the host, optionally prefixed by a privilege helper.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    root_helper: Option<String>,
}

impl ShellRunner {
    /// Creates a runner that executes commands as the current user.
    pub fn new() -> Self {
        Self::default()
    }

    /// Prefixes every command with `helper` (for example `sudo`).
    pub fn with_root_helper(helper: impl Into<String>) -> Self {
        let helper = helper.into();
        Self {
            root_helper: (!helper.trim().is_empty()).then_some(helper),
        }
    }

    fn wrap(&self, cmd: &str) -> String {
        match &self.root_helper {
            Some(helper) => format!("{} {}", helper, cmd),
            None => cmd.to_string(),
        }
    }
}

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, cmd: &str) -> CommandResult<ExecResult> {
        exec(&self.wrap(cmd)).await
    }
}

/// Captures commands instead of running them.
///
/// Used for dry runs and tests. Commands containing a registered failure
/// pattern return exit code 1; commands matching a registered response
/// pattern return that stdout.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
    failures: Mutex<Vec<String>>,
    responses: Mutex<Vec<(String, String)>>,
}

impl RecordingRunner {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every command containing `pattern` fail.
    pub fn fail_on(&self, pattern: impl Into<String>) {
        self.failures.lock().push(pattern.into());
    }

    /// Removes all failure patterns.
    pub fn clear_failures(&self) {
        self.failures.lock().clear();
    }

    /// Answers commands containing `pattern` with `stdout`.
    pub fn respond(&self, pattern: impl Into<String>, stdout: impl Into<String>) {
        self.responses.lock().push((pattern.into(), stdout.into()));
    }

    /// Returns the commands seen so far.
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, cmd: &str) -> CommandResult<ExecResult> {
        self.commands.lock().push(cmd.to_string());
        tracing::info!(command = %cmd, "Recorded command");

        if self.failures.lock().iter().any(|p| cmd.contains(p.as_str())) {
            return Ok(ExecResult {
                exit_code: 1,
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }

        let stdout = self
            .responses
            .lock()
            .iter()
            .find(|(p, _)| cmd.contains(p.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(ExecResult::ok(stdout))
    }
}
