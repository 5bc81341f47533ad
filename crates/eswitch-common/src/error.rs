//! Error types for command execution and sysfs access.

use std::io;
use thiserror::Error;

/// Result type alias for command execution.
pub type CommandResult<T> = Result<T, CommandError>;

/// Errors raised while driving host tooling.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The command could not be spawned.
    #[error("Failed to execute shell command '{command}': {source}")]
    Spawn {
        /// The command that failed to execute.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// The command ran and returned a non-zero exit code.
    #[error("Shell command failed: '{command}' (exit code {exit_code}): {output}")]
    Failed {
        /// The command that failed.
        command: String,
        /// The exit code.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// A sysfs attribute could not be read.
    #[error("Failed to read {path}: {source}")]
    Sysfs {
        /// The sysfs path.
        path: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Command output did not have the expected shape.
    #[error("Unexpected output from '{command}': {message}")]
    Parse {
        /// The command whose output was parsed.
        command: String,
        /// What was wrong with it.
        message: String,
    },
}

impl CommandError {
    /// Creates a sysfs read error.
    pub fn sysfs(path: impl Into<String>, source: io::Error) -> Self {
        Self::Sysfs {
            path: path.into(),
            source,
        }
    }

    /// Creates an output parse error.
    pub fn parse(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Parse {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Returns true if a later attempt may succeed.
    ///
    /// Spawn failures mean the tool is missing or not executable, which a
    /// retry will not fix.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CommandError::Failed { .. } | CommandError::Sysfs { .. })
    }
}
