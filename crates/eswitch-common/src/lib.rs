//! Common infrastructure for the eSwitch crates.
//!
//! - [`shell`]: command execution with proper quoting and an optional
//!   privilege helper
//! - [`error`]: error types for command execution and sysfs access
//!
//! # Example
//!
//! ```ignore
//! use eswitch_common::shell::{self, IP_CMD, shellquote};
//!
//! async fn link_down(dev: &str) -> eswitch_common::CommandResult<()> {
//!     let cmd = format!("{} link set dev {} down", IP_CMD, shellquote(dev));
//!     shell::exec_or_throw(&cmd).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{CommandError, CommandResult};
pub use shell::{CommandRunner, ExecResult, RecordingRunner, ShellRunner};
