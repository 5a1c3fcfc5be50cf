//! Shell command execution for the attachment engine.
//!
//! Kernel network state is driven through `ip(8)` and `nsenter(1)` rather
//! than a netlink socket, so every argument that originates from the
//! attachment request must be quoted to prevent command injection.
//!
//! # Example
//!
//! ```ignore
//! use attach_common::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link show dev {}", IP_CMD, shellquote("eth0"));
//! let result = shell::exec(&cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{AttachError, AttachResult};

/// Path to the `ip` command for link and address configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `nsenter` command for running inside a network namespace
/// identified by an arbitrary path (not only `/var/run/netns` names).
pub const NSENTER_CMD: &str = "/usr/bin/nsenter";

/// Regex for characters that need escaping in shell double-quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes the characters that keep
/// special meaning inside them: `$`, `` ` ``, `"`, `\` and newline.
///
/// # Example
///
/// ```
/// use attach_common::shell::shellquote;
///
/// assert_eq!(shellquote("eth0"), "\"eth0\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Result of a shell command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success).
    pub exit_code: i32,
    /// The trimmed stdout output.
    pub stdout: String,
    /// The trimmed stderr output.
    pub stderr: String,
}

impl ExecResult {
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

/// Executes a shell command asynchronously.
///
/// The command runs through `/bin/sh -c`. A non-zero exit code is NOT an
/// error at this layer: callers inspect [`ExecResult`] and build the typed
/// error for their component, because several flows (idempotent create,
/// best-effort cleanup) need to look at the failure text first.
///
/// # Errors
///
/// Returns [`AttachError::ShellExec`] only when the command could not be
/// spawned at all.
pub async fn exec(cmd: &str) -> AttachResult<ExecResult> {
    tracing::debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| AttachError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let exit_code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

    let result = ExecResult {
        exit_code,
        stdout,
        stderr,
    };

    if result.success() {
        tracing::trace!(command = %cmd, exit_code = exit_code, "Command succeeded");
    } else {
        tracing::debug!(
            command = %cmd,
            exit_code = exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_simple() {
        assert_eq!(shellquote("simple"), "\"simple\"");
        assert_eq!(shellquote("eth0"), "\"eth0\"");
        assert_eq!(shellquote("1500"), "\"1500\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        // Dollar sign (variable expansion)
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");

        // Backtick (command substitution)
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");

        // Double quote
        assert_eq!(shellquote("say \"hi\""), "\"say \\\"hi\\\"\"");

        // Backslash
        assert_eq!(shellquote("path\\to"), "\"path\\\\to\"");

        // Newline
        assert_eq!(shellquote("line1\nline2"), "\"line1\\\nline2\"");
    }

    #[test]
    fn test_shellquote_injection_attempt() {
        let quoted = shellquote("eth0\"; rm -rf /; echo \"");
        assert!(quoted.starts_with('"'));
        assert!(quoted.ends_with('"'));
        assert!(quoted.contains("\\\";"));
    }

    #[test]
    fn test_shellquote_empty() {
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_exec_result_success() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "output".to_string(),
            stderr: "".to_string(),
        };
        assert!(result.success());
        assert_eq!(result.combined_output(), "output");
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 1,
            stdout: "stdout".to_string(),
            stderr: "stderr".to_string(),
        };
        assert!(!result.success());
        assert_eq!(result.combined_output(), "stdout\nstderr");
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_exec_nonzero_is_ok() {
        let result = exec("exit 42").await.unwrap();
        assert!(!result.success());
        assert_eq!(result.exit_code, 42);
    }
}
