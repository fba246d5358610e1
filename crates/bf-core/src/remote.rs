//! Remote command execution boundary
//!
//! Everything that needs to run a command on the target host (port
//! probing, remote supervisor calls, health checks) goes through
//! [`RemoteExec`], so the logic on top can be exercised against a fake.

use async_trait::async_trait;

use crate::error::TunnelError;

/// Exit status shells report for a command that was not found
pub const EXIT_COMMAND_NOT_FOUND: i32 = 127;

/// Captured result of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the shell could not find the command that was run
    pub fn command_missing(&self) -> bool {
        self.exit_code == EXIT_COMMAND_NOT_FOUND
            || self.stderr.contains("command not found")
            || self.stderr.contains("not found in PATH")
    }
}

/// Runs a shell command line on some host and captures its output
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command` through the remote login shell
    ///
    /// A non-zero exit status is not an error; transport failures are.
    async fn run(&self, command: &str) -> Result<ExecOutput, TunnelError>;

    /// Human-readable name of the host, for logs
    fn host(&self) -> &str;
}

/// Quote a string for safe use as one POSIX shell word
pub fn shell_quote(value: &str) -> String {
    if !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c))
    {
        return value.to_string();
    }
    format!("'{}'", value.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_plain() {
        assert_eq!(shell_quote("service-ctl"), "service-ctl");
        assert_eq!(shell_quote("/srv/bids/repo"), "/srv/bids/repo");
    }

    #[test]
    fn test_shell_quote_special() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("my dir"), "'my dir'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
        assert_eq!(shell_quote("$(rm -rf /)"), "'$(rm -rf /)'");
    }

    #[test]
    fn test_command_missing() {
        let out = ExecOutput {
            exit_code: 127,
            ..Default::default()
        };
        assert!(out.command_missing());

        let out = ExecOutput {
            stderr: "bash: ss: command not found".into(),
            exit_code: 1,
            ..Default::default()
        };
        assert!(out.command_missing());

        let out = ExecOutput {
            exit_code: 1,
            ..Default::default()
        };
        assert!(!out.command_missing());
    }
}
