//! SSH remote execution
//!
//! Commands run through the system `ssh` client so user configuration
//! (`~/.ssh/config`, agents, jump hosts) applies unchanged. How to
//! authenticate is decided once per invocation by [`SshSession::connect`]
//! and reused for every later command:
//!
//! 1. key or agent authentication in batch mode
//! 2. a password read once and handed to `sshpass`
//! 3. plain interactive `ssh`, which may prompt for every command

use std::fmt;
use std::io::{self, IsTerminal};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use bf_core::{ExecOutput, RemoteExec, TunnelError};

use crate::prompt::Interaction;

/// Exit status `ssh` reserves for its own errors
pub const SSH_ERROR_EXIT: i32 = 255;

/// Exit status `sshpass` uses for a rejected password
const SSHPASS_BAD_PASSWORD: i32 = 5;

/// How commands authenticate against the target
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Keys or agent, never prompting
    Key,
    /// Password supplied through `sshpass -e`
    Password(String),
    /// Let `ssh` prompt on the terminal
    Interactive,
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Key => write!(f, "Key"),
            AuthMode::Password(_) => write!(f, "Password(***)"),
            AuthMode::Interactive => write!(f, "Interactive"),
        }
    }
}

/// Authenticated access to one SSH target
#[derive(Debug, Clone)]
pub struct SshSession {
    target: String,
    connect_timeout: Duration,
    auth: AuthMode,
}

impl SshSession {
    /// Session with an already known authentication mode
    pub fn new(target: impl Into<String>, connect_timeout: Duration, auth: AuthMode) -> Self {
        Self {
            target: target.into(),
            connect_timeout,
            auth,
        }
    }

    /// Run the authentication ladder against `target`
    pub async fn connect(
        target: &str,
        connect_timeout: Duration,
        interaction: &dyn Interaction,
    ) -> Result<Self, TunnelError> {
        let probe = Self::new(target, connect_timeout, AuthMode::Key);
        let output = probe.run("true").await;
        match output {
            Ok(_) => {
                tracing::debug!("Key authentication to {} works", target);
                return Ok(probe);
            }
            Err(TunnelError::AuthenticationFailed(_)) => {}
            Err(e) => return Err(e),
        }

        if is_installed("sshpass") {
            let password = interaction
                .password(&format!("SSH password for {}: ", target))
                .ok_or_else(|| TunnelError::AuthenticationFailed(target.to_string()))?;
            let session = Self::new(target, connect_timeout, AuthMode::Password(password));
            session.run("true").await?;
            tracing::info!("Password authentication to {} works", target);
            return Ok(session);
        }

        if !io::stdin().is_terminal() {
            return Err(TunnelError::AuthenticationFailed(target.to_string()));
        }
        tracing::warn!(
            "Key authentication to {} failed and sshpass is not installed; ssh may ask for the password repeatedly",
            target
        );
        Ok(Self::new(target, connect_timeout, AuthMode::Interactive))
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn auth(&self) -> &AuthMode {
        &self.auth
    }

    /// Base command for an ssh-compatible `program` carrying our auth and
    /// timeout options; callers append their own arguments and the target
    pub fn command(&self, program: &str, leading: &[&str]) -> Command {
        let mut cmd = match &self.auth {
            AuthMode::Password(password) => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).env("SSHPASS", password);
                cmd
            }
            AuthMode::Key | AuthMode::Interactive => Command::new(program),
        };
        cmd.args(leading);
        if self.auth == AuthMode::Key {
            cmd.args(["-o", "BatchMode=yes"]);
        }
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        cmd
    }

    /// Interpret an exit status that `ssh` or `sshpass` reserve for themselves
    fn transport_error(&self, exit_code: i32, stderr: &str) -> Option<TunnelError> {
        let denied = stderr.contains("Permission denied")
            || stderr.contains("Too many authentication failures");
        match (&self.auth, exit_code) {
            (AuthMode::Password(_), SSHPASS_BAD_PASSWORD) => {
                Some(TunnelError::AuthenticationFailed(self.target.clone()))
            }
            (_, SSH_ERROR_EXIT) if denied => {
                Some(TunnelError::AuthenticationFailed(self.target.clone()))
            }
            (_, SSH_ERROR_EXIT) => Some(TunnelError::Connection(format!(
                "{}: {}",
                self.target,
                last_line(stderr).unwrap_or("ssh exited with status 255")
            ))),
            _ => None,
        }
    }
}

#[async_trait]
impl RemoteExec for SshSession {
    async fn run(&self, command: &str) -> Result<ExecOutput, TunnelError> {
        let mut cmd = self.command("ssh", &[]);
        cmd.arg(&self.target).arg(command);
        // Interactive prompts need the terminal
        cmd.stdin(if self.auth == AuthMode::Interactive {
            Stdio::inherit()
        } else {
            Stdio::null()
        });

        tracing::debug!("ssh {} -- {}", self.target, command);
        let output = cmd.output().await.map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TunnelError::ToolMissing(match self.auth {
                AuthMode::Password(_) => "sshpass".to_string(),
                _ => "ssh".to_string(),
            }),
            _ => TunnelError::Connection(format!("failed to run ssh: {}", e)),
        })?;

        let result = ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        };
        if let Some(err) = self.transport_error(result.exit_code, &result.stderr) {
            return Err(err);
        }
        Ok(result)
    }

    fn host(&self) -> &str {
        &self.target
    }
}

/// Whether `tool` can be spawned at all
pub fn is_installed(tool: &str) -> bool {
    std::process::Command::new(tool)
        .arg("-V")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok()
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).last()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(auth: AuthMode) -> SshSession {
        SshSession::new("me@hpc", Duration::from_secs(10), auth)
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_key_command_is_batch_mode() {
        let cmd = session(AuthMode::Key).command("ssh", &[]);
        assert_eq!(cmd.as_std().get_program(), "ssh");
        assert_eq!(
            args(&cmd),
            ["-o", "BatchMode=yes", "-o", "ConnectTimeout=10"]
        );
    }

    #[test]
    fn test_password_command_goes_through_sshpass() {
        let cmd = session(AuthMode::Password("hunter2".into())).command("autossh", &["-M", "0"]);
        assert_eq!(cmd.as_std().get_program(), "sshpass");
        assert_eq!(
            args(&cmd),
            ["-e", "autossh", "-M", "0", "-o", "ConnectTimeout=10"]
        );
        // The password travels in the environment, never on the command line
        assert!(!args(&cmd).iter().any(|a| a.contains("hunter2")));
        assert!(cmd
            .as_std()
            .get_envs()
            .any(|(k, v)| k == "SSHPASS" && v.is_some()));
    }

    #[test]
    fn test_password_is_not_debug_printed() {
        let printed = format!("{:?}", session(AuthMode::Password("hunter2".into())));
        assert!(!printed.contains("hunter2"));
    }

    #[test]
    fn test_transport_errors() {
        let key = session(AuthMode::Key);
        assert!(matches!(
            key.transport_error(255, "me@hpc: Permission denied (publickey,password)."),
            Some(TunnelError::AuthenticationFailed(_))
        ));
        assert!(matches!(
            key.transport_error(255, "ssh: connect to host hpc port 22: Connection refused"),
            Some(TunnelError::Connection(ref m)) if m.contains("Connection refused")
        ));
        assert!(key.transport_error(0, "").is_none());
        assert!(key.transport_error(3, "").is_none());
        // Only sshpass gives status 5 a meaning
        assert!(key.transport_error(5, "").is_none());

        let password = session(AuthMode::Password("x".into()));
        assert!(matches!(
            password.transport_error(5, ""),
            Some(TunnelError::AuthenticationFailed(_))
        ));
    }
}
