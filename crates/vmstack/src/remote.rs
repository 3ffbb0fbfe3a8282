//! Run scripts on provisioned nodes.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::AuthMethod;
use crate::error::RemoteError;

/// Default SSH connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Node a script runs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHost {
    /// IP address or host name.
    pub address: String,
    /// Login user.
    pub user: String,
    /// Key or password login.
    pub auth: AuthMethod,
}

impl RemoteHost {
    /// Host reached with key-based login.
    #[must_use]
    pub fn new(address: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            user: user.into(),
            auth: AuthMethod::SshKey,
        }
    }

    #[must_use]
    pub fn with_auth(mut self, auth: AuthMethod) -> Self {
        self.auth = auth;
        self
    }
}

/// Runs a shell script on a host and captures its stdout.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `script` with `bash` on `host`, returning trimmed stdout.
    async fn run(&self, host: &RemoteHost, script: &str) -> Result<String, RemoteError>;
}

/// [`RemoteExecutor`] backed by the system `ssh` client.
///
/// Key-based hosts get a non-interactive session. Password hosts go
/// through `sshpass`, which reads the password from `SSHPASS`. The script
/// is fed on stdin to `bash -s` so that it never appears in the process
/// list.
#[derive(Clone)]
pub struct SshExecutor {
    identity: Option<PathBuf>,
    password: Option<String>,
    connect_timeout: u64,
}

impl fmt::Debug for SshExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshExecutor")
            .field("identity", &self.identity)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl SshExecutor {
    /// Executor using `identity` as private key, or the agent when `None`.
    #[must_use]
    pub fn new(identity: Option<PathBuf>) -> Self {
        Self {
            identity,
            password: None,
            connect_timeout: CONNECT_TIMEOUT_SECS,
        }
    }

    /// Password for hosts using password login.
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into()).filter(|p: &String| !p.is_empty());
        self
    }

    /// Set the connect timeout in seconds.
    #[must_use]
    pub fn with_connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout = secs;
        self
    }

    fn args(&self, host: &RemoteHost) -> Vec<String> {
        let mut args = Vec::new();
        let mut options = Vec::new();
        match host.auth {
            AuthMethod::SshKey => {
                if let Some(identity) = &self.identity {
                    args.push("-i".to_string());
                    args.push(identity.display().to_string());
                }
                options.push("BatchMode=yes");
            }
            AuthMethod::Password => {
                options.push("PubkeyAuthentication=no");
                options.push("PreferredAuthentications=password,keyboard-interactive");
                options.push("NumberOfPasswordPrompts=1");
            }
        }
        options.extend([
            "StrictHostKeyChecking=no",
            "UserKnownHostsFile=/dev/null",
            "LogLevel=ERROR",
        ]);
        for option in options
            .into_iter()
            .map(str::to_string)
            .chain([format!("ConnectTimeout={}", self.connect_timeout)])
        {
            args.push("-o".to_string());
            args.push(option);
        }
        args.push(format!("{}@{}", host.user, host.address));
        args.push("bash -s".to_string());
        args
    }

    fn command(&self, host: &RemoteHost) -> Result<Command, RemoteError> {
        let mut command = match host.auth {
            AuthMethod::SshKey => Command::new("ssh"),
            AuthMethod::Password => {
                let password = self.password.as_deref().ok_or_else(|| RemoteError::Spawn {
                    host: host.address.clone(),
                    reason: "password login requested but no password is set".into(),
                })?;
                let mut command = Command::new("sshpass");
                command.args(["-e", "ssh"]).env("SSHPASS", password);
                command
            }
        };
        command.args(self.args(host));
        Ok(command)
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &RemoteHost, script: &str) -> Result<String, RemoteError> {
        let spawn_error = |reason: String| RemoteError::Spawn {
            host: host.address.clone(),
            reason,
        };

        debug!(host = %host.address, user = %host.user, auth = ?host.auth, bytes = script.len(), "Running remote script");

        let mut child = self
            .command(host)?
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| spawn_error("failed to capture stdin".into()))?;
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|e| spawn_error(format!("failed to send script: {e}")))?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| spawn_error(format!("failed to wait for ssh: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(host = %host.address, exit_code = ?output.status.code(), stderr = %stderr, "Remote script failed");
            return Err(RemoteError::Failed {
                host: host.address.clone(),
                code: output.status.code(),
                stderr,
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
