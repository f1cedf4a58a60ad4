// src/exec/shell.rs

//! Remote command transport.
//!
//! Commands run on the target host through the system `ssh` binary in batch
//! mode. Every execution carries an explicit timeout and the task's
//! cancellation token; a cancelled or timed-out child process is killed via
//! `kill_on_drop`.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{AppConfig, ServerRow};
use crate::engine::task::TaskError;
use crate::protocol::ErrorCode;

/// Hard cap for package installation commands.
pub const PKG_INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
/// Hard cap for commands that pull large artifacts.
pub const LONG_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);
/// Hard cap for health-check probes.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Exit code the ssh client itself uses for connection-level failures.
const SSH_EXIT_CONN_FAILURE: i32 = 255;

/// Captured output of one remote command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// A remote shell bound to one server row.
#[derive(Clone)]
pub struct RemoteShell {
    host: String,
    port: u16,
    user: String,
    key_path: Option<String>,
    has_password: bool,
    connect_timeout: Duration,
    cmd_timeout: Duration,
    cancel: CancellationToken,
}

impl RemoteShell {
    pub fn for_row(row: &ServerRow, config: &AppConfig, cancel: CancellationToken) -> Self {
        Self {
            host: row.server_ip.clone(),
            port: row.server_port,
            user: row.server_user.clone(),
            key_path: (!row.server_key_path.is_empty()).then(|| row.server_key_path.clone()),
            has_password: !row.server_password.is_empty(),
            connect_timeout: Duration::from_millis(config.ssh_timeout_ms),
            cmd_timeout: Duration::from_millis(config.cmd_timeout_ms),
            cancel,
        }
    }

    /// The configured default per-command timeout.
    pub fn default_timeout(&self) -> Duration {
        self.cmd_timeout
    }

    /// Establish a session and run `true`, proving connectivity and auth.
    pub async fn test_connection(&self) -> Result<(), TaskError> {
        let probe = self.connect_timeout + Duration::from_secs(5);
        self.exec("true", probe).await.map(|_| ())
    }

    /// Run one command remotely with an explicit timeout.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<CmdOutput, TaskError> {
        self.check_auth()?;

        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=no")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ));

        if let Some(key) = &self.key_path {
            cmd.arg("-i").arg(key);
        }

        cmd.arg(format!("{}@{}", self.user, self.host))
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(host = %self.host, command, "executing remote command");

        let output = tokio::select! {
            output = cmd.output() => output.map_err(|err| {
                TaskError::new(
                    ErrorCode::SshConn,
                    format!("failed to spawn ssh for {}: {err}", self.host),
                )
            })?,
            _ = tokio::time::sleep(timeout) => {
                return Err(TaskError::new(
                    ErrorCode::SshTimeout,
                    format!("command timed out after {}s on {}", timeout.as_secs(), self.host),
                ));
            }
            _ = self.cancel.cancelled() => {
                return Err(TaskError::new(ErrorCode::Cancelled, "task cancelled"));
            }
        };

        let exit_code = output.status.code().unwrap_or(-1);
        let result = CmdOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if exit_code == SSH_EXIT_CONN_FAILURE {
            return Err(TaskError::new(
                ErrorCode::SshConn,
                format!(
                    "ssh connection to {}:{} failed: {}",
                    self.host,
                    self.port,
                    result.stderr.trim()
                ),
            ));
        }

        Ok(result)
    }

    /// Run a command and fail on nonzero exit, returning stdout.
    pub async fn exec_ok(&self, command: &str, timeout: Duration) -> Result<String, TaskError> {
        let output = self.exec(command, timeout).await?;
        if output.exit_code != 0 {
            return Err(TaskError::new(
                ErrorCode::RemoteCmdTransient,
                format!(
                    "command failed (exit {}): {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }
        Ok(output.stdout)
    }

    /// Install an apt package, capped at the package-install timeout.
    pub async fn install_package(&self, package: &str) -> Result<(), TaskError> {
        let command =
            format!("DEBIAN_FRONTEND=noninteractive apt-get install -y {package}");
        self.exec_ok(&command, PKG_INSTALL_TIMEOUT).await.map(|_| ())
    }

    /// Probe whether a local TCP port is listening on the remote host.
    pub async fn check_port(&self, port: u16) -> Result<bool, TaskError> {
        let command = format!(
            "ss -tln 2>/dev/null | grep -q ':{port} ' || nc -z -w5 localhost {port}"
        );
        let output = self.exec(&command, PROBE_TIMEOUT).await?;
        Ok(output.exit_code == 0)
    }

    /// `systemctl is-active` for a unit; returns the status word.
    pub async fn service_status(&self, service: &str) -> Result<String, TaskError> {
        let command = format!("systemctl is-active {service} 2>/dev/null");
        let output = self.exec(&command, PROBE_TIMEOUT).await?;
        let status = output.stdout.trim();
        if status.is_empty() {
            Ok("inactive".to_string())
        } else {
            Ok(status.to_string())
        }
    }

    /// Write a file on the remote host from literal content via a quoted
    /// heredoc, so the content is not shell-expanded.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), TaskError> {
        let command = format!("cat > {path} <<'MAILFLEET_EOF'\n{content}\nMAILFLEET_EOF");
        self.exec_ok(&command, self.cmd_timeout).await.map(|_| ())
    }

    /// The batch transport only supports key-based auth. Password-only rows
    /// pass validation and are rejected here, at connect time.
    fn check_auth(&self) -> Result<(), TaskError> {
        if self.key_path.is_some() {
            return Ok(());
        }
        if self.has_password {
            return Err(TaskError::new(
                ErrorCode::AuthFailed,
                "password authentication is not supported by the batch ssh transport; provide server_key_path",
            ));
        }
        Err(TaskError::new(
            ErrorCode::AuthFailed,
            "no authentication method provided",
        ))
    }
}
