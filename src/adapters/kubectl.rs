use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::AppConfig;
use crate::core::models::Target;
use crate::core::remote::{CommandOutput, RemoteCommand, RemoteCommandChannel};
use crate::error::{Result, TransferError};

/// kubectl's own failures, as opposed to the remote process exiting non-zero.
static KUBECTL_FAILURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?mi)^(unable to connect to the server|error: unable to upgrade connection|error from server \(notfound\): pods? |error from server \(badrequest\): (pod|container)|error: error dialing backend|error: you must be logged in|error: the server doesn't have a resource type)"#,
    )
    .expect("valid regex")
});

/// Runs commands through `kubectl exec`.
///
/// Each call spawns one kubectl process. The process is killed when the
/// call's future is dropped or the timeout expires.
pub struct KubectlChannel {
    binary: String,
    kubeconfig: Option<PathBuf>,
    timeout: Duration,
}

impl KubectlChannel {
    pub fn new(binary: impl Into<String>, kubeconfig: Option<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            kubeconfig,
            timeout,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.kubectl_binary.clone(),
            config.kubeconfig.clone(),
            Duration::from_secs(config.command_timeout_secs),
        )
    }

    fn exec_args(&self, target: &Target, command: &RemoteCommand) -> Vec<String> {
        let mut args = Vec::with_capacity(command.argv().len() + 9);
        if let Some(kubeconfig) = &self.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(kubeconfig.display().to_string());
        }
        args.extend(
            [
                "exec",
                "-n",
                target.namespace.as_str(),
                target.pod.as_str(),
                "-c",
                target.container.as_str(),
                "--",
            ]
            .map(String::from),
        );
        args.extend(command.argv().iter().cloned());
        args
    }

    fn spawn(&self, target: &Target, command: &RemoteCommand) -> Result<tokio::process::Child> {
        debug!(target = %target, command = %command, "kubectl exec");
        Command::new(&self.binary)
            .args(self.exec_args(target, command))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransferError::Connection {
                target: target.to_string(),
                message: format!("failed to start {}: {e}", self.binary),
            })
    }

    fn timed_out(&self, target: &Target, command: &RemoteCommand) -> TransferError {
        TransferError::Timeout {
            target: target.to_string(),
            command: command.to_string(),
            secs: self.timeout.as_secs(),
        }
    }
}

#[async_trait]
impl RemoteCommandChannel for KubectlChannel {
    async fn run(&self, target: &Target, command: &RemoteCommand) -> Result<CommandOutput> {
        let child = self.spawn(target, command)?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| self.timed_out(target, command))??;

        check_status(target, command, output.status, &output.stderr)?;
        trace!(stdout_bytes = output.stdout.len(), "kubectl exec finished");
        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn run_streaming(
        &self,
        target: &Target,
        command: &RemoteCommand,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<u64> {
        let mut child = self.spawn(target, command)?;
        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            return Err(TransferError::Connection {
                target: target.to_string(),
                message: "kubectl stdio pipes unavailable".to_string(),
            });
        };

        let streamed = async {
            let copy = tokio::io::copy(&mut stdout, sink);
            let drain_stderr = async {
                let mut buf = Vec::new();
                stderr.read_to_end(&mut buf).await.map(|_| buf)
            };
            let (copied, stderr_buf) = tokio::try_join!(copy, drain_stderr)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((copied, stderr_buf, status))
        };

        let (copied, stderr_buf, status) = tokio::time::timeout(self.timeout, streamed)
            .await
            .map_err(|_| self.timed_out(target, command))??;

        check_status(target, command, status, &stderr_buf)?;
        Ok(copied)
    }
}

fn check_status(
    target: &Target,
    command: &RemoteCommand,
    status: ExitStatus,
    stderr: &[u8],
) -> Result<()> {
    if status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    Err(classify_failure(target, command, status.code().unwrap_or(-1), stderr))
}

fn classify_failure(
    target: &Target,
    command: &RemoteCommand,
    status: i32,
    stderr: String,
) -> TransferError {
    if KUBECTL_FAILURE.is_match(&stderr) {
        TransferError::Connection {
            target: target.to_string(),
            message: stderr,
        }
    } else {
        TransferError::Command {
            target: target.to_string(),
            command: command.to_string(),
            status,
            stderr,
        }
    }
}
