//! Lifecycle script execution
//!
//! Tunnel configurations may declare PreUp/PostUp/PreDown/PostDown shell
//! commands. Scripts run under the system command interpreter with the
//! tunnel name exposed in the environment, their output line-logged, and a
//! hard timeout. Execution is disabled unless the operator opts in: a
//! config file is not a place arbitrary commands should run from by
//! default.

use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Environment variable carrying the tunnel name into scripts.
pub const TUNNEL_NAME_ENV: &str = "BURROW_TUNNEL_NAME";

/// Overall per-script deadline.
pub const SCRIPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("failed to spawn command interpreter: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to wait for script: {0}")]
    Wait(#[source] std::io::Error),

    #[error("script timed out after {0:?}")]
    Timeout(Duration),

    /// Non-zero exit, spawn failure details already logged; callers only
    /// need the generic signal.
    #[error("script command failed")]
    CommandFailed,
}

/// Runs lifecycle scripts under the safety gate and timeout.
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    enabled: bool,
    timeout: Duration,
}

impl ScriptRunner {
    pub fn new(enabled: bool) -> Self {
        ScriptRunner {
            enabled,
            timeout: SCRIPT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `command` for tunnel `tunnel_name`.
    ///
    /// A no-op for empty commands. When script execution is disabled, the
    /// command is logged and skipped, and the call reports success.
    pub async fn run(&self, command: &str, tunnel_name: &str) -> Result<(), ScriptError> {
        if command.is_empty() {
            return Ok(());
        }
        if !self.enabled {
            info!(
                "skipping script execution, dangerous script execution is disabled: {:?}",
                command
            );
            return Ok(());
        }
        info!("executing: {:?}", command);

        let mut child = interpreter_command(command)
            .env(TUNNEL_NAME_ENV, tunnel_name)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(ScriptError::Spawn)?;

        let stdout_task = child.stdout.take().map(drain_lines);
        let stderr_task = child.stderr.take().map(drain_lines);

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => return Err(ScriptError::Wait(err)),
            Err(_) => {
                if let Err(err) = child.kill().await {
                    warn!("failed to kill timed-out script: {}", err);
                }
                abort_all([stdout_task, stderr_task]);
                return Err(ScriptError::Timeout(self.timeout));
            }
        };

        // The child has exited; the pipes drain to EOF.
        for task in [stdout_task, stderr_task].into_iter().flatten() {
            let _ = task.await;
        }

        if status.success() {
            return Ok(());
        }
        error!("command exit status: {}", status.code().unwrap_or(-1));
        Err(ScriptError::CommandFailed)
    }
}

#[cfg(windows)]
fn interpreter_command(command: &str) -> Command {
    use windows_sys::Win32::System::Threading::{CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW};

    let comspec = std::env::var_os("COMSPEC").unwrap_or_else(|| "cmd.exe".into());
    let mut cmd = Command::new(comspec);
    cmd.arg("/c")
        .arg(command)
        .creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
    cmd
}

#[cfg(not(windows))]
fn interpreter_command(command: &str) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd
}

fn drain_lines<R>(stream: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!("cmd> {}", line);
        }
    })
}

fn abort_all<const N: usize>(tasks: [Option<JoinHandle<()>>; N]) {
    for task in tasks.into_iter().flatten() {
        task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_command_is_a_noop() {
        let runner = ScriptRunner::new(true);
        assert!(runner.run("", "test").await.is_ok());
    }

    #[tokio::test]
    async fn test_gate_disabled_never_spawns() {
        // The command does not exist; if a subprocess were spawned the run
        // would fail rather than report success.
        let runner = ScriptRunner::new(false);
        assert!(runner
            .run("definitely-not-a-real-command-4719", "test")
            .await
            .is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_successful_command() {
        let runner = ScriptRunner::new(true);
        assert!(runner.run("true", "test").await.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_failing_command_collapses_to_generic_error() {
        let runner = ScriptRunner::new(true);
        let err = runner.run("exit 3", "test").await.unwrap_err();
        assert!(matches!(err, ScriptError::CommandFailed));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_tunnel_name_in_environment() {
        let runner = ScriptRunner::new(true);
        let result = runner
            .run("test \"$BURROW_TUNNEL_NAME\" = office", "office")
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_timeout_kills_script() {
        let runner = ScriptRunner::new(true).with_timeout(Duration::from_millis(100));
        let started = std::time::Instant::now();
        let err = runner.run("sleep 30", "test").await.unwrap_err();
        assert!(matches!(err, ScriptError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
