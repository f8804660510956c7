//! External collaborators driven through configured commands
//!
//! Restarting the backend, checking that it is alive and injecting input into
//! the desktop application all happen outside this process. The proxy only
//! sees them through the traits below.

use crate::config::ControlConfig;
use crate::error::ControlError;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Restart and liveness of the backend service
#[async_trait]
pub trait BackendControl: Send + Sync {
    async fn restart_backend(&self) -> Result<(), ControlError>;
    async fn is_alive(&self) -> Result<bool, ControlError>;
}

/// Delivers a text message into the desktop application
#[async_trait]
pub trait InputInjector: Send + Sync {
    async fn inject(&self, message: &str) -> Result<(), ControlError>;
}

/// Captured result of a finished command
#[derive(Debug)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Run a shell-words command line with extra trailing arguments.
///
/// The child is killed when the timeout elapses.
pub async fn run_command(
    command_line: &str,
    extra_args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, ControlError> {
    let mut words = shell_words::split(command_line)
        .map_err(|e| ControlError::InvalidCommand(e.to_string()))?;
    if words.is_empty() {
        return Err(ControlError::InvalidCommand("empty command".to_string()));
    }
    let program = words.remove(0);

    let mut cmd = Command::new(&program);
    cmd.args(&words);
    cmd.args(extra_args);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    debug!(program = %program, args = words.len() + extra_args.len(), "Running command");

    let child = cmd.spawn()?;
    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result?,
        Err(_) => return Err(ControlError::Timeout(timeout.as_secs())),
    };

    Ok(CommandOutput {
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Like [`run_command`] but non-zero exit codes become errors
pub async fn run_checked(
    command_line: &str,
    extra_args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, ControlError> {
    let output = run_command(command_line, extra_args, timeout).await?;
    if output.status != 0 {
        return Err(ControlError::Failed {
            status: output.status,
            stderr: output.stderr,
        });
    }
    Ok(output)
}

/// [`BackendControl`] backed by configured commands
pub struct CommandControl {
    restart_command: Option<String>,
    alive_command: Option<String>,
    timeout: Duration,
}

impl CommandControl {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            restart_command: config.restart_command.clone(),
            alive_command: config.alive_command.clone(),
            timeout: config.command_timeout(),
        }
    }
}

#[async_trait]
impl BackendControl for CommandControl {
    async fn restart_backend(&self) -> Result<(), ControlError> {
        let command = self
            .restart_command
            .as_deref()
            .ok_or(ControlError::NotConfigured("restart"))?;
        info!(command, "Restarting backend");
        run_checked(command, &[], self.timeout).await?;
        Ok(())
    }

    async fn is_alive(&self) -> Result<bool, ControlError> {
        let command = self
            .alive_command
            .as_deref()
            .ok_or(ControlError::NotConfigured("liveness"))?;
        // pgrep-style commands signal "not found" with a non-zero exit
        let output = run_command(command, &[], self.timeout).await?;
        Ok(output.status == 0)
    }
}

/// [`InputInjector`] passing the message as the final argument of a command
pub struct CommandInjector {
    command: Option<String>,
    timeout: Duration,
}

impl CommandInjector {
    pub fn new(config: &ControlConfig) -> Self {
        Self {
            command: config.input_command.clone(),
            timeout: config.command_timeout(),
        }
    }
}

#[async_trait]
impl InputInjector for CommandInjector {
    async fn inject(&self, message: &str) -> Result<(), ControlError> {
        let command = self
            .command
            .as_deref()
            .ok_or(ControlError::NotConfigured("input"))?;
        if let Err(e) = run_checked(command, &[message], self.timeout).await {
            warn!(error = %e, "Input injection failed");
            return Err(e);
        }
        debug!(length = message.len(), "Message injected");
        Ok(())
    }
}
