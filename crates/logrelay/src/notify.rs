// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Post-rotation notification.
//!
//! After a file was rotated its writer still holds the old file open. The
//! input's post-rotate action tells the writer to reopen: run a shell command,
//! signal the pid from a pidfile, or signal every process matching a pattern.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::registry::{LogInput, PostRotateAction};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("post-rotate command {command:?} exited with {status}")]
    Command { command: String, status: String },
    #[error("post-rotate io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid pidfile {path}: {reason}")]
    Pidfile { path: String, reason: String },
    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },
    #[error("no process matches {0:?}")]
    NoProcess(String),
}

/// Called once for every file the agent rotated.
#[async_trait]
pub trait RotationHook: Send + Sync {
    async fn rotated(&self, input: &LogInput) -> Result<(), NotifyError>;
}

/// Runs the input's configured post-rotate action, if any.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostRotateNotifier;

#[async_trait]
impl RotationHook for PostRotateNotifier {
    async fn rotated(&self, input: &LogInput) -> Result<(), NotifyError> {
        match input.post_rotate() {
            None => Ok(()),
            Some(PostRotateAction::Command(command)) => run_command(&command).await,
            Some(PostRotateAction::Pidfile { path, signal }) => {
                let display = path.display().to_string();
                let contents = tokio::fs::read_to_string(&path).await?;
                let pid = contents.trim();
                if pid.is_empty() {
                    return Err(NotifyError::Pidfile {
                        path: display,
                        reason: "empty".to_string(),
                    });
                }
                // 0 and negative values would signal process groups or everything.
                let pid = match pid.parse::<i32>() {
                    Ok(n) if n > 0 => n,
                    _ => {
                        return Err(NotifyError::Pidfile {
                            path: display,
                            reason: format!("not a pid: {pid:?}"),
                        })
                    }
                };
                send(pid, resolve_signal(signal.as_deref()))
            }
            Some(PostRotateAction::Match { pattern, signal }) => {
                signal_matching(&pattern, resolve_signal(signal.as_deref())).await
            }
        }
    }
}

/// Maps `HUP`, `TERM`, `USR1`, `USR2` (with or without `SIG`) to a signal.
/// Anything else, including nothing, is `SIGHUP`.
#[must_use]
pub fn resolve_signal(name: Option<&str>) -> Signal {
    let name = name.unwrap_or_default().trim().to_ascii_uppercase();
    match name.strip_prefix("SIG").unwrap_or(&name) {
        "TERM" => Signal::SIGTERM,
        "USR1" => Signal::SIGUSR1,
        "USR2" => Signal::SIGUSR2,
        _ => Signal::SIGHUP,
    }
}

async fn run_command(command: &str) -> Result<(), NotifyError> {
    let status = Command::new("/bin/sh").arg("-c").arg(command).status().await?;
    if status.success() {
        debug!("Post-rotate command {command:?} succeeded");
        Ok(())
    } else {
        Err(NotifyError::Command {
            command: command.to_string(),
            status: status.to_string(),
        })
    }
}

fn send(pid: i32, signal: Signal) -> Result<(), NotifyError> {
    kill(Pid::from_raw(pid), signal).map_err(|source| NotifyError::Signal { pid, source })?;
    debug!("Sent {signal} to pid {pid}");
    Ok(())
}

async fn signal_matching(pattern: &str, signal: Signal) -> Result<(), NotifyError> {
    let output = Command::new("pgrep").arg("-f").arg(pattern).output().await?;
    let own = std::process::id();
    let pids: Vec<i32> = String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .filter_map(|pid| pid.parse().ok())
        .filter(|pid| *pid > 0)
        .filter(|pid| u32::try_from(*pid).map_or(true, |pid| pid != own))
        .collect();
    if pids.is_empty() {
        return Err(NotifyError::NoProcess(pattern.to_string()));
    }
    for pid in pids {
        if let Err(e) = send(pid, signal) {
            debug!("{e}");
        }
    }
    Ok(())
}
