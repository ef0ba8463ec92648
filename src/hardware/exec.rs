//! Command Execution
//!
//! Every host tool the agent drives (`modprobe`, `losetup`, `pvcreate`,
//! `nvme`, ...) goes through [`ShellExec`] so adapters can be tested
//! against scripted output.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Captured result of one command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Stdout followed by stderr, for error messages
    pub fn combined(&self) -> String {
        let mut out = String::from_utf8_lossy(&self.stdout).trim_end().to_string();
        let err = String::from_utf8_lossy(&self.stderr);
        let err = err.trim_end();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }
}

/// Runs a program to completion
#[async_trait]
pub trait ShellExec: Send + Sync {
    /// Run `program` with `args`; a non-zero exit is not an error here
    async fn exec_cmd(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

pub type ShellExecRef = Arc<dyn ShellExec>;

/// Spawns real processes with tokio
#[derive(Debug, Clone, Default)]
pub struct CommandExec;

impl CommandExec {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ShellExec for CommandExec {
    async fn exec_cmd(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        debug!("exec: {} {}", program, args.join(" "));

        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::tool(program, e.to_string()))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Run a command and fail with its diagnostic output on a non-zero exit
pub async fn run_checked(
    exec: &dyn ShellExec,
    program: &str,
    args: &[&str],
) -> Result<CommandOutput> {
    let output = exec.exec_cmd(program, args).await?;
    if !output.success() {
        return Err(Error::tool(
            format!("{} {}", program, args.join(" ")),
            format!("exit code {:?}: {}", output.code, output.combined()),
        ));
    }
    Ok(output)
}
