//! Process runner backed by `tokio::process` and native PTYs

use async_trait::async_trait;
use std::io;
use std::process::Stdio;

use sshubl_core::traits::{CommandOutput, CommandRunner, Invocation, PtyProcess};
use sshubl_core::TerminalSize;

use super::pty::NativePty;

/// Runs real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        tracing::debug!("Running {}", invocation);

        let output = tokio::process::Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn spawn_pty(
        &self,
        invocation: &Invocation,
        size: TerminalSize,
    ) -> io::Result<Box<dyn PtyProcess>> {
        tracing::debug!("Spawning {} in a PTY", invocation);
        let invocation = invocation.clone();
        let pty = tokio::task::spawn_blocking(move || NativePty::spawn(&invocation, size))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Ok(Box::new(pty))
    }
}
