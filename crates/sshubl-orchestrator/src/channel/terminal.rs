//! Interactive shell handle

use bytes::Bytes;
use std::io;

use sshubl_core::traits::PtyProcess;
use sshubl_core::TerminalSize;

/// Duplex byte stream to a remote shell running over a control channel
pub struct TerminalHandle {
    pty: Box<dyn PtyProcess>,
}

impl TerminalHandle {
    pub(crate) fn new(pty: Box<dyn PtyProcess>) -> Self {
        Self { pty }
    }

    /// Local pid of the ssh client
    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }

    /// Next chunk of shell output, `None` once the shell exited
    pub async fn read(&mut self) -> io::Result<Option<Bytes>> {
        self.pty.read().await
    }

    /// Send keystrokes to the shell
    pub async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.pty.write(data).await
    }

    pub fn resize(&self, size: TerminalSize) -> io::Result<()> {
        self.pty.resize(size)
    }

    /// Exit code if the shell has exited
    pub fn try_wait(&mut self) -> io::Result<Option<i32>> {
        self.pty.try_wait()
    }

    /// Terminate the shell, returning its exit code
    pub async fn close(mut self) -> io::Result<i32> {
        if let Some(code) = self.pty.try_wait()? {
            return Ok(code);
        }
        self.pty.kill().await?;
        self.pty.wait().await
    }
}

impl std::fmt::Debug for TerminalHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TerminalHandle")
            .field("pid", &self.pid())
            .finish()
    }
}
