//! Pseudo-terminal child processes
//!
//! Wraps a `portable-pty` pair. The blocking master reader runs on its own
//! thread and hands chunks over through a channel.

use async_trait::async_trait;
use bytes::Bytes;
use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

use sshubl_core::traits::{Invocation, PtyProcess};
use sshubl_core::TerminalSize;

/// Exit polling period of [`NativePty::wait`]
const WAIT_POLL: Duration = Duration::from_millis(50);

/// A process running inside a native pseudo-terminal
pub struct NativePty {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    output: mpsc::Receiver<Bytes>,
    pid: Option<u32>,
}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pty_error(context: &str, err: impl std::fmt::Display) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("{}: {}", context, err))
}

impl NativePty {
    /// Spawn `invocation` attached to a new pseudo-terminal
    pub fn spawn(invocation: &Invocation, size: TerminalSize) -> io::Result<Self> {
        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| pty_error("failed to open PTY", e))?;

        let mut cmd = CommandBuilder::new(&invocation.program);
        cmd.args(&invocation.args);
        if std::env::var_os("TERM").is_none() {
            cmd.env("TERM", "xterm-256color");
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| pty_error("failed to spawn process", e))?;
        // the child holds its own copy, keeping ours would delay EOF
        drop(pair.slave);

        let pid = child.process_id();
        tracing::debug!("Spawned {} in PTY (pid {:?})", invocation.program.display(), pid);

        let mut reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| pty_error("failed to clone PTY reader", e))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| pty_error("failed to take PTY writer", e))?;

        let (tx, output) = mpsc::channel(64);
        std::thread::Builder::new()
            .name("sshubl-pty-reader".into())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                                break;
                            }
                        }
                    }
                }
            })?;

        Ok(Self {
            master: pair.master,
            child,
            writer: Arc::new(Mutex::new(writer)),
            output,
            pid,
        })
    }
}

#[async_trait]
impl PtyProcess for NativePty {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        Ok(self.output.recv().await)
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let writer = Arc::clone(&self.writer);
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut writer = writer
                .lock()
                .map_err(|_| pty_error("PTY writer", "lock poisoned"))?;
            writer.write_all(&data)?;
            writer.flush()
        })
        .await
        .map_err(|e| pty_error("PTY write task", e))?
    }

    fn resize(&self, size: TerminalSize) -> io::Result<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| pty_error("failed to resize PTY", e))
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()?
            .map(|status| status.exit_code() as i32))
    }

    async fn wait(&mut self) -> io::Result<i32> {
        loop {
            if let Some(code) = self.try_wait()? {
                return Ok(code);
            }
            tokio::time::sleep(WAIT_POLL).await;
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        if self.try_wait()?.is_some() {
            return Ok(());
        }
        if let Err(e) = self.child.kill() {
            // it may have exited in between
            if self.try_wait()?.is_none() {
                return Err(e);
            }
        }
        self.wait().await.map(|_| ())
    }
}
