//! Child process abstractions

use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::types::TerminalSize;

/// A program and its arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Whether `needle` appears among the arguments
    pub fn has_arg(&self, needle: &str) -> bool {
        self.args.iter().any(|a| a == needle)
    }

    /// Value following `-O`, for mux requests
    pub fn mux_command(&self) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == "-O")
            .and_then(|idx| self.args.get(idx + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " {:?}", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Result of a completed one-shot process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Exit code 0
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Spawns child processes
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, capturing stdout and stderr
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput>;

    /// Spawn inside a pseudo-terminal
    async fn spawn_pty(
        &self,
        invocation: &Invocation,
        size: TerminalSize,
    ) -> io::Result<Box<dyn PtyProcess>>;
}

/// A child process attached to a pseudo-terminal
#[async_trait]
pub trait PtyProcess: Send {
    /// Process id, if the platform exposes it
    fn pid(&self) -> Option<u32>;

    /// Next chunk of terminal output, `None` once the terminal is closed
    async fn read(&mut self) -> io::Result<Option<Bytes>>;

    /// Write terminal input
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// Resize the terminal
    fn resize(&self, size: TerminalSize) -> io::Result<()>;

    /// Exit code if the process has exited
    fn try_wait(&mut self) -> io::Result<Option<i32>>;

    /// Wait for the process to exit
    async fn wait(&mut self) -> io::Result<i32>;

    /// Terminate the process
    async fn kill(&mut self) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invocation_builder_and_display() {
        let inv = Invocation::new("/usr/bin/ssh")
            .arg("-O")
            .arg("check")
            .args(["-oProxyCommand=exit 1", "destination"]);

        assert_eq!(inv.mux_command(), Some("check"));
        assert!(inv.has_arg("destination"));
        assert_eq!(
            inv.to_string(),
            r#"/usr/bin/ssh -O check "-oProxyCommand=exit 1" destination"#
        );
    }

    #[test]
    fn test_command_output_helpers() {
        assert!(CommandOutput::ok("").success());
        let failed = CommandOutput::failed(255, "boom");
        assert!(!failed.success());
        assert_eq!(failed.stderr, "boom");
        assert!(!CommandOutput::default().success());
    }
}
