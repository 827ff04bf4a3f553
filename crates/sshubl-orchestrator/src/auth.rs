//! Login dialogue with the master connection process
//!
//! The master runs inside a pseudo-terminal. Its output is scanned for
//! prompts, each prompt is handed to the [`PromptHandler`] and the answer is
//! typed back. Any cancellation kills the process and removes the control
//! socket it may have created.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use sshubl_core::config::Settings;
use sshubl_core::error::AuthError;
use sshubl_core::traits::{PromptHandler, PromptKind, PromptRequest, PromptResponse, PtyProcess};
use sshubl_core::{Target, TerminalSize};

use crate::channel::ControlChannel;

/// Parameters of one login dialogue
#[derive(Clone)]
pub struct LoginOptions {
    /// Time allowed for the process to make progress between two prompts
    pub login_timeout: Duration,
    /// Answer to the first password prompt
    pub password: Option<String>,
}

impl LoginOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            login_timeout: settings.ssh_login_timeout,
            password: None,
        }
    }

    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }
}

impl std::fmt::Debug for LoginOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginOptions")
            .field("login_timeout", &self.login_timeout)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Spawn the master for `channel` and drive it through authentication
pub(crate) async fn login(
    channel: &ControlChannel,
    options: &LoginOptions,
    prompt: &dyn PromptHandler,
    cancel: &CancellationToken,
) -> Result<(), AuthError> {
    if cancel.is_cancelled() {
        return Err(AuthError::Cancelled);
    }

    let invocation = channel.master_invocation();
    tracing::debug!("Starting master: {}", invocation);
    let mut pty = channel
        .runner()
        .spawn_pty(&invocation, TerminalSize::default())
        .await?;

    let mut dialogue = Dialogue {
        target: channel.target(),
        timeout: options.login_timeout,
        password: options.password.clone(),
    };

    if let Err(e) = dialogue.run(pty.as_mut(), prompt, cancel).await {
        tracing::debug!("Login to {} aborted: {}", channel.target(), e);
        if let Err(kill_err) = pty.kill().await {
            tracing::warn!("Could not kill master for {}: {}", channel.target(), kill_err);
        }
        discard_socket(channel);
        return Err(e);
    }

    // the foreground process exited 0 once the master went to the background
    if channel.is_alive().await {
        Ok(())
    } else {
        discard_socket(channel);
        Err(AuthError::Unreachable(
            "master exited without serving its control socket".into(),
        ))
    }
}

fn discard_socket(channel: &ControlChannel) {
    if let Err(e) = channel.remove_socket_file() {
        tracing::warn!(
            "Could not remove control socket {}: {}",
            channel.socket_path().display(),
            e
        );
    }
}

struct Dialogue<'a> {
    target: &'a Target,
    timeout: Duration,
    password: Option<String>,
}

impl Dialogue<'_> {
    async fn run(
        &mut self,
        pty: &mut dyn PtyProcess,
        prompt: &dyn PromptHandler,
        cancel: &CancellationToken,
    ) -> Result<(), AuthError> {
        // output since the last answered prompt
        let mut transcript = String::new();

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                read = tokio::time::timeout(self.timeout, pty.read()) => read,
            };
            let chunk = match read {
                Err(_) => return Err(AuthError::Timeout(self.timeout)),
                Ok(Ok(Some(chunk))) => chunk,
                Ok(Ok(None)) => break,
                // the terminal reports EIO once the process is gone
                Ok(Err(e)) => {
                    tracing::debug!("Master terminal closed: {}", e);
                    break;
                }
            };
            transcript.push_str(&String::from_utf8_lossy(&chunk));

            if let Some(failure) = detect_failure(&transcript) {
                return Err(failure);
            }
            if let Some(kind) = detect_prompt(&transcript) {
                let message = prompt_message(kind, &transcript);
                transcript.clear();
                self.answer(kind, message, pty, prompt, cancel).await?;
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AuthError::Cancelled),
            status = tokio::time::timeout(self.timeout, pty.wait()) => status,
        };
        match status {
            Err(_) => Err(AuthError::Timeout(self.timeout)),
            Ok(Ok(0)) => Ok(()),
            Ok(Ok(code)) => Err(classify_exit(code, &transcript)),
            Ok(Err(e)) => Err(AuthError::Io(e)),
        }
    }

    async fn answer(
        &mut self,
        kind: PromptKind,
        message: String,
        pty: &mut dyn PtyProcess,
        prompt: &dyn PromptHandler,
        cancel: &CancellationToken,
    ) -> Result<(), AuthError> {
        let preset = match kind {
            PromptKind::Password => self.password.take(),
            _ => None,
        };

        let response = match preset {
            Some(password) => {
                tracing::debug!("Answering password prompt with the provided password");
                PromptResponse::Secret(password)
            }
            None => {
                let request = PromptRequest {
                    kind,
                    target: self.target.clone(),
                    message,
                };
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(AuthError::Cancelled),
                    response = prompt.prompt(request) => {
                        response.map_err(|_| AuthError::Cancelled)?
                    }
                }
            }
        };

        let line = match (kind, response) {
            (PromptKind::HostKeyConfirmation, PromptResponse::Accept) => "yes".to_string(),
            (PromptKind::HostKeyConfirmation, PromptResponse::Reject) => {
                if let Err(e) = pty.write(b"no\n").await {
                    tracing::debug!("Could not decline the host key: {}", e);
                }
                return Err(AuthError::HostKeyRejected(format!(
                    "host key of {} was not accepted",
                    self.target
                )));
            }
            (_, PromptResponse::Secret(secret)) => secret,
            (_, PromptResponse::Accept) => String::new(),
            (_, PromptResponse::Reject) => return Err(AuthError::Cancelled),
        };

        let mut data = line.into_bytes();
        data.push(b'\n');
        pty.write(&data).await?;
        Ok(())
    }
}

fn last_line(text: &str) -> &str {
    text.trim_end()
        .rsplit(['\n', '\r'])
        .next()
        .unwrap_or_default()
        .trim()
}

/// Prompt awaiting an answer at the end of `transcript`
fn detect_prompt(transcript: &str) -> Option<PromptKind> {
    let line = last_line(transcript).to_ascii_lowercase();
    if line.contains("are you sure you want to continue connecting") {
        Some(PromptKind::HostKeyConfirmation)
    } else if line.starts_with("enter passphrase for") && line.ends_with(':') {
        Some(PromptKind::Passphrase)
    } else if line.ends_with("password:") {
        Some(PromptKind::Password)
    } else {
        None
    }
}

fn prompt_message(kind: PromptKind, transcript: &str) -> String {
    match kind {
        // fingerprint lines precede the question
        PromptKind::HostKeyConfirmation => transcript.trim().replace('\r', ""),
        _ => last_line(transcript).to_string(),
    }
}

/// Failures that end the dialogue regardless of exit status
fn detect_failure(transcript: &str) -> Option<AuthError> {
    let line_with = |needle: &str| {
        transcript
            .lines()
            .find(|line| line.to_ascii_lowercase().contains(needle))
            .map(|line| line.trim().to_string())
    };

    if let Some(line) = line_with("permission denied") {
        return Some(AuthError::WrongCredentials(line));
    }
    if let Some(line) = line_with("remote host identification has changed")
        .or_else(|| line_with("host key verification failed"))
    {
        return Some(AuthError::HostKeyRejected(line));
    }
    None
}

fn classify_exit(code: i32, transcript: &str) -> AuthError {
    if let Some(failure) = detect_failure(transcript) {
        return failure;
    }
    let reason = transcript
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| format!("ssh exited with status {}", code));
    AuthError::Unreachable(reason)
}
