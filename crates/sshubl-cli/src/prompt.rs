//! Terminal prompts for passwords, host keys and reconnection

use std::io::{self, Write};

use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::Print;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use crossterm::tty::IsTty;
use tokio::sync::Mutex;

use crate::output::{print_info, print_warning};
use sshubl_core::traits::{PromptCancelled, PromptHandler, PromptKind, PromptRequest, PromptResponse};

/// Asks the user on the controlling terminal
///
/// Secrets are read in raw mode without echo. While a reconnection is
/// running, Ctrl-C gives up on it.
#[derive(Debug, Default)]
pub struct TerminalPrompt {
    // one question on the terminal at a time
    input: Mutex<()>,
}

impl TerminalPrompt {
    pub fn new() -> Self {
        Self::default()
    }

    async fn read_input(&self, label: String, echo: bool) -> Result<String, PromptCancelled> {
        if !io::stdin().is_tty() {
            tracing::warn!("stdin is not a terminal, cannot answer: {}", label);
            return Err(PromptCancelled);
        }

        let _guard = self.input.lock().await;
        let read = tokio::task::spawn_blocking(move || {
            let mut stderr = io::stderr();
            write!(stderr, "{}", label)?;
            stderr.flush()?;
            read_line_raw(echo)
        })
        .await;

        match read {
            Ok(Ok(Some(line))) => Ok(line),
            Ok(Ok(None)) => Err(PromptCancelled),
            Ok(Err(e)) => {
                tracing::warn!("Failed to read from terminal: {}", e);
                Err(PromptCancelled)
            }
            Err(e) => {
                tracing::warn!("Terminal reader failed: {}", e);
                Err(PromptCancelled)
            }
        }
    }
}

#[async_trait]
impl PromptHandler for TerminalPrompt {
    async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, PromptCancelled> {
        match request.kind {
            PromptKind::Password | PromptKind::Passphrase => {
                let label = secret_label(&request);
                self.read_input(label, false)
                    .await
                    .map(PromptResponse::Secret)
            }
            PromptKind::HostKeyConfirmation => {
                eprintln!("{}", request.message.trim_end());
                let answer = self
                    .read_input("Trust this host key? [yes/no]: ".to_string(), true)
                    .await?;
                Ok(confirmation(&answer))
            }
            PromptKind::CancelConfirmation => {
                print_warning(&format!("{}: {}", request.target, request.message));
                print_info("Press Ctrl-C to stop reconnecting");
                match tokio::signal::ctrl_c().await {
                    Ok(()) => Ok(PromptResponse::Reject),
                    Err(e) => {
                        tracing::warn!("Cannot listen for Ctrl-C: {}", e);
                        std::future::pending().await
                    }
                }
            }
        }
    }
}

fn secret_label(request: &PromptRequest) -> String {
    let message = request.message.trim();
    if message.is_empty() {
        match request.kind {
            PromptKind::Passphrase => "Passphrase: ".to_string(),
            _ => format!("{}'s password: ", request.target),
        }
    } else if message.ends_with(':') {
        format!("{} ", message)
    } else {
        format!("{}: ", message)
    }
}

fn confirmation(answer: &str) -> PromptResponse {
    match answer.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => PromptResponse::Accept,
        _ => PromptResponse::Reject,
    }
}

/// Read one line in raw mode; `None` when the user pressed Ctrl-C or Esc
fn read_line_raw(echo: bool) -> io::Result<Option<String>> {
    enable_raw_mode()?;
    let line = read_keys(echo);
    let restored = disable_raw_mode();
    eprintln!();
    let line = line?;
    restored?;
    Ok(line)
}

fn read_keys(echo: bool) -> io::Result<Option<String>> {
    let mut line = String::new();
    let mut stderr = io::stderr();

    loop {
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = event::read()?
        else {
            continue;
        };
        if kind == KeyEventKind::Release {
            continue;
        }

        match code {
            KeyCode::Enter => return Ok(Some(line)),
            KeyCode::Esc => return Ok(None),
            KeyCode::Char('c') | KeyCode::Char('d') if modifiers.contains(KeyModifiers::CONTROL) => {
                return Ok(None)
            }
            KeyCode::Backspace => {
                if line.pop().is_some() && echo {
                    crossterm::execute!(stderr, Print("\u{8} \u{8}"))?;
                }
            }
            KeyCode::Char(c) => {
                line.push(c);
                if echo {
                    crossterm::execute!(stderr, Print(c))?;
                }
            }
            _ => {}
        }
    }
}
