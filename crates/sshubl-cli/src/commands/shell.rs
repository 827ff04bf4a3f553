//! `shell`: interactive shell over the control master

use std::io::{stdout, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, size};
use tokio::sync::mpsc;

use super::check::master_running;
use crate::output::{print_error, print_info};
use crate::prompt::TerminalPrompt;
use sshubl_core::traits::PromptHandler;
use sshubl_core::{ConnectionString, Settings, TerminalSize};
use sshubl_orchestrator::{SessionManager, TerminalHandle};

pub async fn shell_command(settings: Settings, target: &str) -> Result<()> {
    let connection: ConnectionString = target
        .parse()
        .with_context(|| format!("Invalid target: {}", target))?;
    let target = connection.target.clone();

    // a master started by another process is left running
    let shared = master_running(&settings, &target).await?;

    let manager = SessionManager::new(settings);
    let prompt: Arc<dyn PromptHandler> = Arc::new(TerminalPrompt::new());
    let session = manager
        .connect(connection, prompt)
        .await
        .with_context(|| format!("Failed to connect to {}", target))?;

    let terminal_size = size()
        .map(|(cols, rows)| TerminalSize { rows, cols })
        .unwrap_or_default();
    let terminal = session
        .open_terminal(terminal_size)
        .await
        .with_context(|| format!("Failed to open a shell on {}", target))?;

    print_info("Press Ctrl+] to detach");
    let result = run_terminal(terminal).await;

    if !shared {
        let report = manager.disconnect_all().await;
        for failure in &report.failures {
            print_error(&failure.to_string());
        }
    }

    result
}

/// Pump keystrokes to the shell and its output to stdout
///
/// Returns when the shell exits or the user detaches (Ctrl+]).
async fn run_terminal(mut terminal: TerminalHandle) -> Result<()> {
    enable_raw_mode()?;
    let mut out = stdout();

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(256);
    let event_handle = tokio::task::spawn_blocking(move || loop {
        if event::poll(Duration::from_millis(10)).unwrap_or(false) {
            if let Ok(evt) = event::read() {
                if event_tx.blocking_send(evt).is_err() {
                    break;
                }
            }
        } else if event_tx.is_closed() {
            break;
        }
    });

    let result = async {
        loop {
            tokio::select! {
                Some(evt) = event_rx.recv() => match evt {
                    Event::Key(KeyEvent { code, modifiers, kind, .. }) => {
                        if kind == KeyEventKind::Release {
                            continue;
                        }
                        if modifiers.contains(KeyModifiers::CONTROL) && code == KeyCode::Char(']') {
                            break;
                        }
                        let data = key_to_bytes(code, modifiers);
                        if !data.is_empty() {
                            terminal.write(&data).await?;
                        }
                    }
                    Event::Paste(text) => terminal.write(text.as_bytes()).await?,
                    Event::Resize(cols, rows) => {
                        if let Err(e) = terminal.resize(TerminalSize { rows, cols }) {
                            tracing::debug!("Resize failed: {}", e);
                        }
                    }
                    _ => {}
                },

                output = terminal.read() => match output? {
                    Some(data) => {
                        out.write_all(&data)?;
                        out.flush()?;
                    }
                    None => break,
                },
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    drop(event_rx);
    disable_raw_mode()?;
    if let Err(e) = event_handle.await {
        tracing::debug!("Terminal event reader failed: {}", e);
    }

    match terminal.close().await {
        Ok(code) => tracing::debug!("Shell exited with {}", code),
        Err(e) => tracing::warn!("Failed to close shell: {}", e),
    }

    result
}

/// Convert a key event to the bytes a terminal would send
fn key_to_bytes(code: KeyCode, modifiers: KeyModifiers) -> Vec<u8> {
    use KeyCode::*;

    match code {
        Char(c) => {
            if modifiers.contains(KeyModifiers::CONTROL) && c.is_ascii_alphabetic() {
                // Ctrl+A = 0x01, Ctrl+B = 0x02, etc.
                vec![(c.to_ascii_lowercase() as u8) - b'a' + 1]
            } else if modifiers.contains(KeyModifiers::ALT) {
                let mut bytes = vec![0x1b];
                bytes.extend(c.to_string().into_bytes());
                bytes
            } else {
                c.to_string().into_bytes()
            }
        }
        Enter => vec![b'\r'],
        Tab => vec![b'\t'],
        BackTab => vec![0x1b, b'[', b'Z'],
        Backspace => vec![0x7f],
        Esc => vec![0x1b],
        Up => vec![0x1b, b'[', b'A'],
        Down => vec![0x1b, b'[', b'B'],
        Right => vec![0x1b, b'[', b'C'],
        Left => vec![0x1b, b'[', b'D'],
        Home => vec![0x1b, b'[', b'H'],
        End => vec![0x1b, b'[', b'F'],
        PageUp => vec![0x1b, b'[', b'5', b'~'],
        PageDown => vec![0x1b, b'[', b'6', b'~'],
        Delete => vec![0x1b, b'[', b'3', b'~'],
        Insert => vec![0x1b, b'[', b'2', b'~'],
        F(n @ 1..=4) => vec![0x1b, b'O', b'P' + (n - 1)],
        F(n @ 5..=12) => {
            let code: &[u8] = match n {
                5 => b"15",
                6 => b"17",
                7 => b"18",
                8 => b"19",
                9 => b"20",
                10 => b"21",
                11 => b"23",
                _ => b"24",
            };
            let mut bytes = vec![0x1b, b'['];
            bytes.extend_from_slice(code);
            bytes.push(b'~');
            bytes
        }
        _ => vec![],
    }
}
