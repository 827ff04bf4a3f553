//! Output formatting utilities for the CLI
//!
//! Tables for forwards and mounts, a session summary and colored status
//! messages.

use std::path::Path;

use tabled::{settings::Style, Table, Tabled};

use sshubl_core::time::{elapsed_since, format_elapsed};
use sshubl_core::{Forward, Mount, SessionState, Target};

/// Format a list of forwards as an ASCII table
///
/// Allocated ports are shown resolved, the original request is kept in the
/// REQUEST column.
pub fn format_forwards(forwards: &[Forward]) -> String {
    if forwards.is_empty() {
        return "No forwards".to_string();
    }

    #[derive(Tabled)]
    struct ForwardRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "FORWARD")]
        forward: String,
        #[tabled(rename = "REQUEST")]
        request: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "AGE")]
        age: String,
    }

    let rows: Vec<ForwardRow> = forwards
        .iter()
        .map(|f| ForwardRow {
            id: f.id.to_string(),
            forward: truncate(&f.to_string(), 60),
            request: format!("{} {}", f.request.direction.flag(), f.request.spec()),
            status: f.status.to_string(),
            age: format_elapsed(elapsed_since(f.created_at)),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format a list of mounts as an ASCII table
pub fn format_mounts(mounts: &[Mount]) -> String {
    if mounts.is_empty() {
        return "No mounts".to_string();
    }

    #[derive(Tabled)]
    struct MountRow {
        #[tabled(rename = "ID")]
        id: String,
        #[tabled(rename = "REMOTE")]
        remote: String,
        #[tabled(rename = "LOCAL")]
        local: String,
        #[tabled(rename = "STATUS")]
        status: String,
        #[tabled(rename = "PID")]
        pid: String,
    }

    let rows: Vec<MountRow> = mounts
        .iter()
        .map(|m| MountRow {
            id: m.id.to_string(),
            remote: truncate(&m.remote_path.display().to_string(), 40),
            local: truncate(&m.local_path.display().to_string(), 50),
            status: m.status.to_string(),
            pid: m
                .pid
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    Table::new(rows).with(Style::rounded()).to_string()
}

/// Format a session header as a human-readable string
pub fn format_session(target: &Target, state: SessionState, socket: &Path, created_at: u64) -> String {
    let mut output = String::new();
    output.push_str(&format!("Session: {}\n", target));
    output.push_str(&format!("State: {}\n", state));
    output.push_str(&format!("Control socket: {}\n", socket.display()));
    output.push_str(&format!(
        "Uptime: {}\n",
        format_elapsed(elapsed_since(created_at))
    ));
    output
}

/// Truncate a string with ellipsis if too long
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Print a success message in green with a checkmark prefix
pub fn print_success(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Green),
        Print("✓ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print an error message in red with an X prefix
///
/// Outputs to stderr.
pub fn print_error(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Red),
        Print("✗ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

/// Print a warning message in yellow to stderr
pub fn print_warning(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stderr = std::io::stderr();
    let _ = crossterm::execute!(
        stderr,
        SetForegroundColor(Color::Yellow),
        Print("⚠ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}

pub fn print_info(msg: &str) {
    use crossterm::style::{Color, Print, ResetColor, SetForegroundColor};

    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        SetForegroundColor(Color::Cyan),
        Print("ℹ "),
        ResetColor,
        Print(msg),
        Print("\n")
    );
}
