//! `check`: is a control master running for a target

use anyhow::{Context, Result};

use crate::output::{print_success, print_warning};
use sshubl_core::{ConnectionString, Settings, Target};
use sshubl_orchestrator::{Backend, ControlChannel};

/// Report whether a master answers at the target's control socket
///
/// Returns `false` when none does.
pub async fn check_command(settings: &Settings, target: &str) -> Result<bool> {
    let target = parse_target(target)?;
    let channel = ControlChannel::new(target.clone(), settings, &Backend::system())
        .with_context(|| format!("Cannot check {}", target))?;

    if channel.is_alive().await {
        let pid = channel
            .master_pid()
            .map(|p| format!(" (pid {})", p))
            .unwrap_or_default();
        print_success(&format!(
            "Master for {} is running{} at {}",
            target,
            pid,
            channel.socket_path().display()
        ));
        Ok(true)
    } else {
        print_warning(&format!("No master running for {}", target));
        Ok(false)
    }
}

/// Whether a master for `target` is already up
pub(crate) async fn master_running(settings: &Settings, target: &Target) -> Result<bool> {
    let channel = ControlChannel::new(target.clone(), settings, &Backend::system())
        .with_context(|| format!("Cannot check {}", target))?;
    Ok(channel.is_alive().await)
}

/// Parse a connection string, ignoring any password
fn parse_target(s: &str) -> Result<Target> {
    let connection: ConnectionString = s
        .parse()
        .with_context(|| format!("Invalid target: {}", s))?;
    Ok(connection.target)
}
