//! `up`: hold a session with its forwards and mounts until interrupted

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

use crate::output::{
    format_forwards, format_mounts, format_session, print_error, print_info, print_success,
    print_warning,
};
use crate::prompt::TerminalPrompt;
use sshubl_core::traits::PromptHandler;
use sshubl_core::{ConnectionString, ForwardDirection, ForwardRequest, SessionState, Settings};
use sshubl_orchestrator::{Session, SessionEvent, SessionManager};

#[derive(Debug, Args)]
pub struct UpArgs {
    /// Connection string: [user[:password]@]host[:port]
    pub target: String,

    /// Local forward, as for ssh -L ([bind:]port:host:hostport, port 0 allocates)
    #[arg(short = 'L', long = "local", value_name = "SPEC")]
    pub local: Vec<String>,

    /// Reverse forward, as for ssh -R
    #[arg(short = 'R', long = "remote", value_name = "SPEC")]
    pub remote: Vec<String>,

    /// Mount a remote directory: remote[:local]
    #[arg(short = 'm', long = "mount", value_name = "REMOTE[:LOCAL]")]
    pub mounts: Vec<MountArg>,

    /// Do not follow symbolic links on mounted filesystems
    #[arg(long)]
    pub no_follow_symlinks: bool,

    /// Extra sshfs option passed to every mount
    #[arg(short = 'o', long = "mount-option", value_name = "OPTION")]
    pub mount_options: Vec<String>,

    /// Print session events as JSON lines
    #[arg(long)]
    pub json: bool,
}

/// A `remote[:local]` mount argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountArg {
    pub remote: PathBuf,
    pub local: Option<PathBuf>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MountArgError {
    #[error("mount argument has no remote path: {0:?}")]
    MissingRemote(String),
}

impl FromStr for MountArg {
    type Err = MountArgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (remote, local) = match s.split_once(':') {
            Some((remote, "")) => (remote, None),
            Some((remote, local)) => (remote, Some(PathBuf::from(local))),
            None => (s, None),
        };
        if remote.is_empty() {
            return Err(MountArgError::MissingRemote(s.to_string()));
        }
        Ok(Self {
            remote: PathBuf::from(remote),
            local,
        })
    }
}

pub async fn up_command(settings: Settings, args: UpArgs) -> Result<()> {
    let connection: ConnectionString = args
        .target
        .parse()
        .with_context(|| format!("Invalid target: {}", args.target))?;
    let target = connection.target.clone();

    let manager = SessionManager::new(settings);
    let events = manager.subscribe();
    let prompt: Arc<dyn PromptHandler> = Arc::new(TerminalPrompt::new());

    print_info(&format!("Connecting to {}...", target));
    let session = manager
        .connect(connection, prompt)
        .await
        .with_context(|| format!("Failed to connect to {}", target))?;
    print_success(&format!("Connected to {}", target));

    let failures = open_resources(&session, &args).await;

    println!();
    print!(
        "{}",
        format_session(
            session.target(),
            session.state(),
            session.socket_path(),
            session.created_at()
        )
    );
    println!("{}", format_forwards(&session.forwards()));
    println!("{}", format_mounts(&session.mounts()));
    if failures > 0 {
        print_warning(&format!("{} requested resource(s) could not be opened", failures));
    }

    let token = CancellationToken::new();
    let watcher = tokio::spawn(report_events(events, token.clone(), args.json));

    let mut state = session.subscribe_state();
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            print_info("Shutting down...");
        }
        _ = async { state.wait_for(|s| *s == SessionState::Disconnected).await.map(|_| ()) } => {
            print_warning(&format!("Session to {} ended", target));
        }
    }

    token.cancel();
    if let Err(e) = watcher.await {
        tracing::warn!("Event reporter failed: {}", e);
    }

    let report = manager.disconnect_all().await;
    if report.is_clean() {
        print_success("All resources released");
        Ok(())
    } else {
        for failure in &report.failures {
            print_error(&failure.to_string());
        }
        anyhow::bail!("{} resource(s) could not be released", report.failures.len())
    }
}

/// Open the requested forwards and mounts; returns how many failed
async fn open_resources(session: &Session, args: &UpArgs) -> usize {
    let mut failures = 0;

    let requests = args
        .local
        .iter()
        .map(|spec| (ForwardDirection::Local, spec))
        .chain(args.remote.iter().map(|spec| (ForwardDirection::Reverse, spec)));
    for (direction, spec) in requests {
        let request = match ForwardRequest::parse(direction, spec) {
            Ok(request) => request,
            Err(e) => {
                print_error(&format!("Invalid forward {} {}: {}", direction.flag(), spec, e));
                failures += 1;
                continue;
            }
        };
        match session.add_forward_request(request).await {
            Ok(forward) => print_success(&format!("Forward {}", forward)),
            Err(e) => {
                print_error(&format!("Forward {} {} failed: {}", direction.flag(), spec, e));
                failures += 1;
            }
        }
    }

    let mut options = session.default_mount_options();
    if args.no_follow_symlinks {
        options.follow_symlinks = false;
    }
    options.extra.extend(args.mount_options.iter().cloned());

    for arg in &args.mounts {
        match session
            .mount(arg.remote.clone(), arg.local.clone(), options.clone())
            .await
        {
            Ok(mount) => print_success(&format!("Mounted {}", mount)),
            Err(e) => {
                print_error(&format!("Mount of {} failed: {}", arg.remote.display(), e));
                failures += 1;
            }
        }
    }

    failures
}

async fn report_events(
    mut events: broadcast::Receiver<SessionEvent>,
    token: CancellationToken,
    json: bool,
) {
    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(event) if json => match serde_json::to_string(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => tracing::warn!("Failed to encode event: {}", e),
            },
            Ok(event) => describe_event(&event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::debug!("Skipped {} session events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn describe_event(event: &SessionEvent) {
    match event {
        SessionEvent::StateChanged {
            target,
            state: SessionState::Connected,
        } => print_success(&format!("{} is connected", target)),
        SessionEvent::StateChanged {
            target,
            state: SessionState::Reconnecting,
        } => print_warning(&format!("Lost connection to {}", target)),
        SessionEvent::ReconnectAttempt {
            target,
            attempt,
            max_attempts,
        } => print_info(&format!(
            "Reconnecting to {} (attempt {}/{})",
            target, attempt, max_attempts
        )),
        SessionEvent::ResourcesOrphaned {
            target,
            forwards,
            mounts,
        } => print_warning(&format!(
            "{}: {} forward(s) and {} mount(s) were left behind",
            target, forwards, mounts
        )),
        _ => {}
    }
}
