//! In-memory host used by the integration tests
//!
//! `FakeHost` plays ssh, sshfs and fusermount, the mount table and procfs.
//! Every invocation is recorded in order. Masters are tracked per control
//! path, and the remote side is the local filesystem.

#![allow(dead_code)]

use std::collections::{HashSet, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;

use sshubl_core::config::{BackoffConfig, ReconnectConfig, Settings};
use sshubl_core::traits::{
    CommandOutput, CommandRunner, Invocation, ListenerQuery, MountTable, PromptCancelled,
    PromptHandler, PromptKind, PromptRequest, PromptResponse, PtyProcess,
};
use sshubl_core::TerminalSize;
use sshubl_orchestrator::Backend;

pub const MASTER_PID: u32 = 4242;
pub const SSHFS_PID: u32 = 5151;
pub const FIRST_REMOTE_PORT: u16 = 41234;
pub const FIRST_LOCAL_PORT: u16 = 50001;

/// One step of a scripted pseudo-terminal process
#[derive(Debug, Clone)]
pub enum Step {
    /// Print text
    Out(&'static str),
    /// Create the control socket without exiting
    Socket,
    /// Exit with a status; 0 leaves a running master behind
    Exit(i32),
    /// Produce nothing until killed
    Hang,
}

#[derive(Default)]
struct HostState {
    invocations: Vec<Invocation>,
    alive: HashSet<PathBuf>,
    logins: VecDeque<Vec<Step>>,
    master_spawns: usize,
    typed: Vec<String>,
    forwards: Vec<(String, String)>,
    cancels: Vec<(String, String)>,
    remote_commands: Vec<String>,
    next_remote_port: u16,
    next_local_port: u16,
    listener_delay: Duration,
    listeners: Vec<SocketAddr>,
    reject_forwards: Option<String>,
    mounted: HashSet<PathBuf>,
    busy: HashSet<PathBuf>,
    mount_failure: Option<CommandOutput>,
    stalled: HashSet<String>,
}

#[derive(Clone, Default)]
pub struct FakeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeHost {
    pub fn new() -> Self {
        let host = Self::default();
        {
            let mut state = host.lock();
            state.next_remote_port = FIRST_REMOTE_PORT;
            state.next_local_port = FIRST_LOCAL_PORT;
        }
        host
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HostState> {
        self.state.lock().unwrap()
    }

    pub fn backend(&self) -> Backend {
        Backend::new(
            Arc::new(self.clone()),
            Arc::new(self.clone()),
            Arc::new(self.clone()),
        )
    }

    /// Script the next master login; unscripted logins succeed at once
    pub fn script_login(&self, steps: Vec<Step>) {
        self.lock().logins.push_back(steps);
    }

    /// Let local allocated listeners appear only after `delay`
    pub fn set_listener_delay(&self, delay: Duration) {
        self.lock().listener_delay = delay;
    }

    pub fn reject_forwards(&self, stderr: &str) {
        self.lock().reject_forwards = Some(stderr.to_string());
    }

    pub fn fail_mounts(&self, output: CommandOutput) {
        self.lock().mount_failure = Some(output);
    }

    pub fn set_busy(&self, path: &Path) {
        self.lock().busy.insert(path.to_path_buf());
    }

    pub fn clear_busy(&self, path: &Path) {
        self.lock().busy.remove(path);
    }

    /// Clients matching `key` (a program name or an `-O` command) never return
    pub fn stall(&self, key: &str) {
        self.lock().stalled.insert(key.to_string());
    }

    /// Drop a mount behind the registry's back
    pub fn unmount_externally(&self, path: &Path) {
        self.lock().mounted.remove(path);
    }

    /// The master dies, leaving its socket file behind
    pub fn kill_masters(&self) {
        self.lock().alive.clear();
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }

    pub fn master_spawns(&self) -> usize {
        self.lock().master_spawns
    }

    pub fn typed(&self) -> Vec<String> {
        self.lock().typed.clone()
    }

    pub fn forwards(&self) -> Vec<(String, String)> {
        self.lock().forwards.clone()
    }

    pub fn cancels(&self) -> Vec<(String, String)> {
        self.lock().cancels.clone()
    }

    pub fn remote_commands(&self) -> Vec<String> {
        self.lock().remote_commands.clone()
    }

    pub fn is_mounted(&self, path: &Path) -> bool {
        self.lock().mounted.contains(path)
    }

    /// Position of the first invocation matching `pred`
    pub fn position(&self, pred: impl Fn(&Invocation) -> bool) -> Option<usize> {
        self.lock().invocations.iter().position(pred)
    }

    fn handle_ssh(&self, invocation: &Invocation) -> CommandOutput {
        let control = control_path(invocation);
        let mut state = self.lock();
        let alive = control
            .as_ref()
            .map(|p| state.alive.contains(p) && p.exists())
            .unwrap_or(false);
        let not_connected = || {
            CommandOutput::failed(
                255,
                format!(
                    "Control socket connect({}): No such file or directory\r\n",
                    control.as_deref().unwrap_or(Path::new("")).display()
                ),
            )
        };

        match invocation.mux_command() {
            Some("check") => {
                if alive {
                    CommandOutput {
                        status: Some(0),
                        stdout: String::new(),
                        stderr: format!("Master running (pid={})\r\n", MASTER_PID),
                    }
                } else {
                    not_connected()
                }
            }
            Some("forward") => {
                if !alive {
                    return not_connected();
                }
                if let Some(stderr) = state.reject_forwards.clone() {
                    return CommandOutput::failed(255, stderr);
                }
                let (flag, spec) = forward_args(invocation);
                state.forwards.push((flag.clone(), spec.clone()));

                if let Some(path) = unix_listen(&spec) {
                    // the remote end is this machine
                    let _ = std::fs::write(path, b"");
                }
                let allocated = listen_port(&spec) == Some(0);
                if flag == "-R" && allocated {
                    let port = state.next_remote_port;
                    state.next_remote_port += 1;
                    return CommandOutput::ok(format!("{}\n", port));
                }
                if flag == "-L" && allocated {
                    let port = state.next_local_port;
                    state.next_local_port += 1;
                    let addr = SocketAddr::from(([127, 0, 0, 1], port));
                    let delay = state.listener_delay;
                    if delay.is_zero() {
                        state.listeners.push(addr);
                    } else {
                        let shared = Arc::clone(&self.state);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            shared.lock().unwrap().listeners.push(addr);
                        });
                    }
                }
                CommandOutput::ok("")
            }
            Some("cancel") => {
                if !alive {
                    return not_connected();
                }
                let cancel = forward_args(invocation);
                state.cancels.push(cancel);
                CommandOutput::ok("")
            }
            Some("exit") => {
                if !alive {
                    return not_connected();
                }
                if let Some(path) = control.clone() {
                    state.alive.remove(&path);
                    let _ = std::fs::remove_file(&path);
                }
                CommandOutput {
                    status: Some(0),
                    stdout: String::new(),
                    stderr: "Exit request sent.\r\n".into(),
                }
            }
            Some(other) => CommandOutput::failed(255, format!("unknown mux command {}", other)),
            None if invocation.has_arg("--") => {
                if !alive {
                    return not_connected();
                }
                let command = invocation.args.last().cloned().unwrap_or_default();
                state.remote_commands.push(command.clone());
                if let Some(path) = command.strip_prefix("rm -f ") {
                    let _ = std::fs::remove_file(path.trim_matches('\''));
                }
                CommandOutput::ok("")
            }
            None => CommandOutput::failed(255, "unexpected ssh invocation"),
        }
    }

    fn handle_sshfs(&self, invocation: &Invocation) -> CommandOutput {
        let mut state = self.lock();
        if let Some(failure) = state.mount_failure.clone() {
            return failure;
        }
        let local = PathBuf::from(invocation.args.last().cloned().unwrap_or_default());
        state.mounted.insert(local);
        CommandOutput::ok("")
    }

    fn handle_unmount(&self, invocation: &Invocation) -> CommandOutput {
        let mut state = self.lock();
        let local = PathBuf::from(invocation.args.last().cloned().unwrap_or_default());
        if state.busy.contains(&local) {
            return CommandOutput::failed(
                1,
                format!(
                    "fusermount: failed to unmount {}: Device or resource busy\n",
                    local.display()
                ),
            );
        }
        if state.mounted.remove(&local) {
            CommandOutput::ok("")
        } else {
            CommandOutput::failed(1, format!("fusermount: entry for {} not found\n", local.display()))
        }
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, invocation: &Invocation) -> io::Result<CommandOutput> {
        let program = invocation
            .program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stalled = {
            let mut state = self.lock();
            state.invocations.push(invocation.clone());
            state.stalled.contains(&program)
                || invocation
                    .mux_command()
                    .map(|cmd| state.stalled.contains(cmd))
                    .unwrap_or(false)
        };
        if stalled {
            return std::future::pending().await;
        }

        match program.as_str() {
            "ssh" => Ok(self.handle_ssh(invocation)),
            "sshfs" => Ok(self.handle_sshfs(invocation)),
            "fusermount" | "fusermount3" | "umount" => Ok(self.handle_unmount(invocation)),
            other => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("{} not installed", other),
            )),
        }
    }

    async fn spawn_pty(
        &self,
        invocation: &Invocation,
        _size: TerminalSize,
    ) -> io::Result<Box<dyn PtyProcess>> {
        let mut state = self.lock();
        state.invocations.push(invocation.clone());

        let master = invocation.has_arg("-oControlMaster=yes");
        let steps = if master {
            state.master_spawns += 1;
            state.logins.pop_front().unwrap_or_else(|| vec![Step::Exit(0)])
        } else {
            vec![Step::Out("remote$ "), Step::Hang]
        };

        Ok(Box::new(FakePty {
            host: self.clone(),
            control: if master { control_path(invocation) } else { None },
            steps: steps.into(),
            exit: None,
        }))
    }
}

impl MountTable for FakeHost {
    fn is_mount_point(&self, path: &Path) -> bool {
        self.lock().mounted.contains(path)
    }

    fn client_pid(&self, mount_point: &Path) -> Option<u32> {
        self.is_mount_point(mount_point).then_some(SSHFS_PID)
    }
}

#[async_trait]
impl ListenerQuery for FakeHost {
    async fn listeners(&self, pid: u32) -> io::Result<Vec<SocketAddr>> {
        if pid != MASTER_PID {
            return Ok(Vec::new());
        }
        Ok(self.lock().listeners.clone())
    }
}

struct FakePty {
    host: FakeHost,
    control: Option<PathBuf>,
    steps: VecDeque<Step>,
    exit: Option<i32>,
}

impl FakePty {
    fn create_socket(&self) {
        if let Some(path) = &self.control {
            let _ = std::fs::write(path, b"");
        }
    }
}

#[async_trait]
impl PtyProcess for FakePty {
    fn pid(&self) -> Option<u32> {
        Some(7)
    }

    async fn read(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match self.steps.pop_front() {
                Some(Step::Out(text)) => return Ok(Some(Bytes::from_static(text.as_bytes()))),
                Some(Step::Socket) => self.create_socket(),
                Some(Step::Exit(code)) => {
                    if code == 0 {
                        self.create_socket();
                        if let Some(path) = &self.control {
                            self.host.lock().alive.insert(path.clone());
                        }
                    }
                    self.exit = Some(code);
                    return Ok(None);
                }
                Some(Step::Hang) => {
                    self.steps.push_front(Step::Hang);
                    std::future::pending::<()>().await;
                }
                None => return Ok(None),
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let line = String::from_utf8_lossy(data).trim_end().to_string();
        self.host.lock().typed.push(line);
        Ok(())
    }

    fn resize(&self, _size: TerminalSize) -> io::Result<()> {
        Ok(())
    }

    fn try_wait(&mut self) -> io::Result<Option<i32>> {
        Ok(self.exit)
    }

    async fn wait(&mut self) -> io::Result<i32> {
        match self.exit {
            Some(code) => Ok(code),
            None => std::future::pending().await,
        }
    }

    async fn kill(&mut self) -> io::Result<()> {
        self.steps.clear();
        self.exit = Some(-9);
        Ok(())
    }
}

fn control_path(invocation: &Invocation) -> Option<PathBuf> {
    invocation
        .args
        .iter()
        .find_map(|a| a.strip_prefix("-oControlPath="))
        .map(PathBuf::from)
}

/// Flag and spec following `-O forward|cancel`
fn forward_args(invocation: &Invocation) -> (String, String) {
    let idx = invocation
        .args
        .iter()
        .position(|a| a == "-O")
        .unwrap_or_default();
    let flag = invocation.args.get(idx + 2).cloned().unwrap_or_default();
    let spec = invocation.args.get(idx + 3).cloned().unwrap_or_default();
    (flag, spec)
}

fn unix_listen(spec: &str) -> Option<&str> {
    if spec.starts_with('/') {
        spec.split(':').next()
    } else {
        None
    }
}

fn listen_port(spec: &str) -> Option<u16> {
    let parts: Vec<&str> = spec.split(':').collect();
    match parts.len() {
        3 => parts[0].parse().ok(),
        4 => parts[1].parse().ok(),
        _ => None,
    }
}

/// How the scripted user answers
#[derive(Debug, Clone)]
pub enum Answer {
    Respond(PromptResponse),
    Cancel,
}

/// Prompt handler answering credential prompts from a queue
///
/// Cancel confirmations stay pending, except for the attempt named by
/// `reject_attempt` which is rejected.
#[derive(Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<Answer>>,
    reject_attempt: Option<u32>,
    seen: Mutex<Vec<PromptRequest>>,
}

impl ScriptedPrompt {
    pub fn new(answers: Vec<Answer>) -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(answers.into()),
            ..Default::default()
        })
    }

    pub fn rejecting_attempt(attempt: u32) -> Arc<Self> {
        Arc::new(Self {
            reject_attempt: Some(attempt),
            ..Default::default()
        })
    }

    pub fn seen(&self) -> Vec<PromptRequest> {
        self.seen.lock().unwrap().clone()
    }

    pub fn seen_kinds(&self) -> Vec<PromptKind> {
        self.seen().into_iter().map(|r| r.kind).collect()
    }
}

#[async_trait]
impl PromptHandler for ScriptedPrompt {
    async fn prompt(&self, request: PromptRequest) -> Result<PromptResponse, PromptCancelled> {
        self.seen.lock().unwrap().push(request.clone());

        if request.kind == PromptKind::CancelConfirmation {
            if let Some(n) = self.reject_attempt {
                if request.message.contains(&format!("attempt {}/", n)) {
                    return Ok(PromptResponse::Reject);
                }
            }
            return std::future::pending().await;
        }

        let answer = self.answers.lock().unwrap().pop_front();
        match answer {
            Some(Answer::Respond(response)) => Ok(response),
            Some(Answer::Cancel) | None => Err(PromptCancelled),
        }
    }
}

/// Settings pointing every path into `dir`, with short timings
pub fn test_settings(dir: &TempDir) -> Settings {
    Settings {
        ssh_path: Some(PathBuf::from("/usr/bin/ssh")),
        sshfs_path: Some(PathBuf::from("/usr/bin/sshfs")),
        umount_path: Some(PathBuf::from("/bin/fusermount")),
        sockets_path: dir.path().join("sockets"),
        mounts_path: dir.path().join("mounts"),
        ssh_login_timeout: Duration::from_secs(5),
        keepalive_interval: Duration::from_millis(100),
        forward_resolve_timeout: Duration::from_secs(2),
        mount_timeout: Duration::from_secs(5),
        reconnect: ReconnectConfig {
            max_retries: 3,
            backoff: BackoffConfig {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(50),
                multiplier: 2.0,
                jitter: 0.0,
            },
        },
        ..Default::default()
    }
}

/// Wait until `cond` holds, panicking after a few seconds
pub async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached in time");
}
