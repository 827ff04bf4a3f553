//! Session lifecycle: connect, authentication, teardown and reconnection

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{eventually, test_settings, Answer, FakeHost, ScriptedPrompt, Step};
use sshubl_core::error::{AuthError, ConnectError};
use sshubl_core::paths;
use sshubl_core::traits::{NonInteractive, PromptKind, PromptResponse};
use sshubl_core::{
    ConnectionString, Endpoint, ForwardDirection, ForwardStatus, MountOptions, MountStatus,
    SessionState, Target,
};
use sshubl_orchestrator::{Session, SessionEvent, SessionManager};
use tempfile::TempDir;

fn target() -> Target {
    Target::new("127.0.0.1", 2222, "alice")
}

fn manager(dir: &TempDir, host: &FakeHost) -> SessionManager {
    SessionManager::with_backend(test_settings(dir), host.backend())
}

#[tokio::test]
async fn test_connect_creates_socket_and_close_removes_it() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);

    let session = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();

    let expected = paths::control_socket_path(&dir.path().join("sockets"), &target()).unwrap();
    assert_eq!(session.socket_path(), expected);
    assert!(expected.exists());
    assert!(session.is_alive().await);
    assert_eq!(session.state(), SessionState::Connected);

    let master = host
        .position(|inv| inv.has_arg("-oControlMaster=yes"))
        .map(|idx| host.invocations()[idx].clone())
        .unwrap();
    assert!(master.has_arg("-f"));
    assert!(master.has_arg(&format!("-oControlPath={}", expected.display())));
    assert_eq!(&master.args[master.args.len() - 5..], ["-p", "2222", "-l", "alice", "127.0.0.1"]);

    let report = manager.disconnect(&target()).await.unwrap();
    assert!(report.is_clean());
    assert!(!expected.exists());
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(manager.get(&target()).is_none());
}

#[tokio::test]
async fn test_concurrent_connects_share_one_session() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    host.script_login(vec![
        Step::Out("alice@127.0.0.1's password: "),
        Step::Exit(0),
    ]);
    let manager = manager(&dir, &host);
    let prompt = ScriptedPrompt::new(vec![Answer::Respond(PromptResponse::Secret(
        "hunter2".into(),
    ))]);

    let (a, b) = tokio::join!(
        manager.connect(target(), prompt.clone()),
        manager.connect(target(), prompt.clone()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(host.master_spawns(), 1);
    assert_eq!(manager.len(), 1);
    assert_eq!(host.typed(), vec!["hunter2".to_string()]);

    manager.disconnect_all().await;
}

#[tokio::test]
async fn test_running_master_is_adopted() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();

    let first = manager(&dir, &host);
    first
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();

    // a second process finds the master through the derived socket path
    let second = manager(&dir, &host);
    let session = second
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();

    assert_eq!(host.master_spawns(), 1);
    assert_eq!(session.state(), SessionState::Connected);
    first.disconnect_all().await;
}

#[tokio::test]
async fn test_cancelled_authentication_leaves_no_socket() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    host.script_login(vec![
        Step::Socket,
        Step::Out("alice@127.0.0.1's password: "),
        Step::Hang,
    ]);
    let manager = manager(&dir, &host);
    let prompt = ScriptedPrompt::new(vec![Answer::Cancel]);

    let err = manager.connect(target(), prompt.clone()).await.unwrap_err();

    assert!(matches!(err, ConnectError::Cancelled));
    assert_eq!(prompt.seen_kinds(), vec![PromptKind::Password]);
    let socket = paths::control_socket_path(&dir.path().join("sockets"), &target()).unwrap();
    assert!(!socket.exists());
    assert!(manager.get(&target()).is_none());
}

#[tokio::test]
async fn test_password_from_connection_string_answers_first_prompt() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    host.script_login(vec![
        Step::Out("alice@127.0.0.1's password: "),
        Step::Out("\r\nPermission denied, please try again.\r\nalice@127.0.0.1's password: "),
    ]);
    let manager = manager(&dir, &host);
    let connection: ConnectionString = "alice:wrong@127.0.0.1:2222".parse().unwrap();
    let prompt = ScriptedPrompt::new(Vec::new());

    let err = manager.connect(connection, prompt.clone()).await.unwrap_err();

    assert!(matches!(err, ConnectError::Auth(AuthError::WrongCredentials(_))));
    assert_eq!(host.typed(), vec!["wrong".to_string()]);
    // the embedded password answered, the user was never asked
    assert!(prompt.seen().is_empty());
}

#[tokio::test]
async fn test_host_key_confirmation() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    host.script_login(vec![
        Step::Out(
            "The authenticity of host '127.0.0.1' can't be established.\r\n\
             ED25519 key fingerprint is SHA256:abc.\r\n\
             Are you sure you want to continue connecting (yes/no/[fingerprint])? ",
        ),
        Step::Exit(0),
    ]);
    let manager = manager(&dir, &host);
    let prompt = ScriptedPrompt::new(vec![Answer::Respond(PromptResponse::Accept)]);

    manager.connect(target(), prompt.clone()).await.unwrap();

    let seen = prompt.seen();
    assert_eq!(seen[0].kind, PromptKind::HostKeyConfirmation);
    assert!(seen[0].message.contains("SHA256:abc"));
    assert_eq!(host.typed(), vec!["yes".to_string()]);
    manager.disconnect_all().await;
}

#[tokio::test]
async fn test_rejected_host_key() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    host.script_login(vec![
        Step::Out("Are you sure you want to continue connecting (yes/no)? "),
        Step::Hang,
    ]);
    let manager = manager(&dir, &host);
    let prompt = ScriptedPrompt::new(vec![Answer::Respond(PromptResponse::Reject)]);

    let err = manager.connect(target(), prompt).await.unwrap_err();
    assert!(matches!(err, ConnectError::Auth(AuthError::HostKeyRejected(_))));
}

#[tokio::test]
async fn test_unreachable_host() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    host.script_login(vec![
        Step::Out("ssh: connect to host 127.0.0.1 port 2222: Connection refused\r\n"),
        Step::Exit(255),
    ]);
    let manager = manager(&dir, &host);

    let err = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap_err();
    match err {
        ConnectError::Unreachable(reason) => assert!(reason.contains("Connection refused")),
        other => panic!("unexpected: {:?}", other),
    }
}

#[tokio::test]
async fn test_socket_path_too_long() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let mut settings = test_settings(&dir);
    settings.sockets_path = dir.path().join("s".repeat(120));
    let manager = SessionManager::with_backend(settings, host.backend());

    let err = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap_err();
    assert!(matches!(err, ConnectError::SocketPathTooLong { .. }));
    assert_eq!(host.master_spawns(), 0);
}

#[tokio::test]
async fn test_teardown_unmounts_before_closing_the_master() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);
    let session = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();

    let mount = session
        .mount("/srv/data", None, MountOptions::default())
        .await
        .unwrap();
    session
        .add_forward(
            ForwardDirection::Local,
            Endpoint::tcp("127.0.0.1", 8080),
            Endpoint::tcp("localhost", 80),
        )
        .await
        .unwrap();
    let mounts_dir = session.mounts_dir();

    let report = manager.disconnect_all().await;
    assert!(report.is_clean());
    assert_eq!(report.sessions, 1);

    let unmount = host
        .position(|inv| inv.program.ends_with("fusermount"))
        .unwrap();
    let cancel = host.position(|inv| inv.mux_command() == Some("cancel")).unwrap();
    let exit = host.position(|inv| inv.mux_command() == Some("exit")).unwrap();
    assert!(unmount < cancel);
    assert!(cancel < exit);

    assert!(!host.is_mounted(&mount.local_path));
    assert!(!mount.local_path.exists());
    assert!(!mounts_dir.exists());
    assert!(session.forwards().is_empty());
    assert!(session.mounts().is_empty());
}

#[tokio::test]
async fn test_busy_mount_is_reported_without_aborting_teardown() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);
    let session = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();
    let mount = session
        .mount("/srv/data", None, MountOptions::default())
        .await
        .unwrap();
    host.set_busy(&mount.local_path);

    let report = manager.disconnect_all().await;

    assert_eq!(report.failures.len(), 1);
    assert!(report.failures[0].to_string().contains("busy"));
    assert!(host.position(|inv| inv.mux_command() == Some("exit")).is_some());
    assert_eq!(session.state(), SessionState::Disconnected);
}

#[tokio::test]
async fn test_stalled_clients_do_not_block_teardown() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let mut settings = test_settings(&dir);
    settings.mount_timeout = Duration::from_millis(300);
    settings.request_timeout = Duration::from_millis(300);
    let manager = SessionManager::with_backend(settings, host.backend());
    let session = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();
    let mount = session
        .mount("/srv/data", None, MountOptions::default())
        .await
        .unwrap();
    session
        .add_forward(
            ForwardDirection::Local,
            Endpoint::tcp("127.0.0.1", 8080),
            Endpoint::tcp("localhost", 80),
        )
        .await
        .unwrap();
    host.stall("fusermount");
    host.stall("cancel");

    let report = tokio::time::timeout(Duration::from_secs(5), manager.disconnect_all())
        .await
        .expect("teardown stalled");

    assert_eq!(report.failures.len(), 2);
    assert!(report
        .failures
        .iter()
        .all(|f| f.to_string().contains("timed out")));
    assert!(host.position(|inv| inv.mux_command() == Some("exit")).is_some());
    assert!(!session.socket_path().exists());
    assert_eq!(session.state(), SessionState::Disconnected);
    assert_eq!(
        session.mounts().first().map(|m| m.local_path.clone()),
        Some(mount.local_path)
    );
}

#[tokio::test]
async fn test_reconnect_cancelled_at_second_attempt() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);
    let prompt = ScriptedPrompt::rejecting_attempt(2);
    let session = manager.connect(target(), prompt.clone()).await.unwrap();
    let forward = session
        .add_forward(
            ForwardDirection::Reverse,
            Endpoint::tcp("localhost", 9000),
            Endpoint::tcp("localhost", 3000),
        )
        .await
        .unwrap();

    host.script_login(vec![
        Step::Out("ssh: connect to host 127.0.0.1 port 2222: Connection refused\r\n"),
        Step::Exit(255),
    ]);
    host.script_login(vec![Step::Hang]);
    let mut events = manager.subscribe();
    host.kill_masters();

    eventually(|| session.state() == SessionState::Disconnected).await;

    assert_eq!(session.reconnect_attempts(), 2);
    assert_eq!(host.master_spawns(), 3);
    assert_eq!(
        session.forward(forward.id).map(|f| f.status),
        Some(ForwardStatus::Orphaned)
    );
    assert!(!session.socket_path().exists());

    let mut attempts = Vec::new();
    let mut orphaned = false;
    while let Ok(event) = events.try_recv() {
        match event {
            SessionEvent::ReconnectAttempt { attempt, max_attempts, .. } => {
                assert_eq!(max_attempts, 3);
                attempts.push(attempt);
            }
            SessionEvent::ResourcesOrphaned { forwards, .. } => {
                assert_eq!(forwards, 1);
                orphaned = true;
            }
            _ => {}
        }
    }
    assert_eq!(attempts, vec![1, 2]);
    assert!(orphaned);
}

#[tokio::test]
async fn test_reconnect_restores_resources() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);
    let session = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();
    session
        .add_forward(
            ForwardDirection::Local,
            Endpoint::tcp("127.0.0.1", 8080),
            Endpoint::tcp("localhost", 80),
        )
        .await
        .unwrap();
    let mount = session
        .mount("/srv/data", None, MountOptions::default())
        .await
        .unwrap();

    host.kill_masters();
    eventually(|| host.master_spawns() == 2).await;
    eventually(|| host.forwards().len() == 2).await;
    eventually(|| session.state() == SessionState::Connected).await;

    assert_eq!(session.reconnect_attempts(), 1);
    assert_eq!(host.master_spawns(), 2);
    assert_eq!(host.forwards()[0], host.forwards()[1]);
    eventually(|| {
        session
            .mounts()
            .iter()
            .all(|m| m.status == MountStatus::Mounted)
    })
    .await;
    assert!(host.is_mounted(&mount.local_path));
    assert!(session
        .forwards()
        .iter()
        .all(|f| f.status == ForwardStatus::Ready));

    manager.disconnect_all().await;
}

#[tokio::test]
async fn test_reconnect_stops_on_wrong_credentials() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);
    let prompt = ScriptedPrompt::new(vec![Answer::Respond(PromptResponse::Secret(
        "stale".into(),
    ))]);
    let session = manager.connect(target(), prompt.clone()).await.unwrap();

    host.script_login(vec![
        Step::Out("alice@127.0.0.1's password: "),
        Step::Out("\r\nPermission denied (publickey,password).\r\n"),
        Step::Exit(255),
    ]);
    host.kill_masters();

    eventually(|| session.state() == SessionState::Disconnected).await;
    assert_eq!(session.reconnect_attempts(), 1);
    assert_eq!(host.master_spawns(), 2);
}

/// Drop the master and fail the relogin, leaving `session` orphaned
async fn orphan(host: &FakeHost, session: &Session) {
    host.script_login(vec![
        Step::Out("alice@127.0.0.1's password: "),
        Step::Out("\r\nPermission denied (publickey,password).\r\n"),
        Step::Exit(255),
    ]);
    host.kill_masters();
    eventually(|| session.state() == SessionState::Disconnected).await;
}

#[tokio::test]
async fn test_reconnecting_releases_orphaned_mounts() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);
    let prompt = ScriptedPrompt::new(vec![Answer::Respond(PromptResponse::Secret(
        "stale".into(),
    ))]);
    let old = manager.connect(target(), prompt).await.unwrap();
    let mount = old
        .mount("/srv/data", None, MountOptions::default())
        .await
        .unwrap();

    orphan(&host, &old).await;
    assert_eq!(
        old.mounts().first().map(|m| m.status),
        Some(MountStatus::Orphaned)
    );

    let new = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&old, &new));
    assert_eq!(new.state(), SessionState::Connected);
    assert!(!host.is_mounted(&mount.local_path));
    assert!(!mount.local_path.exists());
    assert!(old.mounts().is_empty());

    let report = manager.disconnect_all().await;
    assert!(report.is_clean());
    assert_eq!(report.sessions, 1);
}

#[tokio::test]
async fn test_busy_orphaned_mount_is_retried_on_disconnect_all() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);
    let prompt = ScriptedPrompt::new(vec![Answer::Respond(PromptResponse::Secret(
        "stale".into(),
    ))]);
    let old = manager.connect(target(), prompt).await.unwrap();
    let mount = old
        .mount("/srv/data", None, MountOptions::default())
        .await
        .unwrap();
    orphan(&host, &old).await;

    host.set_busy(&mount.local_path);
    manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();
    assert!(host.is_mounted(&mount.local_path));

    host.clear_busy(&mount.local_path);
    let report = manager.disconnect_all().await;

    assert!(report.is_clean());
    assert_eq!(report.sessions, 2);
    assert!(!host.is_mounted(&mount.local_path));
    assert!(!mount.local_path.exists());
    assert!(manager.disconnect(&target()).await.is_none());
}

#[tokio::test]
async fn test_terminal_over_the_master() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);
    let session = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();

    let mut terminal = session
        .open_terminal(sshubl_core::TerminalSize { rows: 40, cols: 120 })
        .await
        .unwrap();
    let banner = terminal.read().await.unwrap().unwrap();
    assert_eq!(&banner[..], b"remote$ ");
    terminal.write(b"uptime\n").await.unwrap();
    assert_eq!(terminal.close().await.unwrap(), -9);

    let shell = host
        .invocations()
        .into_iter()
        .rfind(|inv| inv.has_arg("-tt"))
        .unwrap();
    assert!(shell.has_arg("destination"));
    assert!(!shell.has_arg("--"));
    assert_eq!(host.typed(), vec!["uptime".to_string()]);
    assert_eq!(host.master_spawns(), 1);

    manager.disconnect_all().await;
}

#[tokio::test]
async fn test_disconnect_all_tears_down_every_target() {
    let dir = TempDir::new().unwrap();
    let host = FakeHost::new();
    let manager = manager(&dir, &host);
    let other = Target::new("example.com", 22, "bob");

    let a = manager
        .connect(target(), Arc::new(NonInteractive))
        .await
        .unwrap();
    let b = manager
        .connect(other.clone(), Arc::new(NonInteractive))
        .await
        .unwrap();
    assert_ne!(a.socket_path(), b.socket_path());
    assert_eq!(manager.list().len(), 2);

    let report = manager.disconnect_all().await;

    assert_eq!(report.sessions, 2);
    assert!(report.is_clean());
    assert!(manager.is_empty());
    assert!(!a.socket_path().exists());
    assert!(!b.socket_path().exists());
    assert!(manager.disconnect(&other).await.is_none());
}
