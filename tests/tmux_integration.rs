//! Drives a real tmux server on a private socket.
//!
//! Run with `cargo test --features integration`.

#![cfg(feature = "integration")]

use std::process::Command;
use std::thread;
use std::time::Duration;

use serial_test::serial;
use warden::proc::signal::KernelSignaller;
use warden::session::{AgentMatcher, Freshness, SessionController, SessionState};
use warden::tmux::{Tmux, TmuxError};

const SOCKET: &str = "warden-integration";

/// Kills the private server when the test ends, pass or fail.
struct Server;

impl Drop for Server {
    fn drop(&mut self) {
        let _ = Command::new("tmux")
            .args(["-L", SOCKET, "kill-server"])
            .output();
    }
}

fn tmux_available() -> bool {
    Command::new("tmux").arg("-V").output().is_ok_and(|o| o.status.success())
}

fn settle() {
    thread::sleep(Duration::from_millis(300));
}

#[test]
#[serial]
fn missing_server_reads_as_no_sessions() {
    if !tmux_available() {
        return;
    }
    let _server = Server;
    let tmux = Tmux::with_socket(SOCKET);
    assert!(!tmux.has_session("gt-acme-witness").unwrap());
    assert!(tmux.list_sessions().unwrap().is_empty());
    assert!(tmux.list_all_pane_pids().unwrap().is_empty());
}

#[test]
#[serial]
fn session_lifecycle() {
    if !tmux_available() {
        return;
    }
    let _server = Server;
    let tmux = Tmux::with_socket(SOCKET);
    // Keeps the server up once the session under test is gone.
    tmux.new_session("hq-mayor", None).unwrap();

    tmux.new_session("gt-acme-witness", None).unwrap();
    assert!(tmux.has_session("gt-acme-witness").unwrap());
    // Exact targeting: a prefix does not match.
    assert!(!tmux.has_session("gt-acme").unwrap());
    assert_eq!(
        tmux.new_session("gt-acme-witness", None),
        Err(TmuxError::SessionExists)
    );

    let pid = tmux.pane_pid("gt-acme-witness").unwrap();
    assert!(tmux.list_all_pane_pids().unwrap().contains(&pid));

    tmux.kill_session("gt-acme-witness").unwrap();
    assert_eq!(
        tmux.kill_session("gt-acme-witness"),
        Err(TmuxError::SessionNotFound)
    );
    assert_eq!(tmux.list_sessions().unwrap(), vec!["hq-mayor"]);
}

#[test]
#[serial]
fn killing_the_last_session_reads_as_absent() {
    if !tmux_available() {
        return;
    }
    let _server = Server;
    let tmux = Tmux::with_socket(SOCKET);
    tmux.new_session("gt-acme-Toast", None).unwrap();

    tmux.kill_session("gt-acme-Toast").unwrap();
    // The server may still be shutting down; either way nothing is there.
    let err = tmux.kill_session("gt-acme-Toast").unwrap_err();
    assert!(err.is_absent(), "unexpected error: {err}");
    assert!(!tmux.has_session("gt-acme-Toast").unwrap());
}

#[test]
#[serial]
fn send_keys_types_text_literally() {
    if !tmux_available() {
        return;
    }
    let _server = Server;
    let tmux = Tmux::with_socket(SOCKET);
    tmux.new_session_with_command("gt-acme-cat", None, "cat")
        .unwrap();
    settle();

    tmux.send_keys("gt-acme-cat", "hello world; echo C-c Enter")
        .unwrap();
    settle();

    let screen = tmux.capture_pane("gt-acme-cat", 50).unwrap();
    // Typed once and echoed back by cat after the separate Enter.
    assert_eq!(
        screen.matches("hello world; echo C-c Enter").count(),
        2,
        "screen:\n{screen}"
    );
    assert_eq!(tmux.pane_command("gt-acme-cat").unwrap(), "cat");
}

#[test]
#[serial]
fn session_info_reports_windows_and_command() {
    if !tmux_available() {
        return;
    }
    let _server = Server;
    let tmux = Tmux::with_socket(SOCKET);
    tmux.new_session_with_command("gt-acme-refinery", None, "sleep 300")
        .unwrap();
    settle();

    let info = tmux.session_info("gt-acme-refinery").unwrap();
    assert_eq!(info.name, "gt-acme-refinery");
    assert_eq!(info.windows, 1);
    assert_eq!(info.pane_command, "sleep");

    let records = tmux.list_session_records().unwrap();
    assert_eq!(records, vec![info]);
    assert_eq!(
        tmux.session_info("gt-acme-gone").unwrap_err(),
        TmuxError::SessionNotFound
    );
}

#[test]
#[serial]
fn ensure_leaves_running_agent_alone() {
    if !tmux_available() {
        return;
    }
    let _server = Server;
    let tmux = Tmux::with_socket(SOCKET);
    tmux.new_session_with_command("gt-acme-Toast", None, "sleep 300")
        .unwrap();
    settle();

    let controller = SessionController::new(tmux.clone(), KernelSignaller)
        .with_matcher(AgentMatcher::exact(&["sleep"]));
    assert_eq!(
        controller.state("gt-acme-Toast").unwrap(),
        SessionState::AgentRunning
    );
    let pid = tmux.pane_pid("gt-acme-Toast").unwrap();
    assert_eq!(
        controller.ensure_session_fresh("gt-acme-Toast", None).unwrap(),
        Freshness::AlreadyRunning
    );
    assert_eq!(tmux.pane_pid("gt-acme-Toast").unwrap(), pid);
}

#[test]
#[serial]
fn ensure_replaces_zombie_and_kills_its_processes() {
    if !tmux_available() {
        return;
    }
    let _server = Server;
    let tmux = Tmux::with_socket(SOCKET);
    tmux.new_session_with_command("gt-acme-Nux", None, "sleep 300")
        .unwrap();
    settle();
    let old_pid = tmux.pane_pid("gt-acme-Nux").unwrap();

    // `sleep` is not an agent here, so the session is a zombie.
    let controller = SessionController::new(tmux.clone(), KernelSignaller)
        .with_matcher(AgentMatcher::exact(&["claude"]));
    assert_eq!(
        controller.ensure_session_fresh("gt-acme-Nux", None).unwrap(),
        Freshness::Recreated
    );
    settle();
    assert!(tmux.has_session("gt-acme-Nux").unwrap());
    assert_ne!(tmux.pane_pid("gt-acme-Nux").unwrap(), old_pid);
    assert!(!std::path::Path::new(&format!("/proc/{old_pid}")).exists());
}
