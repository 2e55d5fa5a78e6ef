//! tmux session management for warden.
//!
//! Thin wrappers over the `tmux` binary: session lifecycle, key injection,
//! pane capture and pane metadata. tmux reports failures as free text on
//! stderr; [`classify_error`] folds the ones callers branch on into
//! [`TmuxError`] sentinels.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{Command, Output};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

/// Failure taxonomy for tmux invocations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TmuxError {
    #[error("no tmux server running")]
    NoServer,
    #[error("tmux session already exists")]
    SessionExists,
    #[error("tmux session not found")]
    SessionNotFound,
    #[error("tmux {command} failed: {detail}")]
    Command { command: String, detail: String },
}

impl TmuxError {
    /// Errors meaning "there is nothing there", as opposed to a broken call.
    pub fn is_absent(&self) -> bool {
        matches!(self, TmuxError::NoServer | TmuxError::SessionNotFound)
    }
}

/// Map tmux's stderr text onto the sentinel taxonomy.
pub fn classify_error(command: &str, stderr: &str) -> TmuxError {
    // The server exits with its last session, so a call racing that
    // shutdown sees one of the last two texts.
    if stderr.contains("no server running")
        || stderr.contains("error connecting")
        || stderr.contains("server exited unexpectedly")
    {
        TmuxError::NoServer
    } else if stderr.contains("duplicate session") {
        TmuxError::SessionExists
    } else if stderr.contains("session not found")
        || stderr.contains("can't find session")
        || stderr.contains("no current target")
    {
        TmuxError::SessionNotFound
    } else {
        TmuxError::Command {
            command: command.to_string(),
            detail: stderr.trim().to_string(),
        }
    }
}

/// Session metadata as reported by tmux.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRecord {
    pub name: String,
    pub pane_command: String,
    pub windows: u32,
}

/// Handle on a tmux server. The default targets the user's normal server;
/// [`Tmux::with_socket`] selects a named socket (`tmux -L`).
#[derive(Debug, Clone, Default)]
pub struct Tmux {
    socket: Option<String>,
}

/// Target exactly `session`, never a session that merely starts with it.
fn exact_session(session: &str) -> String {
    format!("={session}")
}

/// Active pane of exactly `session`.
fn exact_pane(session: &str) -> String {
    format!("={session}:")
}

impl Tmux {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_socket(socket: impl Into<String>) -> Self {
        Self {
            socket: Some(socket.into()),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("tmux");
        if let Some(socket) = &self.socket {
            cmd.args(["-L", socket.as_str()]);
        }
        cmd
    }

    fn run<I, S>(&self, args: I) -> Result<String, TmuxError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let args: Vec<S> = args.into_iter().collect();
        let subcommand = args
            .first()
            .map(|a| a.as_ref().to_string_lossy().into_owned())
            .unwrap_or_default();

        let output: Output = self
            .command()
            .args(&args)
            .output()
            .map_err(|e| TmuxError::Command {
                command: subcommand.clone(),
                detail: format!("failed to run tmux: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_error(&subcommand, &stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Check if a tmux session exists. A missing server means no sessions.
    pub fn has_session(&self, session: &str) -> Result<bool, TmuxError> {
        match self.run(["has-session", "-t", &exact_session(session)]) {
            Ok(_) => Ok(true),
            Err(e) if e.is_absent() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Names of all sessions on the server.
    pub fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        match self.run(["list-sessions", "-F", "#{session_name}"]) {
            Ok(out) => Ok(out
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(TmuxError::NoServer) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Create a detached session running the default shell.
    pub fn new_session(&self, session: &str, start_dir: Option<&Path>) -> Result<(), TmuxError> {
        self.create(session, start_dir, None)
    }

    /// Create a detached session whose first pane runs `command`.
    pub fn new_session_with_command(
        &self,
        session: &str,
        start_dir: Option<&Path>,
        command: &str,
    ) -> Result<(), TmuxError> {
        self.create(session, start_dir, Some(command))
    }

    fn create(
        &self,
        session: &str,
        start_dir: Option<&Path>,
        command: Option<&str>,
    ) -> Result<(), TmuxError> {
        let mut args: Vec<String> = vec![
            "new-session".into(),
            "-d".into(),
            "-s".into(),
            session.into(),
        ];
        if let Some(dir) = start_dir {
            args.push("-c".into());
            args.push(dir.to_string_lossy().into_owned());
        }
        if let Some(command) = command {
            args.push(command.into());
        }
        self.run(&args)?;
        info!(session = session, "tmux session created");
        Ok(())
    }

    /// Kill a tmux session.
    pub fn kill_session(&self, session: &str) -> Result<(), TmuxError> {
        self.run(["kill-session", "-t", &exact_session(session)])?;
        info!(session = session, "tmux session killed");
        Ok(())
    }

    /// Type `keys` literally into the target, then press Enter as a
    /// separate action so the line is always submitted.
    pub fn send_keys(&self, target: &str, keys: &str) -> Result<(), TmuxError> {
        if !keys.is_empty() {
            self.run(["send-keys", "-t", target, "-l", "--", keys])?;
        }
        self.run(["send-keys", "-t", target, "Enter"])?;
        debug!(target = target, keys = keys, "sent keys");
        Ok(())
    }

    /// The last `lines` lines of the target pane, including scrollback.
    pub fn capture_pane(&self, target: &str, lines: u32) -> Result<String, TmuxError> {
        let start = format!("-{lines}");
        self.run(["capture-pane", "-p", "-t", target, "-S", start.as_str()])
    }

    fn display(&self, session: &str, format: &str) -> Result<String, TmuxError> {
        let out = self.run(["display-message", "-p", "-t", &exact_pane(session), format])?;
        Ok(out.trim().to_string())
    }

    /// Foreground command of the session's active pane.
    pub fn pane_command(&self, session: &str) -> Result<String, TmuxError> {
        self.display(session, "#{pane_current_command}")
    }

    /// PID of the process tmux started in the session's active pane.
    pub fn pane_pid(&self, session: &str) -> Result<u32, TmuxError> {
        let raw = self.display(session, "#{pane_pid}")?;
        raw.parse().map_err(|_| TmuxError::Command {
            command: "display-message".to_string(),
            detail: format!("unexpected pane_pid '{raw}'"),
        })
    }

    pub fn session_info(&self, session: &str) -> Result<SessionRecord, TmuxError> {
        let raw = self.display(
            session,
            "#{session_name}\t#{session_windows}\t#{pane_current_command}",
        )?;
        parse_session_record(&raw).ok_or_else(|| TmuxError::Command {
            command: "display-message".to_string(),
            detail: format!("unexpected session info '{raw}'"),
        })
    }

    /// Every session with its window count and active pane command.
    pub fn list_session_records(&self) -> Result<Vec<SessionRecord>, TmuxError> {
        match self.run([
            "list-sessions",
            "-F",
            "#{session_name}\t#{session_windows}\t#{pane_current_command}",
        ]) {
            Ok(out) => Ok(out.lines().filter_map(parse_session_record).collect()),
            Err(TmuxError::NoServer) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }

    /// Pane PIDs across every session in one call, so a failing session
    /// cannot hide its panes.
    pub fn list_all_pane_pids(&self) -> Result<Vec<u32>, TmuxError> {
        match self.run(["list-panes", "-a", "-F", "#{pane_pid}"]) {
            Ok(out) => Ok(out
                .lines()
                .filter_map(|l| l.trim().parse().ok())
                .collect()),
            Err(TmuxError::NoServer) => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

fn parse_session_record(line: &str) -> Option<SessionRecord> {
    let mut parts = line.trim_end_matches(['\r', '\n']).split('\t');
    let name = parts.next()?.to_string();
    let windows = parts.next()?.trim().parse().ok()?;
    let pane_command = parts.next().unwrap_or("").to_string();
    if name.is_empty() {
        return None;
    }
    Some(SessionRecord {
        name,
        pane_command,
        windows,
    })
}
