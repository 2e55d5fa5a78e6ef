//! Session freshness and agent detection.
//!
//! A named session is in one of three states:
//!
//! - `Absent`: tmux has no such session.
//! - `Zombie`: the session exists but its pane runs a bare shell with no
//!   agent process anywhere beneath it.
//! - `AgentRunning`: the pane's foreground command, or one of its
//!   descendants, is a recognized agent.
//!
//! [`SessionController::ensure_session_fresh`] drives any state to a usable
//! session without disturbing one that already hosts an agent.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AgentsConfig, CleanupConfig};
use crate::proc::signal::{KernelSignaller, Signaller, TreeKillReport, kill_tree};
use crate::proc::{MAX_TREE_DEPTH, ProcFs};
use crate::tmux::{Tmux, TmuxError};

/// Built-in agent process names.
pub const DEFAULT_AGENT_NAMES: [&str; 2] = ["node", "claude"];
/// Agent CLIs that rename their process to their own version string.
pub const DEFAULT_VERSION_PATTERN: &str = r"^\d+\.\d+\.\d+";

/// The slice of tmux the controller needs.
pub trait SessionBackend {
    fn has_session(&self, session: &str) -> Result<bool, TmuxError>;
    fn new_session(&self, session: &str, start_dir: Option<&Path>) -> Result<(), TmuxError>;
    fn kill_session(&self, session: &str) -> Result<(), TmuxError>;
    fn pane_command(&self, session: &str) -> Result<String, TmuxError>;
    fn pane_pid(&self, session: &str) -> Result<u32, TmuxError>;
}

impl SessionBackend for Tmux {
    fn has_session(&self, session: &str) -> Result<bool, TmuxError> {
        Tmux::has_session(self, session)
    }

    fn new_session(&self, session: &str, start_dir: Option<&Path>) -> Result<(), TmuxError> {
        Tmux::new_session(self, session, start_dir)
    }

    fn kill_session(&self, session: &str) -> Result<(), TmuxError> {
        Tmux::kill_session(self, session)
    }

    fn pane_command(&self, session: &str) -> Result<String, TmuxError> {
        Tmux::pane_command(self, session)
    }

    fn pane_pid(&self, session: &str) -> Result<u32, TmuxError> {
        Tmux::pane_pid(self, session)
    }
}

/// Recognizes agent processes by exact command name, plus an optional
/// pattern for CLIs that report a bare version string as their name.
#[derive(Debug, Clone)]
pub struct AgentMatcher {
    names: Vec<String>,
    version_pattern: Option<Regex>,
}

impl Default for AgentMatcher {
    fn default() -> Self {
        Self {
            names: DEFAULT_AGENT_NAMES.iter().map(|s| s.to_string()).collect(),
            version_pattern: Some(Regex::new(DEFAULT_VERSION_PATTERN).unwrap()),
        }
    }
}

impl AgentMatcher {
    /// Exact names only, no version pattern.
    pub fn exact<S: AsRef<str>>(names: &[S]) -> Self {
        Self {
            names: names.iter().map(|n| n.as_ref().to_string()).collect(),
            version_pattern: None,
        }
    }

    /// Configured defaults and extra names, plus the version pattern.
    pub fn from_config(config: &AgentsConfig) -> Result<Self> {
        let mut names = config.defaults.clone();
        for name in &config.names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        let version_pattern = if config.version_pattern.trim().is_empty() {
            None
        } else {
            Some(Regex::new(&config.version_pattern).with_context(|| {
                format!("invalid agents.version_pattern '{}'", config.version_pattern)
            })?)
        };
        Ok(Self {
            names,
            version_pattern,
        })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn matches(&self, command: &str) -> bool {
        if command.is_empty() {
            return false;
        }
        self.names.iter().any(|n| n == command)
            || self
                .version_pattern
                .as_ref()
                .is_some_and(|re| re.is_match(command))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Absent,
    Zombie,
    AgentRunning,
}

/// What [`SessionController::ensure_session_fresh`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// An agent was already running; nothing touched.
    AlreadyRunning,
    Created,
    /// A zombie was killed and replaced.
    Recreated,
}

pub struct SessionController<B, S = KernelSignaller> {
    backend: B,
    signaller: S,
    procfs: ProcFs,
    matcher: AgentMatcher,
    cleanup: CleanupConfig,
}

impl<B: SessionBackend, S: Signaller> SessionController<B, S> {
    pub fn new(backend: B, signaller: S) -> Self {
        Self {
            backend,
            signaller,
            procfs: ProcFs::new(),
            matcher: AgentMatcher::default(),
            cleanup: CleanupConfig::default(),
        }
    }

    pub fn with_procfs(mut self, procfs: ProcFs) -> Self {
        self.procfs = procfs;
        self
    }

    pub fn with_matcher(mut self, matcher: AgentMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn with_cleanup(mut self, cleanup: CleanupConfig) -> Self {
        self.cleanup = cleanup;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Classify `session` with the configured matcher.
    pub fn state(&self, session: &str) -> Result<SessionState, TmuxError> {
        if !self.backend.has_session(session)? {
            return Ok(SessionState::Absent);
        }
        self.classify(session, &self.matcher)
    }

    fn classify(&self, session: &str, matcher: &AgentMatcher) -> Result<SessionState, TmuxError> {
        let command = match self.backend.pane_command(session) {
            Ok(command) => command,
            Err(e) if e.is_absent() => return Ok(SessionState::Absent),
            Err(e) => return Err(e),
        };
        if matcher.matches(&command) {
            return Ok(SessionState::AgentRunning);
        }

        let pane_pid = match self.backend.pane_pid(session) {
            Ok(pid) => pid,
            Err(e) if e.is_absent() => return Ok(SessionState::Absent),
            Err(e) => return Err(e),
        };
        if let Some(pid) = self.procfs.find_descendant(pane_pid, |comm| matcher.matches(comm)) {
            debug!(
                session = session,
                pane_command = %command,
                agent_pid = pid,
                "agent found below shell"
            );
            return Ok(SessionState::AgentRunning);
        }
        Ok(SessionState::Zombie)
    }

    /// True when the pane, or a process beneath it, matches `names`.
    /// An empty list uses the configured matcher. A missing session or an
    /// unreachable server is `false`.
    pub fn is_agent_running<N: AsRef<str>>(&self, session: &str, names: &[N]) -> bool {
        let matcher = if names.is_empty() {
            self.matcher.clone()
        } else {
            AgentMatcher::exact(names)
        };
        self.running_with(session, &matcher)
    }

    /// [`Self::is_agent_running`] with the built-in defaults.
    pub fn is_claude_running(&self, session: &str) -> bool {
        self.running_with(session, &AgentMatcher::default())
    }

    fn running_with(&self, session: &str, matcher: &AgentMatcher) -> bool {
        match self.classify(session, matcher) {
            Ok(state) => state == SessionState::AgentRunning,
            Err(e) => {
                debug!(session = session, error = %e, "agent probe failed");
                false
            }
        }
    }

    /// Make `session` usable. Leaves a running agent alone, replaces a
    /// zombie, creates a missing session. Repeated calls are safe.
    pub fn ensure_session_fresh(
        &self,
        session: &str,
        start_dir: Option<&Path>,
    ) -> Result<Freshness, TmuxError> {
        match self.state(session)? {
            SessionState::AgentRunning => {
                debug!(session = session, "agent already running");
                Ok(Freshness::AlreadyRunning)
            }
            SessionState::Zombie => {
                info!(session = session, "replacing zombie session");
                match self.kill_session_with_processes(session) {
                    Ok(_) => {}
                    Err(e) if e.is_absent() => {}
                    Err(e) => return Err(e),
                }
                self.create(session, start_dir, Freshness::Recreated)
            }
            SessionState::Absent => self.create(session, start_dir, Freshness::Created),
        }
    }

    fn create(
        &self,
        session: &str,
        start_dir: Option<&Path>,
        outcome: Freshness,
    ) -> Result<Freshness, TmuxError> {
        match self.backend.new_session(session, start_dir) {
            Ok(()) => Ok(outcome),
            Err(TmuxError::SessionExists) => {
                // Someone else created it between our check and our create.
                match self.state(session)? {
                    SessionState::AgentRunning => Ok(Freshness::AlreadyRunning),
                    SessionState::Zombie => {
                        debug!(session = session, "session created concurrently");
                        Ok(outcome)
                    }
                    SessionState::Absent => {
                        self.backend.new_session(session, start_dir)?;
                        Ok(outcome)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Kill the pane's whole process tree, children first, then the
    /// session itself. Never signals this process or its ancestors.
    pub fn kill_session_with_processes(&self, session: &str) -> Result<TreeKillReport, TmuxError> {
        let pane_pid = self.backend.pane_pid(session)?;

        let mut targets = self.procfs.descendants_with_retry(
            pane_pid,
            self.cleanup.descendant_rescan_attempts,
            self.cleanup.descendant_rescan_delay(),
        );
        targets.push(pane_pid);

        let protected = self.own_lineage();
        let before = targets.len();
        targets.retain(|pid| !protected.contains(pid));
        if targets.len() != before {
            warn!(session = session, "skipping own process lineage");
        }

        let report = kill_tree(&self.signaller, &targets, self.cleanup.sigterm_grace());

        match self.backend.kill_session(session) {
            Ok(()) => {}
            // The session closes on its own once its last pane dies.
            Err(e) if e.is_absent() => {}
            Err(e) => {
                if !matches!(self.backend.has_session(session), Ok(false)) {
                    return Err(e);
                }
                debug!(session = session, error = %e, "session gone despite kill error");
            }
        }
        info!(
            session = session,
            terminated = report.terminated,
            force_killed = report.force_killed,
            "session and processes killed"
        );
        Ok(report)
    }

    fn own_lineage(&self) -> HashSet<u32> {
        let mut lineage = HashSet::new();
        let mut pid = std::process::id();
        lineage.insert(pid);
        for _ in 0..MAX_TREE_DEPTH {
            match self.procfs.parent_pid(pid) {
                Some(parent) if parent > 1 && lineage.insert(parent) => pid = parent,
                _ => break,
            }
        }
        lineage
    }
}
