//! Sessions that carry the fleet prefix but belong to no known rig.
//!
//! Under a known rig any suffix is accepted, even an empty one: worker
//! names are free-form, so the role segment is not verified.

use std::mem;

use tracing::{debug, info, warn};

use super::{Check, CheckContext, CheckResult, DOCTOR_CALLER, FixReport};
use crate::config::TownConfig;
use crate::events::{EventSink, FeedEvent};
use crate::names::{is_crew_session_with_prefix, split_rig};
use crate::tmux::{Tmux, TmuxError};
use crate::workspace::WorkspaceRoster;

pub const CHECK_NAME: &str = "orphan-sessions";

/// Session listing and removal.
pub trait SessionOps {
    fn list_sessions(&self) -> Result<Vec<String>, TmuxError>;
    fn kill_session(&self, session: &str) -> Result<(), TmuxError>;
}

impl SessionOps for Tmux {
    fn list_sessions(&self) -> Result<Vec<String>, TmuxError> {
        Tmux::list_sessions(self)
    }

    fn kill_session(&self, session: &str) -> Result<(), TmuxError> {
        Tmux::kill_session(self, session)
    }
}

pub struct OrphanSessionCheck<O, E> {
    ops: O,
    events: E,
    town: TownConfig,
    prefix: String,
    orphans: Vec<String>,
}

impl<O: SessionOps, E: EventSink> OrphanSessionCheck<O, E> {
    pub fn new(ops: O, events: E, town: TownConfig, prefix: impl Into<String>) -> Self {
        Self {
            ops,
            events,
            town,
            prefix: prefix.into(),
            orphans: Vec::new(),
        }
    }

    /// Orphans cached by the last `run`.
    pub fn orphans(&self) -> &[String] {
        &self.orphans
    }

    fn is_valid(&self, session: &str, roster: &WorkspaceRoster) -> bool {
        if roster.is_town_singleton(session) {
            return true;
        }
        split_rig(session, &self.prefix).is_some_and(|(rig, _)| roster.is_rig(rig))
    }

    /// A kill failed with an unclassified error; the session may still have
    /// gone with the server.
    fn is_gone(&self, session: &str) -> bool {
        self.ops
            .list_sessions()
            .is_ok_and(|sessions| !sessions.iter().any(|s| s == session))
    }
}

impl<O: SessionOps, E: EventSink> Check for OrphanSessionCheck<O, E> {
    fn name(&self) -> &'static str {
        CHECK_NAME
    }

    fn description(&self) -> &'static str {
        "Detect tmux sessions that belong to no known rig"
    }

    fn run(&mut self, ctx: &CheckContext) -> CheckResult {
        self.orphans.clear();

        let sessions = match self.ops.list_sessions() {
            Ok(sessions) => sessions,
            Err(e) => {
                return CheckResult::warning(CHECK_NAME, "Could not list tmux sessions")
                    .with_details(vec![e.to_string()]);
            }
        };
        if sessions.is_empty() {
            return CheckResult::ok(CHECK_NAME, "No tmux sessions found");
        }

        let roster = match WorkspaceRoster::load(&ctx.town_root, &self.town) {
            Ok(roster) => roster,
            Err(e) => {
                return CheckResult::warning(CHECK_NAME, "Could not read workspace roster")
                    .with_details(vec![format!("{e:#}")]);
            }
        };

        let mut valid = 0usize;
        let mut orphans = Vec::new();
        for session in sessions {
            if session.is_empty() || !session.starts_with(self.prefix.as_str()) {
                continue;
            }
            if self.is_valid(&session, &roster) {
                valid += 1;
            } else {
                debug!(session = %session, "orphan session");
                orphans.push(session);
            }
        }

        if orphans.is_empty() {
            return CheckResult::ok(CHECK_NAME, format!("All {valid} fleet sessions are valid"));
        }

        let details = orphans.iter().map(|s| format!("Orphan: {s}")).collect();
        let message = format!("Found {} orphaned session(s)", orphans.len());
        self.orphans = orphans;
        CheckResult::warning(CHECK_NAME, message)
            .with_details(details)
            .with_fix_hint("Run 'warden doctor --fix' to kill orphaned sessions")
    }

    fn fix(&mut self, ctx: &CheckContext) -> FixReport {
        let mut report = FixReport::new(ctx.dry_run);

        for session in mem::take(&mut self.orphans) {
            if is_crew_session_with_prefix(&session, &self.prefix) {
                info!(session = %session, "crew session is never killed automatically");
                report.protected += 1;
                continue;
            }

            if ctx.dry_run {
                report.killed += 1;
                report.actions.push(format!("would kill session {session}"));
                continue;
            }

            let event =
                FeedEvent::session_death(&session, "unknown", "orphan cleanup", DOCTOR_CALLER);
            if let Err(e) = self.events.log_fact(&event) {
                warn!(session = %session, error = %e, "failed to record session death");
            }

            match self.ops.kill_session(&session) {
                Ok(()) => {
                    report.killed += 1;
                    report.actions.push(format!("killed session {session}"));
                }
                Err(e) if e.is_absent() => report.vanished += 1,
                Err(e) if self.is_gone(&session) => {
                    debug!(session = %session, error = %e, "session gone despite kill error");
                    report.vanished += 1;
                }
                Err(e) => report.errors.push(format!("{session}: {e}")),
            }
        }

        report
    }
}
