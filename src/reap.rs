//! Stopping background daemons by command-line pattern.

use std::thread;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CleanupConfig;
use crate::proc::ProcFs;
use crate::proc::signal::{KernelSignaller, Signal, Signaller, signal_all};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopOutcome {
    pub pattern: String,
    pub before: usize,
    pub killed: usize,
    pub remaining: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    pub outcomes: Vec<StopOutcome>,
    pub dry_run: bool,
}

impl ShutdownReport {
    pub fn remaining(&self) -> usize {
        self.outcomes.iter().map(|o| o.remaining).sum()
    }

    /// A real shutdown fails if anything survived it.
    pub fn into_result(self) -> Result<Self> {
        let remaining = self.remaining();
        if !self.dry_run && remaining > 0 {
            bail!("shutdown incomplete: {remaining} still running");
        }
        Ok(self)
    }
}

pub struct Reaper<S = KernelSignaller> {
    procfs: ProcFs,
    signaller: S,
    grace: Duration,
    settle: Duration,
}

impl<S: Signaller> Reaper<S> {
    pub fn new(procfs: ProcFs, signaller: S, cleanup: &CleanupConfig) -> Self {
        Self {
            procfs,
            signaller,
            grace: cleanup.sigterm_grace(),
            settle: cleanup.settle(),
        }
    }

    /// Stop every process whose command line contains `pattern`.
    ///
    /// Without `force`, sends SIGTERM, waits out the grace period and
    /// SIGKILLs whatever a fresh scan still finds. Processes that appear
    /// meanwhile can make the after-count exceed the before-count; the
    /// kill count then clamps to zero.
    pub fn stop_matching(&self, pattern: &str, force: bool) -> StopOutcome {
        let pids = self.procfs.find_by_pattern(pattern);
        let before = pids.len();
        if before == 0 {
            return StopOutcome {
                pattern: pattern.to_string(),
                before: 0,
                killed: 0,
                remaining: 0,
            };
        }

        if force {
            signal_all(&self.signaller, &pids, Signal::Kill);
        } else {
            let polite = signal_all(&self.signaller, &pids, Signal::Term);
            debug!(pattern, sent = polite.sent, "sent SIGTERM");
            thread::sleep(self.grace);

            let survivors = self.procfs.find_by_pattern(pattern);
            if !survivors.is_empty() {
                let forced = signal_all(&self.signaller, &survivors, Signal::Kill);
                warn!(
                    pattern,
                    survivors = survivors.len(),
                    force_killed = forced.sent,
                    "escalated to SIGKILL"
                );
            }
        }

        thread::sleep(self.settle);

        let remaining = self.procfs.count_by_pattern(pattern);
        let killed = before.saturating_sub(remaining);
        info!(pattern, killed, remaining, "stopped matching processes");
        StopOutcome {
            pattern: pattern.to_string(),
            before,
            killed,
            remaining,
        }
    }

    /// What [`Self::stop_matching`] would target, without signalling.
    pub fn preview(&self, pattern: &str) -> StopOutcome {
        let before = self.procfs.count_by_pattern(pattern);
        StopOutcome {
            pattern: pattern.to_string(),
            before,
            killed: 0,
            remaining: before,
        }
    }

    pub fn stop_all<P: AsRef<str>>(
        &self,
        patterns: &[P],
        force: bool,
        dry_run: bool,
    ) -> ShutdownReport {
        let outcomes = patterns
            .iter()
            .map(|p| {
                if dry_run {
                    self.preview(p.as_ref())
                } else {
                    self.stop_matching(p.as_ref(), force)
                }
            })
            .collect();
        ShutdownReport { outcomes, dry_run }
    }
}
