//! Agent runtimes running outside any tmux pane.
//!
//! A runtime is orphaned when none of its ancestors, within a bounded
//! walk, is a tmux server or pane process. The pane registry is external
//! state that changes under us, so `fix` resamples it and re-walks each
//! candidate's ancestry right before signalling.

use std::collections::HashSet;
use std::mem;

use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use super::{Check, CheckContext, CheckResult, FixReport};
use crate::config::OrphansConfig;
use crate::proc::ProcFs;
use crate::proc::signal::{KernelSignaller, Signal, Signaller, is_no_such_process};
use crate::tmux::Tmux;

pub const CHECK_NAME: &str = "orphan-processes";

/// A runtime process as seen by `run`. Never updated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrphanCandidate {
    pub pid: u32,
    pub ppid: u32,
    pub command_line: String,
}

/// Where the check gets its view of processes and panes.
pub trait ProcessLister {
    fn tmux_server_pids(&self) -> Result<Vec<u32>>;
    fn pane_pids(&self) -> Result<Vec<u32>>;
    fn runtime_processes(&self) -> Result<Vec<OrphanCandidate>>;
    /// Current parent, re-read on every call.
    fn parent_pid(&self, pid: u32) -> Option<u32>;
    fn command_line(&self, pid: u32) -> String;
}

/// Reads `/proc` directly and asks tmux for pane PIDs.
pub struct SystemProcessLister {
    procfs: ProcFs,
    tmux: Tmux,
    runtime: Regex,
    exclude: Option<Regex>,
}

impl SystemProcessLister {
    pub fn new(procfs: ProcFs, tmux: Tmux, orphans: &OrphansConfig) -> Result<Self> {
        Ok(Self {
            procfs,
            tmux,
            runtime: orphans.runtime_regex()?,
            exclude: orphans.exclude_regex()?,
        })
    }
}

fn is_tmux_server(comm: &str) -> bool {
    comm == "tmux" || comm.starts_with("tmux:") || comm.ends_with("/tmux")
}

impl ProcessLister for SystemProcessLister {
    fn tmux_server_pids(&self) -> Result<Vec<u32>> {
        Ok(self
            .procfs
            .snapshot()
            .into_iter()
            .filter(|node| is_tmux_server(&node.command_name))
            .map(|node| node.pid)
            .collect())
    }

    fn pane_pids(&self) -> Result<Vec<u32>> {
        self.tmux
            .list_all_pane_pids()
            .context("failed to list tmux pane PIDs")
    }

    fn runtime_processes(&self) -> Result<Vec<OrphanCandidate>> {
        if self.procfs.pids().is_empty() {
            bail!(
                "process table at {} is empty or unreadable",
                self.procfs.root().display()
            );
        }
        Ok(self
            .procfs
            .find_by_regex(&self.runtime, self.exclude.as_ref())
            .into_iter()
            .map(|node| OrphanCandidate {
                pid: node.pid,
                ppid: node.parent_pid,
                command_line: node.command_line,
            })
            .collect())
    }

    fn parent_pid(&self, pid: u32) -> Option<u32> {
        self.procfs.parent_pid(pid)
    }

    fn command_line(&self, pid: u32) -> String {
        self.procfs.command_line(pid)
    }
}

/// Tmux server PIDs plus every pane's root PID, sampled at one moment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PaneRegistry {
    pids: HashSet<u32>,
}

impl PaneRegistry {
    pub fn sample<L: ProcessLister + ?Sized>(lister: &L) -> Result<Self> {
        let mut pids: HashSet<u32> = lister.tmux_server_pids()?.into_iter().collect();
        pids.extend(lister.pane_pids()?);
        Ok(Self { pids })
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.pids.contains(&pid)
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }
}

impl FromIterator<u32> for PaneRegistry {
    fn from_iter<I: IntoIterator<Item = u32>>(iter: I) -> Self {
        Self {
            pids: iter.into_iter().collect(),
        }
    }
}

/// Walk `candidate`'s current ancestry looking for a registry member.
///
/// Performs at most `max_lookups` parent lookups in total. The walk also
/// stops at PID 1 and on a repeated PID. If the first lookup fails the
/// cached parent is used instead.
pub fn is_orphan<L: ProcessLister + ?Sized>(
    lister: &L,
    candidate: &OrphanCandidate,
    registry: &PaneRegistry,
    max_lookups: usize,
) -> bool {
    if max_lookups == 0 {
        return !registry.contains(candidate.ppid);
    }

    let mut current = lister.parent_pid(candidate.pid).unwrap_or(candidate.ppid);
    let mut lookups = 1;
    let mut visited = HashSet::new();

    while current > 1 && visited.insert(current) {
        if registry.contains(current) {
            return false;
        }
        if lookups >= max_lookups {
            break;
        }
        lookups += 1;
        match lister.parent_pid(current) {
            Some(parent) => current = parent,
            None => break,
        }
    }
    true
}

pub struct OrphanProcessCheck<L, S = KernelSignaller> {
    lister: L,
    signaller: S,
    max_lookups: usize,
    candidates: Vec<OrphanCandidate>,
}

impl<L: ProcessLister, S: Signaller> OrphanProcessCheck<L, S> {
    pub fn new(lister: L, signaller: S, max_ancestry_depth: usize) -> Self {
        Self {
            lister,
            signaller,
            max_lookups: max_ancestry_depth,
            candidates: Vec::new(),
        }
    }

    /// Candidates cached by the last `run`.
    pub fn candidates(&self) -> &[OrphanCandidate] {
        &self.candidates
    }
}

impl<L: ProcessLister, S: Signaller> Check for OrphanProcessCheck<L, S> {
    fn name(&self) -> &'static str {
        CHECK_NAME
    }

    fn description(&self) -> &'static str {
        "Detect agent runtime processes outside tmux"
    }

    fn run(&mut self, _ctx: &CheckContext) -> CheckResult {
        self.candidates.clear();

        let registry = match PaneRegistry::sample(&self.lister) {
            Ok(registry) => registry,
            Err(e) => {
                return CheckResult::warning(CHECK_NAME, "Could not get tmux session info")
                    .with_details(vec![format!("{e:#}")]);
            }
        };
        let runtimes = match self.lister.runtime_processes() {
            Ok(runtimes) => runtimes,
            Err(e) => {
                return CheckResult::warning(CHECK_NAME, "Could not list runtime processes")
                    .with_details(vec![format!("{e:#}")]);
            }
        };
        if runtimes.is_empty() {
            return CheckResult::ok(CHECK_NAME, "No runtime processes found");
        }

        let total = runtimes.len();
        let orphans: Vec<OrphanCandidate> = runtimes
            .into_iter()
            .filter(|candidate| is_orphan(&self.lister, candidate, &registry, self.max_lookups))
            .collect();
        let inside = total - orphans.len();

        if orphans.is_empty() {
            return CheckResult::ok(
                CHECK_NAME,
                format!("All {inside} runtime processes are inside tmux"),
            );
        }

        let mut details = vec![
            format!(
                "These processes have no tmux pane ancestor (checked {} levels).",
                self.max_lookups
            ),
            "Orphaned processes detected:".to_string(),
        ];
        details.extend(orphans.iter().map(|c| {
            format!("  PID {}: {} (parent: {})", c.pid, c.command_line, c.ppid)
        }));

        let message = format!("Found {} orphaned runtime process(es)", orphans.len());
        self.candidates = orphans;
        CheckResult::warning(CHECK_NAME, message)
            .with_details(details)
            .with_fix_hint("Run 'warden doctor --fix' to kill orphaned processes")
    }

    fn fix(&mut self, ctx: &CheckContext) -> FixReport {
        let mut report = FixReport::new(ctx.dry_run);
        let candidates = mem::take(&mut self.candidates);
        if candidates.is_empty() {
            return report;
        }

        let registry = match PaneRegistry::sample(&self.lister) {
            Ok(registry) => registry,
            Err(e) => {
                report
                    .errors
                    .push(format!("failed to resample tmux panes: {e:#}"));
                return report;
            }
        };

        for candidate in candidates {
            let pid = candidate.pid;
            if !is_orphan(&self.lister, &candidate, &registry, self.max_lookups) {
                info!(pid, "process now has a tmux ancestor, skipping");
                report.skipped += 1;
                continue;
            }

            if !self.signaller.exists(pid) {
                debug!(pid, "process already gone");
                report.vanished += 1;
                continue;
            }

            let current = self.lister.command_line(pid);
            if !current.is_empty() && current != candidate.command_line {
                debug!(pid, was = %candidate.command_line, now = %current, "pid reused");
                report.vanished += 1;
                continue;
            }

            if ctx.dry_run {
                report.killed += 1;
                report.actions.push(format!(
                    "would send SIGTERM to PID {pid}: {}",
                    candidate.command_line
                ));
                continue;
            }

            match self.signaller.send(pid, Signal::Term) {
                Ok(()) => {
                    info!(pid, command = %candidate.command_line, "sent SIGTERM to orphan");
                    report.killed += 1;
                    report.actions.push(format!(
                        "sent SIGTERM to PID {pid}: {}",
                        candidate.command_line
                    ));
                }
                Err(e) if is_no_such_process(&e) => report.vanished += 1,
                Err(e) => report.errors.push(format!("failed to kill PID {pid}: {e}")),
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::path::Path;

    use super::*;
    use crate::doctor::CheckStatus;
    use crate::proc::signal::testing::RecordingSignaller;
    use crate::proc::testing::SyntheticProc;

    /// Process table and pane list held in memory; counts parent lookups.
    #[derive(Default)]
    struct FakeLister {
        parents: RefCell<HashMap<u32, u32>>,
        cmdlines: RefCell<HashMap<u32, String>>,
        servers: Vec<u32>,
        panes: RefCell<Vec<u32>>,
        runtimes: Vec<OrphanCandidate>,
        fail_panes: Cell<bool>,
        fail_runtimes: bool,
        lookups: Cell<usize>,
    }

    impl FakeLister {
        fn process(self, pid: u32, ppid: u32, cmdline: &str) -> Self {
            self.parents.borrow_mut().insert(pid, ppid);
            self.cmdlines.borrow_mut().insert(pid, cmdline.to_string());
            self
        }

        fn runtime(mut self, pid: u32) -> Self {
            let ppid = self.parents.borrow()[&pid];
            let command_line = self.cmdlines.borrow()[&pid].clone();
            self.runtimes.push(OrphanCandidate {
                pid,
                ppid,
                command_line,
            });
            self
        }
    }

    impl ProcessLister for FakeLister {
        fn tmux_server_pids(&self) -> Result<Vec<u32>> {
            Ok(self.servers.clone())
        }

        fn pane_pids(&self) -> Result<Vec<u32>> {
            if self.fail_panes.get() {
                bail!("error connecting to /tmp/tmux-1000/default");
            }
            Ok(self.panes.borrow().clone())
        }

        fn runtime_processes(&self) -> Result<Vec<OrphanCandidate>> {
            if self.fail_runtimes {
                bail!("process table unreadable");
            }
            Ok(self.runtimes.clone())
        }

        fn parent_pid(&self, pid: u32) -> Option<u32> {
            self.lookups.set(self.lookups.get() + 1);
            self.parents.borrow().get(&pid).copied()
        }

        fn command_line(&self, pid: u32) -> String {
            self.cmdlines.borrow().get(&pid).cloned().unwrap_or_default()
        }
    }

    fn ctx(dry_run: bool) -> CheckContext {
        CheckContext {
            town_root: Path::new("/nonexistent-town").to_path_buf(),
            dry_run,
        }
    }

    /// 100 is a tmux pane; 200 runs under it. 300 hangs off init.
    fn mixed_lister() -> FakeLister {
        let lister = FakeLister {
            servers: vec![50],
            panes: RefCell::new(vec![100]),
            ..FakeLister::default()
        };
        lister
            .process(50, 1, "tmux: server")
            .process(100, 50, "-bash")
            .process(150, 100, "bash -c claude")
            .process(200, 150, "claude")
            .process(300, 1, "claude --resume")
            .runtime(200)
            .runtime(300)
    }

    #[test]
    fn run_caches_only_orphans() {
        let mut check = OrphanProcessCheck::new(mixed_lister(), RecordingSignaller::default(), 8);
        let result = check.run(&ctx(false));
        assert_eq!(result.status, CheckStatus::Warning);
        assert_eq!(result.message, "Found 1 orphaned runtime process(es)");
        assert_eq!(
            check.candidates(),
            [OrphanCandidate {
                pid: 300,
                ppid: 1,
                command_line: "claude --resume".into()
            }]
        );
        assert!(result.details[2].contains("PID 300: claude --resume (parent: 1)"));
    }

    #[test]
    fn all_inside_tmux_is_ok() {
        let lister = FakeLister {
            servers: vec![50],
            panes: RefCell::new(vec![100]),
            ..FakeLister::default()
        }
        .process(100, 50, "-bash")
        .process(200, 100, "claude")
        .runtime(200);
        let mut check = OrphanProcessCheck::new(lister, RecordingSignaller::default(), 8);
        let result = check.run(&ctx(false));
        assert_eq!(result.status, CheckStatus::Ok);
        assert_eq!(result.message, "All 1 runtime processes are inside tmux");
    }

    #[test]
    fn listing_failures_degrade_to_warnings() {
        let lister = mixed_lister();
        lister.fail_panes.set(true);
        let mut check = OrphanProcessCheck::new(lister, RecordingSignaller::default(), 8);
        let result = check.run(&ctx(false));
        assert_eq!(result.status, CheckStatus::Warning);
        assert_eq!(result.message, "Could not get tmux session info");

        let lister = FakeLister {
            fail_runtimes: true,
            ..FakeLister::default()
        };
        let mut check = OrphanProcessCheck::new(lister, RecordingSignaller::default(), 8);
        let result = check.run(&ctx(false));
        assert_eq!(result.message, "Could not list runtime processes");
    }

    #[test]
    fn deep_chain_uses_bounded_lookups() {
        // 1000 -> 1001 -> ... -> 1020, runtime at the bottom, no tmux anywhere.
        let mut lister = FakeLister::default().process(1000, 1, "sh");
        for pid in 1001..=1020 {
            lister = lister.process(pid, pid - 1, "sh");
        }
        let lister = lister.process(1021, 1020, "claude");
        let candidate = OrphanCandidate {
            pid: 1021,
            ppid: 1020,
            command_line: "claude".into(),
        };

        assert!(is_orphan(&lister, &candidate, &PaneRegistry::default(), 8));
        assert!(lister.lookups.get() <= 8);
    }

    #[test]
    fn ancestor_beyond_bound_is_not_seen() {
        // Pane at 1000, runtime nine levels below it.
        let mut lister = FakeLister::default().process(1000, 1, "-bash");
        for pid in 1001..=1009 {
            lister = lister.process(pid, pid - 1, "sh");
        }
        let lister = lister.process(1010, 1009, "claude");
        let candidate = OrphanCandidate {
            pid: 1010,
            ppid: 1009,
            command_line: "claude".into(),
        };
        let registry: PaneRegistry = [1000].into_iter().collect();

        assert!(is_orphan(&lister, &candidate, &registry, 8));
        assert!(!is_orphan(&lister, &candidate, &registry, 10));
    }

    #[test]
    fn ancestry_walk_survives_cycles() {
        let lister = FakeLister::default()
            .process(10, 11, "sh")
            .process(11, 10, "sh")
            .process(12, 10, "claude");
        let candidate = OrphanCandidate {
            pid: 12,
            ppid: 10,
            command_line: "claude".into(),
        };
        assert!(is_orphan(&lister, &candidate, &PaneRegistry::default(), 8));
    }

    #[test]
    fn vanished_process_falls_back_to_cached_parent() {
        let lister = FakeLister::default().process(100, 50, "-bash");
        let candidate = OrphanCandidate {
            pid: 999,
            ppid: 100,
            command_line: "claude".into(),
        };
        let registry: PaneRegistry = [100].into_iter().collect();
        assert!(!is_orphan(&lister, &candidate, &registry, 8));
    }

    #[test]
    fn fix_skips_process_reparented_under_a_pane() {
        let lister = mixed_lister();
        let signaller = RecordingSignaller::with_alive(&[200, 300]);
        let mut check = OrphanProcessCheck::new(lister, &signaller, 8);
        check.run(&ctx(false));
        assert_eq!(check.candidates().len(), 1);

        // Between run and fix, 300 gets adopted by a new pane 400.
        check.lister.parents.borrow_mut().insert(300, 400);
        check.lister.parents.borrow_mut().insert(400, 50);
        check.lister.panes.borrow_mut().push(400);

        let report = check.fix(&ctx(false));
        assert_eq!(report.skipped, 1);
        assert_eq!(report.killed, 0);
        assert!(signaller.deliveries().is_empty());
    }

    #[test]
    fn fix_signals_confirmed_orphans() {
        let signaller = RecordingSignaller::with_alive(&[200, 300]);
        let mut check = OrphanProcessCheck::new(mixed_lister(), &signaller, 8);
        check.run(&ctx(false));

        let report = check.fix(&ctx(false)).into_result(CHECK_NAME).unwrap();
        assert_eq!(report.killed, 1);
        assert_eq!(signaller.deliveries(), vec![(300, Signal::Term)]);
        assert!(check.candidates().is_empty());
    }

    #[test]
    fn fix_counts_vanished_and_reused_pids() {
        let lister = FakeLister::default()
            .process(300, 1, "claude")
            .process(301, 1, "claude")
            .runtime(300)
            .runtime(301);
        // 300 exited; 301 was reused by something else.
        let signaller = RecordingSignaller::with_alive(&[301]);
        let mut check = OrphanProcessCheck::new(lister, &signaller, 8);
        check.run(&ctx(false));
        check
            .lister
            .cmdlines
            .borrow_mut()
            .insert(301, "vim notes.md".into());

        let report = check.fix(&ctx(false));
        assert_eq!(report.vanished, 2);
        assert_eq!(report.killed, 0);
        assert!(report.errors.is_empty());
        assert!(signaller.deliveries().is_empty());
    }

    #[test]
    fn dry_run_reports_without_signalling() {
        let lister = FakeLister::default()
            .process(300, 1, "claude")
            .process(301, 1, "codex")
            .process(302, 1, "claude-code")
            .runtime(300)
            .runtime(301)
            .runtime(302);
        let signaller = RecordingSignaller::with_alive(&[300, 301, 302]);
        let mut check = OrphanProcessCheck::new(lister, &signaller, 8);
        check.run(&ctx(true));

        let report = check.fix(&ctx(true));
        assert!(report.dry_run);
        assert_eq!(report.killed, 3);
        assert_eq!(report.actions.len(), 3);
        assert!(report.actions[0].starts_with("would send SIGTERM to PID 300"));
        assert!(signaller.deliveries().is_empty());
    }

    #[test]
    fn resample_failure_is_an_error() {
        let lister = mixed_lister();
        let mut check = OrphanProcessCheck::new(lister, RecordingSignaller::default(), 8);
        check.run(&ctx(false));
        check.lister.fail_panes.set(true);

        let report = check.fix(&ctx(false));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].contains("failed to resample tmux panes"));
        assert!(report.into_result(CHECK_NAME).is_err());
    }

    #[test]
    fn signal_failures_fail_only_without_any_kill() {
        struct Refusing;
        impl Signaller for Refusing {
            fn send(&self, _pid: u32, signal: Signal) -> std::io::Result<()> {
                match signal {
                    Signal::Probe => Ok(()),
                    _ => Err(std::io::Error::from(std::io::ErrorKind::PermissionDenied)),
                }
            }
        }
        let lister = FakeLister::default()
            .process(300, 1, "claude")
            .runtime(300);
        let mut check = OrphanProcessCheck::new(lister, Refusing, 8);
        check.run(&ctx(false));
        let report = check.fix(&ctx(false));
        assert_eq!(report.errors, vec!["failed to kill PID 300: permission denied"]);
        assert!(report.into_result(CHECK_NAME).is_err());
    }

    #[test]
    fn system_lister_over_synthetic_table() {
        let table = SyntheticProc::new();
        table
            .spawn(1, 0, "init", &["/sbin/init"])
            .spawn(50, 1, "tmux: server", &["tmux", "new-session"])
            .spawn(100, 50, "bash", &["-bash"])
            .spawn(200, 100, "claude", &["claude"])
            .spawn(300, 1, "claude", &["claude", "--resume"])
            .spawn(
                400,
                1,
                "Claude",
                &["/Applications/Claude.app/Contents/MacOS/Claude"],
            );
        let lister =
            SystemProcessLister::new(table.procfs(), Tmux::new(), &OrphansConfig::default())
                .unwrap();

        assert_eq!(lister.tmux_server_pids().unwrap(), vec![50]);
        let runtimes: Vec<u32> = lister
            .runtime_processes()
            .unwrap()
            .into_iter()
            .map(|c| c.pid)
            .collect();
        assert_eq!(runtimes, vec![200, 300]);
        assert_eq!(lister.parent_pid(200), Some(100));
        assert_eq!(lister.command_line(300), "claude --resume");
    }

    #[test]
    fn empty_process_table_is_an_error() {
        let table = SyntheticProc::new();
        let lister =
            SystemProcessLister::new(table.procfs(), Tmux::new(), &OrphansConfig::default())
                .unwrap();
        assert!(lister.runtime_processes().is_err());
    }

    #[test]
    fn tmux_server_names() {
        assert!(is_tmux_server("tmux"));
        assert!(is_tmux_server("tmux: server"));
        assert!(is_tmux_server("/usr/bin/tmux"));
        assert!(!is_tmux_server("tmuxinator"));
    }
}
