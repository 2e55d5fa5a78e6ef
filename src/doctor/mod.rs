//! Health checks that find leftovers of crashed agents and, on request,
//! clean them up.
//!
//! Every check has two phases. `run` inspects and caches what it found;
//! `fix` consumes that cache, re-verifies each target against freshly
//! sampled state, and only then acts. A cache is never reused across runs.

pub mod orphan_processes;
pub mod orphan_sessions;

use std::path::PathBuf;

use anyhow::{Result, bail};
use serde::Serialize;
use tracing::{debug, info};

use crate::lock::RemediationLock;

pub use orphan_processes::{
    OrphanCandidate, OrphanProcessCheck, PaneRegistry, ProcessLister, SystemProcessLister,
};
pub use orphan_sessions::{OrphanSessionCheck, SessionOps};

/// Recorded as `caller` on every event remediation emits.
pub const DOCTOR_CALLER: &str = "warden doctor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

impl CheckStatus {
    pub fn symbol(self) -> &'static str {
        match self {
            CheckStatus::Ok => "✓",
            CheckStatus::Warning => "⚠",
            CheckStatus::Error => "✗",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix_hint: Option<String>,
}

impl CheckResult {
    pub fn new(name: &str, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            details: Vec::new(),
            fix_hint: None,
        }
    }

    pub fn ok(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Ok, message)
    }

    pub fn warning(name: &str, message: impl Into<String>) -> Self {
        Self::new(name, CheckStatus::Warning, message)
    }

    pub fn with_details(mut self, details: Vec<String>) -> Self {
        self.details = details;
        self
    }

    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct CheckContext {
    pub town_root: PathBuf,
    /// Classify and report, but change nothing.
    pub dry_run: bool,
}

/// Counts from one `fix` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FixReport {
    /// Targets acted on, or that would be acted on in a dry run.
    pub killed: usize,
    /// Targets that no longer qualified when re-verified.
    pub skipped: usize,
    /// Targets exempt from automatic termination.
    pub protected: usize,
    /// Targets that were already gone.
    pub vanished: usize,
    pub errors: Vec<String>,
    pub actions: Vec<String>,
    pub dry_run: bool,
}

impl FixReport {
    pub fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            ..Self::default()
        }
    }

    /// Partial success is success: this fails only when nothing was killed
    /// and something went wrong.
    pub fn into_result(self, check: &str) -> Result<Self> {
        if self.killed == 0 && !self.errors.is_empty() {
            bail!("{check}: {}", self.errors.join("; "));
        }
        Ok(self)
    }
}

pub trait Check {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    /// Inspect and cache targets for a following [`Check::fix`].
    fn run(&mut self, ctx: &CheckContext) -> CheckResult;
    /// Act on what the last `run` cached, re-verifying each target first.
    fn fix(&mut self, ctx: &CheckContext) -> FixReport;
}

#[derive(Debug, Clone, Serialize)]
pub struct FixOutcome {
    pub check: String,
    pub report: FixReport,
}

/// Runs a set of checks and, optionally, their fixes.
#[derive(Default)]
pub struct Doctor {
    checks: Vec<Box<dyn Check>>,
}

impl Doctor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, check: Box<dyn Check>) -> Self {
        self.checks.push(check);
        self
    }

    pub fn run(&mut self, ctx: &CheckContext) -> Vec<CheckResult> {
        self.checks
            .iter_mut()
            .map(|check| {
                debug!(check = check.name(), description = check.description(), "running check");
                let result = check.run(ctx);
                info!(
                    check = check.name(),
                    status = ?result.status,
                    message = %result.message,
                    "check finished"
                );
                result
            })
            .collect()
    }

    /// Fix every check whose last result was not OK. Real passes hold the
    /// town's remediation lock for their whole duration; dry runs do not.
    pub fn fix(&mut self, ctx: &CheckContext, results: &[CheckResult]) -> Result<Vec<FixOutcome>> {
        let _lock = if ctx.dry_run {
            None
        } else {
            Some(RemediationLock::acquire(&ctx.town_root)?)
        };

        let mut outcomes = Vec::new();
        for (check, result) in self.checks.iter_mut().zip(results) {
            if result.status == CheckStatus::Ok {
                continue;
            }
            let report = check.fix(ctx);
            info!(
                check = check.name(),
                killed = report.killed,
                skipped = report.skipped,
                protected = report.protected,
                errors = report.errors.len(),
                dry_run = report.dry_run,
                "fix finished"
            );
            outcomes.push(FixOutcome {
                check: check.name().to_string(),
                report,
            });
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scripted {
        status: CheckStatus,
        fixes: usize,
    }

    impl Check for Scripted {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn description(&self) -> &'static str {
            "returns a fixed status"
        }

        fn run(&mut self, _ctx: &CheckContext) -> CheckResult {
            CheckResult::new(self.name(), self.status, "scripted")
        }

        fn fix(&mut self, ctx: &CheckContext) -> FixReport {
            self.fixes += 1;
            let mut report = FixReport::new(ctx.dry_run);
            report.killed = self.fixes;
            report
        }
    }

    fn ctx(root: &std::path::Path, dry_run: bool) -> CheckContext {
        CheckContext {
            town_root: root.to_path_buf(),
            dry_run,
        }
    }

    #[test]
    fn into_result_fails_only_on_total_failure() {
        let mut report = FixReport::new(false);
        assert!(report.clone().into_result("x").is_ok());

        report.errors.push("failed to kill PID 7".into());
        let err = report.clone().into_result("orphan-processes").unwrap_err();
        assert_eq!(err.to_string(), "orphan-processes: failed to kill PID 7");

        report.killed = 1;
        assert!(report.into_result("x").is_ok());
    }

    #[test]
    fn fix_skips_healthy_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let mut doctor = Doctor::new()
            .with_check(Box::new(Scripted {
                status: CheckStatus::Ok,
                fixes: 0,
            }))
            .with_check(Box::new(Scripted {
                status: CheckStatus::Warning,
                fixes: 0,
            }));
        let ctx = ctx(tmp.path(), false);
        let results = doctor.run(&ctx);
        assert_eq!(results.len(), 2);

        let outcomes = doctor.fix(&ctx, &results).unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].report.killed, 1);
        assert!(RemediationLock::path_for(tmp.path()).exists());
    }

    #[cfg(unix)]
    #[test]
    fn concurrent_fix_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let _held = RemediationLock::acquire(tmp.path()).unwrap();
        let mut doctor = Doctor::new().with_check(Box::new(Scripted {
            status: CheckStatus::Warning,
            fixes: 0,
        }));
        let ctx = ctx(tmp.path(), false);
        let results = doctor.run(&ctx);
        assert!(doctor.fix(&ctx, &results).is_err());

        // A dry run changes nothing and needs no lock.
        let dry = CheckContext {
            dry_run: true,
            ..ctx
        };
        let outcomes = doctor.fix(&dry, &results).unwrap();
        assert!(outcomes[0].report.dry_run);
    }

    #[test]
    fn result_builders() {
        let result = CheckResult::warning("orphan-sessions", "Found 1 orphaned session(s)")
            .with_details(vec!["Orphan: gt-ghost-Toast".into()])
            .with_fix_hint("Run 'warden doctor --fix' to kill orphaned sessions");
        assert_eq!(result.status, CheckStatus::Warning);
        assert_eq!(result.details.len(), 1);
        assert!(result.fix_hint.is_some());
        assert_eq!(CheckResult::ok("x", "fine").status.symbol(), "✓");
    }
}
