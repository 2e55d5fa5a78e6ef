//! Signal delivery and best-effort broadcast.

use std::io;
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

/// Signals this crate sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Signal 0: permission and existence check, nothing is delivered.
    Probe,
    Term,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    pub fn as_raw(self) -> i32 {
        match self {
            Signal::Probe => 0,
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Probe => "0",
            Signal::Term => "SIGTERM",
            Signal::Kill => "SIGKILL",
        }
    }
}

/// Anything that can deliver a signal to a PID.
pub trait Signaller {
    fn send(&self, pid: u32, signal: Signal) -> io::Result<()>;

    /// Probe with signal 0. A permission refusal still proves the process
    /// exists; only "no such process" means it is gone.
    fn exists(&self, pid: u32) -> bool {
        match self.send(pid, Signal::Probe) {
            Ok(()) => true,
            Err(err) => err.kind() == io::ErrorKind::PermissionDenied,
        }
    }
}

impl<S: Signaller + ?Sized> Signaller for &S {
    fn send(&self, pid: u32, signal: Signal) -> io::Result<()> {
        (**self).send(pid, signal)
    }
}

/// The target was already gone (`ESRCH`).
pub fn is_no_such_process(err: &io::Error) -> bool {
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ESRCH)
    }
    #[cfg(not(unix))]
    {
        let _ = err;
        false
    }
}

/// Delivers signals with `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelSignaller;

impl Signaller for KernelSignaller {
    #[cfg(unix)]
    fn send(&self, pid: u32, signal: Signal) -> io::Result<()> {
        // pid 0 and negative values address process groups.
        let target = match libc::pid_t::try_from(pid) {
            Ok(target) if target > 0 => target,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("refusing to signal pid {pid}"),
                ));
            }
        };

        if unsafe { libc::kill(target, signal.as_raw()) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn send(&self, _pid: u32, _signal: Signal) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "signals are not supported on this platform",
        ))
    }
}

/// Outcome of a broadcast: how many targets accepted the signal, plus the
/// individual refusals for callers that care.
#[derive(Debug, Default)]
pub struct SignalReport {
    pub sent: usize,
    pub failures: Vec<(u32, io::Error)>,
}

/// Send `signal` to every PID in order. Per-target errors are collected,
/// never propagated.
pub fn signal_all<S: Signaller + ?Sized>(
    signaller: &S,
    pids: &[u32],
    signal: Signal,
) -> SignalReport {
    let mut report = SignalReport::default();
    for &pid in pids {
        match signaller.send(pid, signal) {
            Ok(()) => report.sent += 1,
            Err(err) => {
                debug!(pid, signal = signal.name(), error = %err, "signal not delivered");
                report.failures.push((pid, err));
            }
        }
    }
    report
}

/// Result of a polite-then-forceful subtree kill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TreeKillReport {
    /// Targets that accepted SIGTERM.
    pub terminated: usize,
    /// Survivors of the grace period that accepted SIGKILL.
    pub force_killed: usize,
    /// Survivors that refused SIGKILL as well.
    pub remaining: usize,
}

/// SIGTERM every target in order, wait out `grace`, then SIGKILL whatever
/// is still alive. `targets` must already be deepest-first.
///
/// The grace period is a plain sleep and cannot be interrupted.
pub fn kill_tree<S: Signaller + ?Sized>(
    signaller: &S,
    targets: &[u32],
    grace: Duration,
) -> TreeKillReport {
    let polite = signal_all(signaller, targets, Signal::Term);
    if polite.sent > 0 && !grace.is_zero() {
        thread::sleep(grace);
    }

    let survivors: Vec<u32> = targets
        .iter()
        .copied()
        .filter(|pid| signaller.exists(*pid))
        .collect();
    let forced = signal_all(signaller, &survivors, Signal::Kill);
    if !survivors.is_empty() {
        warn!(
            survivors = survivors.len(),
            force_killed = forced.sent,
            "processes outlived SIGTERM grace period"
        );
    }

    TreeKillReport {
        terminated: polite.sent,
        force_killed: forced.sent,
        remaining: survivors.len() - forced.sent,
    }
}
