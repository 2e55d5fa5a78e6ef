//! Native process-tree inspection over `/proc`.
//!
//! Every query is a handful of direct file reads against the kernel's
//! per-PID records; nothing here spawns a helper process. A missing or
//! unreadable record is how a process reports that it is gone, so read
//! failures surface as empty results rather than errors.

pub mod scan;
pub mod signal;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tracing::trace;

/// Default mount point of the kernel process table.
pub const PROC_ROOT: &str = "/proc";

/// Upper bound on tree depth for descendant walks. Real trees are shallow;
/// the cap only matters if the table is corrupt.
pub const MAX_TREE_DEPTH: usize = 64;

/// One sampled process record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessNode {
    pub pid: u32,
    pub parent_pid: u32,
    pub command_name: String,
    pub command_line: String,
}

/// One descendant as a walk found it.
#[derive(Debug, Clone, Copy)]
struct Seen {
    pid: u32,
    parent: u32,
    depth: usize,
}

/// Query façade over a `/proc`-shaped directory.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl Default for ProcFs {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcFs {
    pub fn new() -> Self {
        Self::with_root(PROC_ROOT)
    }

    /// Inspect a process table mounted somewhere other than `/proc`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.root.join(pid.to_string())
    }

    fn read_string(&self, pid: u32, file: &str) -> Option<String> {
        fs::read(self.pid_dir(pid).join(file))
            .ok()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Direct children of `pid`, from `<pid>/task/<pid>/children`.
    pub fn children(&self, pid: u32) -> Vec<u32> {
        let path = self
            .pid_dir(pid)
            .join("task")
            .join(pid.to_string())
            .join("children");
        let Ok(data) = fs::read_to_string(&path) else {
            return Vec::new();
        };
        data.split_whitespace()
            .filter_map(|field| field.parse().ok())
            .collect()
    }

    /// Every descendant of `pid`, deepest first: a process always appears
    /// before its parent, so signalling the list in order never orphans a
    /// still-targeted child.
    pub fn all_descendants(&self, pid: u32) -> Vec<u32> {
        self.walk(pid).into_iter().map(|seen| seen.pid).collect()
    }

    /// Post-order walk recording where each descendant hung.
    fn walk(&self, pid: u32) -> Vec<Seen> {
        let mut out = Vec::new();
        let mut visited = HashSet::from([pid]);
        let mut stack = vec![(pid, 0u32, 0usize, self.children(pid).into_iter())];

        loop {
            let next = match stack.last_mut() {
                Some((parent, _, depth, pending)) => {
                    pending.next().map(|child| (child, *parent, *depth + 1))
                }
                None => break,
            };

            match next {
                Some((child, parent, depth)) => {
                    if !visited.insert(child) {
                        continue;
                    }
                    let grandchildren = if depth < MAX_TREE_DEPTH {
                        self.children(child)
                    } else {
                        trace!(pid = child, "descendant walk hit depth cap");
                        Vec::new()
                    };
                    stack.push((child, parent, depth, grandchildren.into_iter()));
                }
                None => {
                    if let Some((done, parent, depth, _)) = stack.pop() {
                        if done != pid {
                            out.push(Seen {
                                pid: done,
                                parent,
                                depth,
                            });
                        }
                    }
                }
            }
        }

        out
    }

    /// Rescan the subtree `attempts` times and merge the results, catching
    /// children forked while an earlier pass was walking.
    ///
    /// The final pass keeps its deepest-first order. PIDs only seen in
    /// earlier passes (exited or reparented away) are slotted in just before
    /// their last known parent, shallowest first, so the merge stays
    /// deepest-first.
    pub fn descendants_with_retry(&self, pid: u32, attempts: u32, delay: Duration) -> Vec<u32> {
        self.merged_descendants(pid, attempts, |_| std::thread::sleep(delay))
    }

    /// [`Self::descendants_with_retry`] with `between(attempt)` run before
    /// every pass after the first.
    fn merged_descendants(
        &self,
        pid: u32,
        attempts: u32,
        mut between: impl FnMut(u32),
    ) -> Vec<u32> {
        let attempts = attempts.max(1);
        let mut history: HashMap<u32, Seen> = HashMap::new();
        let mut last = Vec::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                between(attempt);
            }
            last = self.walk(pid);
            for seen in &last {
                history.insert(seen.pid, *seen);
            }
        }

        let mut merged: Vec<u32> = last.iter().map(|seen| seen.pid).collect();
        let mut stale: Vec<Seen> = history
            .into_values()
            .filter(|seen| !merged.contains(&seen.pid))
            .collect();
        stale.sort_by_key(|seen| (seen.depth, seen.pid));
        for seen in stale {
            let at = merged.iter().position(|p| *p == seen.parent).unwrap_or(0);
            merged.insert(at, seen.pid);
        }
        merged
    }

    /// Kernel command name (`comm`), or empty when unreadable.
    pub fn command_name(&self, pid: u32) -> String {
        self.read_string(pid, "comm")
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    /// Full argv joined with spaces, or empty when unreadable.
    pub fn command_line(&self, pid: u32) -> String {
        self.read_string(pid, "cmdline")
            .map(|s| s.replace('\0', " ").trim().to_string())
            .unwrap_or_default()
    }

    /// Current parent PID read from `stat`.
    pub fn parent_pid(&self, pid: u32) -> Option<u32> {
        let stat = self.read_string(pid, "stat")?;
        parse_stat_ppid(&stat)
    }

    pub fn node(&self, pid: u32) -> Option<ProcessNode> {
        let parent_pid = self.parent_pid(pid)?;
        Some(ProcessNode {
            pid,
            parent_pid,
            command_name: self.command_name(pid),
            command_line: self.command_line(pid),
        })
    }

    /// All PIDs currently present in the table, ascending.
    pub fn pids(&self) -> Vec<u32> {
        let Ok(entries) = fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut pids: Vec<u32> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
            .collect();
        pids.sort_unstable();
        pids
    }

    /// Sample every readable process. Processes that exit mid-scan drop out.
    pub fn snapshot(&self) -> Vec<ProcessNode> {
        self.pids().into_iter().filter_map(|pid| self.node(pid)).collect()
    }

    /// First descendant of `pid` whose command name satisfies `matches`.
    pub fn find_descendant(&self, pid: u32, matches: impl Fn(&str) -> bool) -> Option<u32> {
        let mut visited = HashSet::from([pid]);
        let mut stack = vec![(pid, 0usize)];

        while let Some((current, depth)) = stack.pop() {
            if depth >= MAX_TREE_DEPTH {
                continue;
            }
            for child in self.children(current) {
                if !visited.insert(child) {
                    continue;
                }
                if matches(&self.command_name(child)) {
                    return Some(child);
                }
                stack.push((child, depth + 1));
            }
        }
        None
    }

    /// Whether any descendant's command name equals one of `names`.
    pub fn has_descendant_matching<S: AsRef<str>>(&self, pid: u32, names: &[S]) -> bool {
        if names.is_empty() {
            return false;
        }
        self.find_descendant(pid, |comm| names.iter().any(|n| n.as_ref() == comm))
            .is_some()
    }
}

/// Extract the parent PID from a `stat` line. The command name sits in
/// parentheses and may itself contain spaces or parentheses, so parsing
/// starts after the last `)`.
fn parse_stat_ppid(stat: &str) -> Option<u32> {
    let after_comm = &stat[stat.rfind(')')? + 1..];
    let mut fields = after_comm.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}
