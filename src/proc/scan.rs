//! Full-table scans by command line.
//!
//! Replaces `pgrep -f <pattern>` pipelines with a direct walk over the
//! process table.

use regex::Regex;

use super::{ProcFs, ProcessNode};

impl ProcFs {
    /// PIDs whose command line contains `pattern` as a plain substring.
    ///
    /// An empty pattern matches nothing, and the calling process never
    /// matches itself.
    pub fn find_by_pattern(&self, pattern: &str) -> Vec<u32> {
        if pattern.is_empty() {
            return Vec::new();
        }
        let me = std::process::id();
        self.pids()
            .into_iter()
            .filter(|pid| *pid != me)
            .filter(|pid| self.command_line(*pid).contains(pattern))
            .collect()
    }

    pub fn count_by_pattern(&self, pattern: &str) -> usize {
        self.find_by_pattern(pattern).len()
    }

    /// Processes whose command name, or whose executable (first argv word),
    /// matches `include`, minus anything whose command line matches
    /// `exclude`.
    pub fn find_by_regex(&self, include: &Regex, exclude: Option<&Regex>) -> Vec<ProcessNode> {
        self.snapshot()
            .into_iter()
            .filter(|node| {
                let executable = node.command_line.split_whitespace().next().unwrap_or("");
                include.is_match(&node.command_name) || include.is_match(executable)
            })
            .filter(|node| {
                !exclude.is_some_and(|ex| {
                    ex.is_match(&node.command_line) || ex.is_match(&node.command_name)
                })
            })
            .collect()
    }
}
