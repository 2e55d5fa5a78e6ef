//! Town layout: which rigs exist and what the singletons are called.
//!
//! A town is a directory holding `mayor/rigs.json` plus one directory per
//! rig. A rig directory is recognized by a `polecats/` or `crew/` child.

use std::collections::BTreeSet;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::config::TownConfig;

const MAYOR_DIR: &str = "mayor";
const RIGS_MANIFEST: &str = "rigs.json";
const BEADS_DIR: &str = ".beads";
const RIG_MARKERS: [&str; 2] = ["polecats", "crew"];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkspaceRoster {
    pub rigs: BTreeSet<String>,
    pub mayor_session: String,
    pub deacon_session: String,
}

impl WorkspaceRoster {
    /// Scan `town_root`. Without a rigs manifest no rig is valid; an
    /// unreadable town root is an error.
    pub fn load(town_root: &Path, town: &TownConfig) -> Result<Self> {
        let mut roster = Self {
            rigs: BTreeSet::new(),
            mayor_session: town.mayor_session.clone(),
            deacon_session: town.deacon_session.clone(),
        };

        if !town_root.join(MAYOR_DIR).join(RIGS_MANIFEST).is_file() {
            debug!(town = %town_root.display(), "no rigs manifest, no valid rigs");
            return Ok(roster);
        }

        let entries = std::fs::read_dir(town_root)
            .with_context(|| format!("failed to read town root {}", town_root.display()))?;
        for entry in entries.flatten() {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if name == MAYOR_DIR || name == BEADS_DIR || name.starts_with('.') {
                continue;
            }
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            if RIG_MARKERS.iter().any(|marker| path.join(marker).is_dir()) {
                roster.rigs.insert(name);
            }
        }

        debug!(rigs = roster.rigs.len(), "loaded workspace roster");
        Ok(roster)
    }

    pub fn is_rig(&self, rig: &str) -> bool {
        self.rigs.contains(rig)
    }

    /// One of the two town-level singleton sessions.
    pub fn is_town_singleton(&self, session: &str) -> bool {
        (!self.mayor_session.is_empty() && session == self.mayor_session)
            || (!self.deacon_session.is_empty() && session == self.deacon_session)
    }
}
