use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILENAME: &str = "config.toml";
pub const CONFIG_DIR: &str = ".warden";

/// Which pane processes count as a live agent.
///
/// ```toml
/// [agents]
/// names = ["aider"]
/// defaults = ["node", "claude"]
/// version_pattern = '^\d+\.\d+\.\d+'
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AgentsConfig {
    #[serde(default)]
    pub names: Vec<String>,
    #[serde(default = "default_agent_names")]
    pub defaults: Vec<String>,
    #[serde(default = "default_version_pattern")]
    pub version_pattern: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrphansConfig {
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    #[serde(default = "default_max_ancestry_depth")]
    pub max_ancestry_depth: usize,
    #[serde(default = "default_runtime_pattern")]
    pub runtime_pattern: String,
    #[serde(default = "default_exclude_pattern")]
    pub exclude_pattern: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CleanupConfig {
    #[serde(default = "default_sigterm_grace_millis")]
    pub sigterm_grace_millis: u64,
    #[serde(default = "default_settle_millis")]
    pub settle_millis: u64,
    #[serde(default = "default_descendant_rescan_attempts")]
    pub descendant_rescan_attempts: u32,
    #[serde(default = "default_descendant_rescan_delay_millis")]
    pub descendant_rescan_delay_millis: u64,
    #[serde(default = "default_daemon_patterns")]
    pub daemon_patterns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TownConfig {
    #[serde(default = "default_mayor_session")]
    pub mayor_session: String,
    #[serde(default = "default_deacon_session")]
    pub deacon_session: String,
}

fn default_agent_names() -> Vec<String> {
    vec!["node".to_string(), "claude".to_string()]
}

fn default_version_pattern() -> String {
    r"^\d+\.\d+\.\d+".to_string()
}

fn default_session_prefix() -> String {
    crate::names::SESSION_PREFIX.to_string()
}

fn default_max_ancestry_depth() -> usize {
    8
}

fn default_runtime_pattern() -> String {
    r"(?i)(^claude$|/claude$|^claude-code$|/claude-code$|^codex$|/codex$)".to_string()
}

fn default_exclude_pattern() -> String {
    r"(?i)(Claude\.app|claude-native|chrome-native)".to_string()
}

fn default_sigterm_grace_millis() -> u64 {
    2000
}

fn default_settle_millis() -> u64 {
    100
}

fn default_descendant_rescan_attempts() -> u32 {
    3
}

fn default_descendant_rescan_delay_millis() -> u64 {
    50
}

fn default_daemon_patterns() -> Vec<String> {
    vec!["bd daemon".to_string(), "bd activity".to_string()]
}

fn default_mayor_session() -> String {
    "hq-mayor".to_string()
}

fn default_deacon_session() -> String {
    "hq-deacon".to_string()
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            names: Vec::new(),
            defaults: default_agent_names(),
            version_pattern: default_version_pattern(),
        }
    }
}

impl Default for OrphansConfig {
    fn default() -> Self {
        Self {
            session_prefix: default_session_prefix(),
            max_ancestry_depth: default_max_ancestry_depth(),
            runtime_pattern: default_runtime_pattern(),
            exclude_pattern: default_exclude_pattern(),
        }
    }
}

impl OrphansConfig {
    pub fn runtime_regex(&self) -> Result<Regex> {
        Regex::new(&self.runtime_pattern)
            .with_context(|| format!("invalid orphans.runtime_pattern '{}'", self.runtime_pattern))
    }

    /// `None` when the exclusion pattern is blank.
    pub fn exclude_regex(&self) -> Result<Option<Regex>> {
        if self.exclude_pattern.trim().is_empty() {
            return Ok(None);
        }
        Regex::new(&self.exclude_pattern)
            .map(Some)
            .with_context(|| format!("invalid orphans.exclude_pattern '{}'", self.exclude_pattern))
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sigterm_grace_millis: default_sigterm_grace_millis(),
            settle_millis: default_settle_millis(),
            descendant_rescan_attempts: default_descendant_rescan_attempts(),
            descendant_rescan_delay_millis: default_descendant_rescan_delay_millis(),
            daemon_patterns: default_daemon_patterns(),
        }
    }
}

impl CleanupConfig {
    pub fn sigterm_grace(&self) -> Duration {
        Duration::from_millis(self.sigterm_grace_millis)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_millis)
    }

    pub fn descendant_rescan_delay(&self) -> Duration {
        Duration::from_millis(self.descendant_rescan_delay_millis)
    }
}

impl Default for TownConfig {
    fn default() -> Self {
        Self {
            mayor_session: default_mayor_session(),
            deacon_session: default_deacon_session(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct WardenConfig {
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub orphans: OrphansConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub town: TownConfig,
}

impl WardenConfig {
    /// Search upward from `start` for a `.warden/config.toml` file and load it.
    /// Returns the default config if no file is found.
    pub fn load(start: &Path) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = Self::find_config_file(start) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let config: WardenConfig = toml::from_str(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            Ok((config, Some(path)))
        } else {
            Ok((WardenConfig::default(), None))
        }
    }

    fn find_config_file(start: &Path) -> Option<PathBuf> {
        let mut dir = start.to_path_buf();
        loop {
            let candidate = dir.join(CONFIG_DIR).join(CONFIG_FILENAME);
            if candidate.is_file() {
                return Some(candidate);
            }
            if !dir.pop() {
                return None;
            }
        }
    }
}
