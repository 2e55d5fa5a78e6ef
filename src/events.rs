//! Audit feed: one JSON object per line in `<town>/.events.jsonl`.
//!
//! Remediation records what it is about to destroy before destroying it,
//! so a post-mortem can tell a cleanup kill from a crash.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

pub const EVENTS_FILE: &str = ".events.jsonl";
pub const SOURCE: &str = "warden";

/// Who gets to see an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Audit,
    Feed,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    SessionDeath,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedEvent {
    pub ts: DateTime<Utc>,
    pub source: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub payload: Map<String, Value>,
    pub visibility: Visibility,
}

impl FeedEvent {
    pub fn new(kind: EventKind, actor: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            ts: Utc::now(),
            source: SOURCE.to_string(),
            kind,
            actor: actor.into(),
            payload,
            visibility: Visibility::Feed,
        }
    }

    pub fn with_visibility(mut self, visibility: Visibility) -> Self {
        self.visibility = visibility;
        self
    }

    /// Record of a session about to be killed. The session is the actor.
    pub fn session_death(session: &str, agent: &str, reason: &str, caller: &str) -> Self {
        Self::new(
            EventKind::SessionDeath,
            session,
            session_death_payload(session, agent, reason, caller),
        )
    }
}

pub fn session_death_payload(
    session: &str,
    agent: &str,
    reason: &str,
    caller: &str,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("session".into(), Value::from(session));
    payload.insert("agent".into(), Value::from(agent));
    payload.insert("reason".into(), Value::from(reason));
    payload.insert("caller".into(), Value::from(caller));
    payload
}

/// Anything that can durably record one structured fact.
pub trait EventSink {
    fn log_fact(&self, event: &FeedEvent) -> Result<()>;
}

impl<T: EventSink + ?Sized> EventSink for &T {
    fn log_fact(&self, event: &FeedEvent) -> Result<()> {
        (**self).log_fact(event)
    }
}

impl<T: EventSink + ?Sized> EventSink for Box<T> {
    fn log_fact(&self, event: &FeedEvent) -> Result<()> {
        (**self).log_fact(event)
    }
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn log_fact(&self, _event: &FeedEvent) -> Result<()> {
        Ok(())
    }
}

/// Appends events to a JSON lines file.
pub struct JsonlFeed {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl JsonlFeed {
    /// Open `path` for appending, creating it and its parent directories.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create event directory: {}", parent.display())
            })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open event feed: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// The town-wide feed at `<town>/.events.jsonl`.
    pub fn for_town(town_root: &Path) -> Result<Self> {
        Self::open(&town_root.join(EVENTS_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlFeed {
    fn log_fact(&self, event: &FeedEvent) -> Result<()> {
        let json = serde_json::to_string(event).context("failed to serialize event")?;

        debug!(event = %json, "event feed");

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| anyhow!("event feed writer poisoned"))?;
        writeln!(writer, "{json}").context("failed to write event")?;
        writer.flush().context("failed to flush event feed")?;

        Ok(())
    }
}
