//! Session-name grammar.
//!
//! ```text
//! hq-mayor, hq-deacon          town-level singletons
//! gt-<rig>-witness             rig singleton
//! gt-<rig>-refinery            rig singleton
//! gt-<rig>-crew-<name>         crew member (human-managed)
//! gt-<rig>-<name>              worker
//! ```
//!
//! The rig is the first segment after the prefix, so rig names cannot
//! contain `-`; worker and crew names can. The same grammar backs agent
//! addresses (`<rig>/crew/<name>`), so both directions live here.

use std::fmt;

/// Prefix of every rig-scoped session.
pub const SESSION_PREFIX: &str = "gt-";
/// Prefix of town-level singleton sessions.
pub const TOWN_PREFIX: &str = "hq-";

const CREW_SEGMENT: &str = "crew";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TownRole {
    Mayor,
    Deacon,
}

impl TownRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TownRole::Mayor => "mayor",
            TownRole::Deacon => "deacon",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "mayor" => Some(TownRole::Mayor),
            "deacon" => Some(TownRole::Deacon),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RigRole {
    Witness,
    Refinery,
}

impl RigRole {
    pub fn as_str(self) -> &'static str {
        match self {
            RigRole::Witness => "witness",
            RigRole::Refinery => "refinery",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "witness" => Some(RigRole::Witness),
            "refinery" => Some(RigRole::Refinery),
            _ => None,
        }
    }
}

/// A decoded session name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SessionName {
    Town(TownRole),
    RigSingleton { rig: String, role: RigRole },
    Crew { rig: String, name: String },
    Worker { rig: String, name: String },
}

impl SessionName {
    /// Decode a tmux session name. Returns `None` for anything outside the
    /// grammar, including bare `gt-<rig>`.
    pub fn parse(session: &str) -> Option<Self> {
        if let Some(rest) = session.strip_prefix(TOWN_PREFIX) {
            return TownRole::parse(rest).map(SessionName::Town);
        }

        let rest = session.strip_prefix(SESSION_PREFIX)?;
        if let Some(role) = TownRole::parse(rest) {
            return Some(SessionName::Town(role));
        }

        let (rig, tail) = rest.split_once('-')?;
        if rig.is_empty() || tail.is_empty() {
            return None;
        }
        let rig = rig.to_string();

        if let Some(role) = RigRole::parse(tail) {
            return Some(SessionName::RigSingleton { rig, role });
        }
        if let Some(name) = tail
            .strip_prefix(CREW_SEGMENT)
            .and_then(|t| t.strip_prefix('-'))
            .filter(|n| !n.is_empty())
        {
            return Some(SessionName::Crew {
                rig,
                name: name.to_string(),
            });
        }
        Some(SessionName::Worker {
            rig,
            name: tail.to_string(),
        })
    }

    /// The rig this session belongs to; `None` for town singletons.
    pub fn rig(&self) -> Option<&str> {
        match self {
            SessionName::Town(_) => None,
            SessionName::RigSingleton { rig, .. }
            | SessionName::Crew { rig, .. }
            | SessionName::Worker { rig, .. } => Some(rig),
        }
    }

    pub fn is_crew(&self) -> bool {
        matches!(self, SessionName::Crew { .. })
    }

    /// Mail-style address: `mayor/`, `acme/witness`, `acme/crew/joe`,
    /// `acme/joe`.
    pub fn to_address(&self) -> String {
        match self {
            SessionName::Town(role) => format!("{}/", role.as_str()),
            SessionName::RigSingleton { rig, role } => format!("{rig}/{}", role.as_str()),
            SessionName::Crew { rig, name } => format!("{rig}/{CREW_SEGMENT}/{name}"),
            SessionName::Worker { rig, name } => format!("{rig}/{name}"),
        }
    }

    /// Inverse of [`SessionName::to_address`].
    pub fn from_address(address: &str) -> Option<Self> {
        let trimmed = address.trim_end_matches('/');
        if let Some(role) = TownRole::parse(trimmed) {
            return Some(SessionName::Town(role));
        }

        let mut parts = trimmed.splitn(3, '/');
        let rig = parts.next().filter(|r| !r.is_empty() && !r.contains('-'))?;
        let second = parts.next().filter(|s| !s.is_empty())?;
        let rig = rig.to_string();

        match (second, parts.next()) {
            (CREW_SEGMENT, Some(name)) if !name.is_empty() => Some(SessionName::Crew {
                rig,
                name: name.to_string(),
            }),
            (_, Some(_)) => None,
            (role, None) => Some(match RigRole::parse(role) {
                Some(role) => SessionName::RigSingleton { rig, role },
                None => SessionName::Worker {
                    rig,
                    name: role.to_string(),
                },
            }),
        }
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionName::Town(role) => write!(f, "{TOWN_PREFIX}{}", role.as_str()),
            SessionName::RigSingleton { rig, role } => {
                write!(f, "{SESSION_PREFIX}{rig}-{}", role.as_str())
            }
            SessionName::Crew { rig, name } => {
                write!(f, "{SESSION_PREFIX}{rig}-{CREW_SEGMENT}-{name}")
            }
            SessionName::Worker { rig, name } => write!(f, "{SESSION_PREFIX}{rig}-{name}"),
        }
    }
}

/// Crew sessions (`gt-<rig>-crew-<name>`) are human-managed and are never
/// terminated automatically.
pub fn is_crew_session(session: &str) -> bool {
    is_crew_session_with_prefix(session, SESSION_PREFIX)
}

/// [`is_crew_session`] for towns that use a different session prefix.
pub fn is_crew_session_with_prefix(session: &str, prefix: &str) -> bool {
    split_rig(session, prefix).is_some_and(|(_, tail)| {
        tail.strip_prefix(CREW_SEGMENT)
            .and_then(|t| t.strip_prefix('-'))
            .is_some_and(|name| !name.is_empty())
    })
}

/// Split `<prefix><rig>-<tail>` into rig and tail. The rig must be
/// non-empty; the tail may be empty.
pub fn split_rig<'a>(session: &'a str, prefix: &str) -> Option<(&'a str, &'a str)> {
    session
        .strip_prefix(prefix)
        .and_then(|rest| rest.split_once('-'))
        .filter(|(rig, _)| !rig.is_empty())
}

/// Rig segment of a rig-scoped session name.
pub fn rig_of(session: &str) -> Option<String> {
    SessionName::parse(session).and_then(|n| n.rig().map(str::to_string))
}
