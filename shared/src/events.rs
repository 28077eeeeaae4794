//! Domain events extracted from the engine log.
//!
//! An event is a kind from a fixed vocabulary plus a flat map of named
//! string fields. Events only live for the duration of one dispatch.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventKind {
    Chat,
    TeamChat,
    ChatCommand,
    Kill,
    Connect,
    Disconnect,
    Begin,
    RoundEnd,
    UserinfoChanged,
    AdminCommand,
    AdminSay,
    AdminLogin,
}

impl EventKind {
    pub const ALL: [EventKind; 12] = [
        EventKind::Chat,
        EventKind::TeamChat,
        EventKind::ChatCommand,
        EventKind::Kill,
        EventKind::Connect,
        EventKind::Disconnect,
        EventKind::Begin,
        EventKind::RoundEnd,
        EventKind::UserinfoChanged,
        EventKind::AdminCommand,
        EventKind::AdminSay,
        EventKind::AdminLogin,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Chat => "chat",
            EventKind::TeamChat => "team-chat",
            EventKind::ChatCommand => "chat-command",
            EventKind::Kill => "kill",
            EventKind::Connect => "connect",
            EventKind::Disconnect => "disconnect",
            EventKind::Begin => "begin",
            EventKind::RoundEnd => "round-end",
            EventKind::UserinfoChanged => "userinfo-changed",
            EventKind::AdminCommand => "admin-command",
            EventKind::AdminSay => "admin-say",
            EventKind::AdminLogin => "admin-login",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown event name: {}", s))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainEvent {
    pub kind: EventKind,
    pub fields: BTreeMap<String, String>,
}

impl DomainEvent {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            fields: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Returns the field or an empty string when absent.
    pub fn field(&self, key: &str) -> &str {
        self.get(key).unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>(), Ok(kind));
        }
        assert!("new_round".parse::<EventKind>().is_err());
    }

    #[test]
    fn test_event_fields() {
        let event = DomainEvent::new(EventKind::Chat)
            .with("name", "Padawan")
            .with("message", "hello");

        assert_eq!(event.get("name"), Some("Padawan"));
        assert_eq!(event.field("player_id"), "");
        assert_eq!(event.kind.to_string(), "chat");
    }
}
