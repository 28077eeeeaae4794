//! Classification of engine log lines into domain events.
//!
//! Every recognized shape has a marker and its own small parser. A line is
//! matched against the markers in order and the first one found decides the
//! shape; its parser then extracts fields. Each field is extracted on its
//! own, so a field that cannot be read degrades to a default value instead
//! of dropping the line.

use log::{debug, warn};
use regex::Regex;
use shared::{strip_colors, DomainEvent, EventKind};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Fragger value used for suicides and world kills
pub const SELF_FRAGGER: &str = "SELF";
pub const UNKNOWN: &str = "Unknown";

const GAME_CLASSES: [&str; 15] = [
    "None",
    "Storm Trooper",
    "Solder",
    "Commander",
    "Elite Solder",
    "Sith",
    "Jedi",
    "Bounty Hunter",
    "Hero",
    "Super Battle Droid",
    "Wookie",
    "Deka",
    "Clone",
    "Mando",
    "Arc Trooper",
];

static ADMIN_COMMAND: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"SMOD command \((.*?)\) executed by (.+?)\(adminID: (\d+)\) \(IP: (.+?)\)")
        .ok()
});

static ADMIN_SAY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"SMOD say: (.+?) \(adminID: (\d+)\) \(IP: (.+?)\) : (.+)")
        .ok()
});

static ADMIN_LOGIN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"Successful SMOD login by (.+?) \(adminID: (\d+)\) \(IP: (.+?)\)")
        .ok()
});

struct LineShape {
    marker: &'static str,
    parse: fn(&str) -> Option<DomainEvent>,
}

/// Marker order matters: `SMOD say:` also contains `say:`.
const SHAPES: [LineShape; 11] = [
    LineShape { marker: "SMOD command (", parse: parse_admin_command },
    LineShape { marker: "SMOD say:", parse: parse_admin_say },
    LineShape { marker: "Successful SMOD login by", parse: parse_admin_login },
    LineShape { marker: "sayteam:", parse: parse_team_chat },
    LineShape { marker: "say:", parse: parse_chat },
    LineShape { marker: "Kill:", parse: parse_kill },
    LineShape { marker: "ClientConnect:", parse: parse_connect },
    LineShape { marker: "ClientDisconnect:", parse: parse_disconnect },
    LineShape { marker: "ClientBegin:", parse: parse_begin },
    LineShape { marker: "ShutdownGame:", parse: parse_round_end },
    LineShape { marker: "ClientUserinfoChanged", parse: parse_userinfo },
];

/// Text following the first occurrence of `marker`
fn after<'a>(line: &'a str, marker: &str) -> Option<&'a str> {
    line.find(marker).map(|idx| &line[idx + marker.len()..])
}

fn unquote(text: &str) -> &str {
    let text = text.trim();
    let text = text.strip_prefix('"').unwrap_or(text);
    text.strip_suffix('"').unwrap_or(text)
}

/// Splits `Name: "message"` after a chat marker.
fn split_speaker(rest: &str) -> (String, String) {
    let split = rest.find(": \"").or_else(|| rest.find(": "));

    match split {
        Some(idx) => (
            rest[..idx].trim().to_string(),
            unquote(&rest[idx + 1..]).to_string(),
        ),
        None => {
            warn!("Chat line without speaker separator: {}", rest.trim());
            (UNKNOWN.to_string(), unquote(rest).to_string())
        }
    }
}

fn first_token(text: &str) -> Option<&str> {
    text.split_whitespace().next()
}

pub fn parse_chat(line: &str) -> Option<DomainEvent> {
    let (name, message) = split_speaker(after(line, "say:")?);

    // Our own svsay/svtell echoes
    if name.eq_ignore_ascii_case("server") {
        return None;
    }

    let kind = if message.starts_with('!') {
        EventKind::ChatCommand
    } else {
        EventKind::Chat
    };

    Some(DomainEvent::new(kind).with("name", name).with("message", message))
}

pub fn parse_team_chat(line: &str) -> Option<DomainEvent> {
    let (name, message) = split_speaker(after(line, "sayteam:")?);

    Some(
        DomainEvent::new(EventKind::TeamChat)
            .with("name", name)
            .with("message", message),
    )
}

pub fn parse_kill(line: &str) -> Option<DomainEvent> {
    let rest = after(line, "Kill:")?;
    // Numeric ids precede the description: `Kill: 2 3 7: A killed B by W`
    let body = rest.split_once(':').map(|(_, body)| body).unwrap_or(rest);

    let (players, weapon) = match body.rsplit_once(" by ") {
        Some((players, weapon)) => (players, weapon.trim().to_string()),
        None => {
            warn!("Kill line without weapon: {}", line.trim());
            (body, UNKNOWN.to_string())
        }
    };

    let (mut fragger, fragged) = match players.split_once(" killed ") {
        Some((fragger, fragged)) => (fragger.trim().to_string(), fragged.trim().to_string()),
        None => {
            warn!("Kill line without participants: {}", line.trim());
            (UNKNOWN.to_string(), UNKNOWN.to_string())
        }
    };

    if fragger == fragged || fragger.contains("<world>") {
        fragger = SELF_FRAGGER.to_string();
    }

    Some(
        DomainEvent::new(EventKind::Kill)
            .with("fragger", fragger)
            .with("fragged", fragged)
            .with("weapon", weapon),
    )
}

pub fn parse_connect(line: &str) -> Option<DomainEvent> {
    let rest = after(line, "ClientConnect:")?;

    let name = rest
        .find('(')
        .and_then(|start| {
            let tail = &rest[start + 1..];
            tail.find(')').map(|end| tail[..end].to_string())
        })
        .unwrap_or_else(|| {
            warn!("Connect line without player name: {}", line.trim());
            UNKNOWN.to_string()
        });

    let player_id = after(rest, "ID: ")
        .and_then(first_token)
        .or_else(|| first_token(rest))
        .unwrap_or_default()
        .to_string();

    let ip = after(rest, "IP: ")
        .map(|tail| tail.split(')').next().unwrap_or(tail))
        .map(|ip_port| ip_port.split(':').next().unwrap_or(ip_port).trim().to_string())
        .unwrap_or_else(|| {
            warn!("Connect line without ip: {}", line.trim());
            String::new()
        });

    Some(
        DomainEvent::new(EventKind::Connect)
            .with("player_id", player_id)
            .with("name", name)
            .with("ip", ip),
    )
}

fn parse_client_id(line: &str, marker: &str, kind: EventKind) -> Option<DomainEvent> {
    match after(line, marker).and_then(first_token) {
        Some(id) => Some(DomainEvent::new(kind).with("player_id", id)),
        None => {
            warn!("{} line without client id: {}", kind, line.trim());
            None
        }
    }
}

pub fn parse_disconnect(line: &str) -> Option<DomainEvent> {
    parse_client_id(line, "ClientDisconnect:", EventKind::Disconnect)
}

pub fn parse_begin(line: &str) -> Option<DomainEvent> {
    parse_client_id(line, "ClientBegin:", EventKind::Begin)
}

pub fn parse_round_end(line: &str) -> Option<DomainEvent> {
    Some(DomainEvent::new(EventKind::RoundEnd).with("data", line.trim()))
}

/// `ClientUserinfoChanged: <id> n\<name>\t\0\model\<model>\...`
pub fn parse_userinfo(line: &str) -> Option<DomainEvent> {
    let rest = after(line, "ClientUserinfoChanged")?;
    let rest = rest.strip_prefix(':').unwrap_or(rest).trim();

    let (player_id, info) = rest.split_once(' ').unwrap_or((rest, ""));
    let info_fields: Vec<&str> = info.split('\\').collect();

    let name = info_fields.get(1).copied().unwrap_or(UNKNOWN);
    let model = info_fields.get(5).copied().unwrap_or(UNKNOWN);

    let (class_id, class_name) = match info_fields.get(19).and_then(|v| v.parse::<usize>().ok()) {
        Some(id) => (id, GAME_CLASSES.get(id).copied().unwrap_or(UNKNOWN)),
        None => (0, UNKNOWN),
    };

    if info_fields.len() < 20 {
        warn!("Short userinfo string for client {}", player_id);
    }

    Some(
        DomainEvent::new(EventKind::UserinfoChanged)
            .with("player_id", player_id)
            .with("name", name)
            .with("model", model)
            .with("class_id", class_id.to_string())
            .with("class_name", class_name)
            .with("data", info),
    )
}

pub fn parse_admin_command(line: &str) -> Option<DomainEvent> {
    let Some(caps) = ADMIN_COMMAND.as_ref().and_then(|re| re.captures(line)) else {
        warn!("Unrecognized admin command line: {}", line.trim());
        return None;
    };

    Some(
        DomainEvent::new(EventKind::AdminCommand)
            .with("command", &caps[1])
            .with("admin", caps[2].trim())
            .with("admin_id", &caps[3])
            .with("ip", &caps[4]),
    )
}

pub fn parse_admin_say(line: &str) -> Option<DomainEvent> {
    let Some(caps) = ADMIN_SAY.as_ref().and_then(|re| re.captures(line)) else {
        warn!("Unrecognized admin say line: {}", line.trim());
        return None;
    };

    Some(
        DomainEvent::new(EventKind::AdminSay)
            .with("admin", caps[1].trim())
            .with("admin_id", &caps[2])
            .with("ip", &caps[3])
            .with("message", caps[4].trim()),
    )
}

pub fn parse_admin_login(line: &str) -> Option<DomainEvent> {
    let Some(caps) = ADMIN_LOGIN.as_ref().and_then(|re| re.captures(line)) else {
        warn!("Unrecognized admin login line: {}", line.trim());
        return None;
    };

    Some(
        DomainEvent::new(EventKind::AdminLogin)
            .with("admin", caps[1].trim())
            .with("admin_id", &caps[2])
            .with("ip", &caps[3]),
    )
}

/// Display name to client id, maintained from connection events.
#[derive(Debug, Default)]
pub struct Roster {
    ids: HashMap<String, String>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, player_id: &str) {
        self.remove_id(player_id);
        self.ids.insert(name.to_string(), player_id.to_string());
    }

    pub fn remove_id(&mut self, player_id: &str) {
        self.ids.retain(|_, id| id != player_id);
    }

    /// Exact match first, then ignoring color codes
    pub fn lookup(&self, name: &str) -> Option<&str> {
        if let Some(id) = self.ids.get(name) {
            return Some(id);
        }

        let plain = strip_colors(name);
        self.ids
            .iter()
            .find(|(known, _)| strip_colors(known) == plain)
            .map(|(_, id)| id.as_str())
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.ids.len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Stateful classifier owned by one log tailer.
#[derive(Debug, Default)]
pub struct EventExtractor {
    roster: Roster,
}

impl EventExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    fn roster(&self) -> &Roster {
        &self.roster
    }

    pub fn classify(&mut self, line: &str) -> Option<DomainEvent> {
        let shape = SHAPES.iter().find(|shape| line.contains(shape.marker))?;
        let mut event = (shape.parse)(line)?;
        let kind = event.kind;

        match kind {
            EventKind::Chat | EventKind::TeamChat | EventKind::ChatCommand => {
                let player_id = self.roster.lookup(event.field("name")).unwrap_or_default().to_string();
                event = event.with("player_id", player_id);
            }
            EventKind::Connect | EventKind::UserinfoChanged => {
                let name = event.field("name");
                let player_id = event.field("player_id");
                if !player_id.is_empty() && name != UNKNOWN {
                    self.roster.insert(name, player_id);
                }
            }
            EventKind::Disconnect => self.roster.remove_id(event.field("player_id")),
            _ => {}
        }

        debug!("{} {:?}", event.kind, event.fields);
        Some(event)
    }
}
