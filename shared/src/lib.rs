use serde::{Deserialize, Serialize};

pub mod events;

pub use events::{DomainEvent, EventKind};

/// Out-of-band marker that prefixes every remote-administration datagram.
pub const OOB_MARKER: [u8; 4] = [0xFF, 0xFF, 0xFF, 0xFF];
pub const RCON_PREFIX: &str = "rcon ";
/// Color reset marker. The last one on a status row ends the player name.
pub const COLOR_RESET: &str = "^7";
pub const COLOR_RED: &str = "^1";
pub const STATUS_HEADER: &str = "cl score ping name";
pub const STATUS_COMMAND: &str = "status notrunc";

/// Mode names in engine id order (`g_authenticity` / `mbmode`).
pub const MODES: [&str; 5] = ["Open", "Semi-Authentic", "Full-Authentic", "Duel", "Legends"];

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Player {
    pub id: u32,
    pub name: String,
    pub name_raw: String,
    pub ip: String,
    pub score: i32,
    pub ping: u32,
    pub rate: u32,
}

/// Builds the datagram for a command. With a password the command is
/// wrapped as `rcon <password> <command>`, otherwise it is sent bare.
pub fn encode_command(password: Option<&str>, command: &str) -> Vec<u8> {
    let body = match password {
        Some(password) => format!("{}{} {}", RCON_PREFIX, password, command),
        None => command.to_string(),
    };

    let mut datagram = Vec::with_capacity(OOB_MARKER.len() + body.len());
    datagram.extend_from_slice(&OOB_MARKER);
    datagram.extend_from_slice(body.as_bytes());
    datagram
}

/// Removes `^<digit>` color markers.
pub fn strip_colors(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '^' {
            if let Some(next) = chars.peek() {
                if next.is_ascii_digit() {
                    chars.next();
                    continue;
                }
            }
        }
        out.push(c);
    }

    out
}

/// Parses the player table of a `status notrunc` response.
///
/// Rows start two lines below the last header line (header + divider).
/// The name may contain spaces and color codes, so each row is split at the
/// last color reset marker: everything before it is `cl score ping name`,
/// everything after is `ip:port rate`. Rows that do not fit are skipped.
pub fn parse_status(response: &str) -> Vec<Player> {
    let lines: Vec<&str> = response.lines().collect();

    let start = lines
        .iter()
        .rposition(|line| line.trim().starts_with(STATUS_HEADER))
        .map(|idx| idx + 2)
        .unwrap_or(lines.len());

    lines
        .iter()
        .skip(start)
        .filter(|line| {
            let trimmed = line.trim();
            trimmed.len() >= 5 && !trimmed.starts_with("print")
        })
        .filter_map(|line| parse_status_row(line))
        .collect()
}

fn parse_status_row(line: &str) -> Option<Player> {
    let split_at = line.rfind(COLOR_RESET)? + COLOR_RESET.len();
    let (head, tail) = line.split_at(split_at);

    let mut parts = head.split_whitespace();
    let id = parts.next()?.parse::<u32>().ok()?;
    let score = parts.next()?.parse::<i32>().ok()?;
    let ping = parts.next()?.parse::<u32>().ok()?;
    let name_raw = parts.collect::<Vec<_>>().join(" ");
    if name_raw.is_empty() {
        return None;
    }

    let mut tail = tail.split_whitespace();
    let address = tail.next()?;
    let rate = tail.next()?.parse::<u32>().ok()?;
    let ip = address.split(':').next().unwrap_or(address).to_string();

    Some(Player {
        id,
        name: strip_colors(&name_raw),
        name_raw,
        ip,
        score,
        ping,
        rate,
    })
}

/// Extracts a cvar value from a query response.
///
/// Two shapes are known: `"name" is:"value^7" default:"..."` (contains the
/// word cvar in some builds) where the value is the first quoted token, and
/// the older form where the value is the second quoted segment.
pub fn parse_cvar_response(response: &str) -> Option<String> {
    let quoted: Vec<&str> = response.split('"').skip(1).step_by(2).collect();

    let value = if response.to_lowercase().contains("cvar") {
        quoted.first()
    } else {
        quoted.get(1)
    }?;

    Some(strip_colors(value))
}

/// Maps a mode id (as reported by `g_authenticity`) to its display name.
pub fn mode_name(id: &str) -> Option<&'static str> {
    id.trim()
        .parse::<usize>()
        .ok()
        .and_then(|idx| MODES.get(idx).copied())
}

/// Maps a mode display name back to its numeric id, case-insensitively.
pub fn mode_id(name: &str) -> Option<usize> {
    MODES
        .iter()
        .position(|mode| mode.eq_ignore_ascii_case(name.trim()))
}
