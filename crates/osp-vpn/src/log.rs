//! Tunnel Log Classification
//!
//! Pure functions over one line of tunnel-client output. Nothing here
//! touches I/O, so captured logs can be replayed line by line in tests.
//!
//! # Recognized markers
//!
//! | Marker | Meaning |
//! |--------|---------|
//! | `Initialization Sequence Completed` | tunnel is up |
//! | `ifconfig <a.b.c.d>` in a pushed option list | assigned tunnel address |
//! | `ERROR`, `WARNING`, `TLS:`, `VERIFY `, ... | worth showing to the user |

use std::fmt;
use std::net::Ipv4Addr;
use std::time::SystemTime;

/// Line printed by the tunnel client once routes and adapter are configured
pub const CONNECTED_MARKER: &str = "Initialization Sequence Completed";

/// Token that precedes the assigned address in a configuration push
const IFCONFIG_TOKEN: &str = "ifconfig";

/// Substrings that make a line worth forwarding to the event sink
const DISPLAY_MARKERS: &[&str] = &[
    "ERROR",
    "WARNING",
    "Initialization",
    "Peer Connection",
    "PUSH_REPLY",
    "TLS:",
    "VERIFY ",
];

/// Severity of a user-visible event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    Info,
    Success,
    Error,
}

impl LogLevel {
    /// Short tag used by plain-text sinks
    pub fn tag(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Success => "OK",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A user-visible event, timestamped when it is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    pub level: LogLevel,
    pub text: String,
    pub at: SystemTime,
}

impl LogEvent {
    pub fn new(level: LogLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
            at: SystemTime::now(),
        }
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(LogLevel::Info, text)
    }

    pub fn success(text: impl Into<String>) -> Self {
        Self::new(LogLevel::Success, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(LogLevel::Error, text)
    }
}

/// Everything the supervisor needs to know about one output line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineReport {
    /// Line carries the connection-completed marker
    pub connected: bool,
    /// Address pushed by the far end, if the line announces one
    pub address: Option<Ipv4Addr>,
    /// Display severity; `None` means the line is suppressed from the sink
    pub display: Option<LogLevel>,
}

/// Classify one line of tunnel output
pub fn classify(line: &str) -> LineReport {
    LineReport {
        connected: is_connected_marker(line),
        address: extract_assigned_address(line),
        display: display_level(line),
    }
}

/// Check for the connection-completed marker
pub fn is_connected_marker(line: &str) -> bool {
    line.contains(CONNECTED_MARKER)
}

/// Extract the IPv4 literal that follows an `ifconfig` token
///
/// The token must be followed by at least one comma or whitespace
/// character, then four dot-separated decimal groups. The first
/// occurrence that yields a valid address wins.
pub fn extract_assigned_address(line: &str) -> Option<Ipv4Addr> {
    line.match_indices(IFCONFIG_TOKEN)
        .find_map(|(idx, _)| address_after(&line[idx + IFCONFIG_TOKEN.len()..]))
}

fn address_after(rest: &str) -> Option<Ipv4Addr> {
    let trimmed = rest.trim_start_matches(|c: char| c == ',' || c.is_whitespace());
    if trimmed.len() == rest.len() {
        return None;
    }

    let run_len = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let groups: Vec<&str> = trimmed[..run_len].split('.').take(4).collect();
    if groups.len() != 4 || groups.iter().any(|g| g.is_empty()) {
        return None;
    }

    groups.join(".").parse().ok()
}

/// Decide whether a line is shown to the user, and at what severity
pub fn display_level(line: &str) -> Option<LogLevel> {
    if !DISPLAY_MARKERS.iter().any(|m| line.contains(m)) {
        return None;
    }

    if line.contains("ERROR") {
        Some(LogLevel::Error)
    } else if is_connected_marker(line) {
        Some(LogLevel::Success)
    } else {
        Some(LogLevel::Info)
    }
}
