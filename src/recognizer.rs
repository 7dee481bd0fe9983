//! Turns raw game-server console lines into lifecycle events.
//!
//! Recognizers are evaluated in a fixed order against every line, after the
//! optional `[timestamp]` prefix is removed. A single line can produce more
//! than one event (a connect line is also an activity line).

use regex::{Captures, Regex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Hostname,
    RconPassword,
    JoinPassword,
    ConnectPassword,
}

impl Credential {
    fn from_cvar(cvar: &str) -> Option<Self> {
        match cvar {
            "sv_hostname" => Some(Credential::Hostname),
            "sv_rconpassword" => Some(Credential::RconPassword),
            "sv_joinpassword" => Some(Credential::JoinPassword),
            "sv_password" => Some(Credential::ConnectPassword),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Credential::Hostname => "Hostname",
            Credential::RconPassword => "RCON Password",
            Credential::JoinPassword => "Join Password",
            Credential::ConnectPassword => "Connect Password",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    /// The engine moved to another port.
    AlternatePort(u16),
    /// Bind of the requested port failed and the engine retried on `port`.
    BindRetry { port: u16 },
    BoundAddress(String),
    /// Startup finished; the server is accepting players.
    Initialized,
    PlayerSeen {
        name: String,
        ip: String,
        check_reputation: bool,
    },
    CredentialChanged { credential: Credential, value: String },
    Activity,
}

type Handler = fn(&Captures<'_>) -> Option<LogEvent>;

struct Recognizer {
    name: &'static str,
    pattern: Regex,
    handler: Handler,
}

/// Ordered set of (pattern, handler) pairs.
pub struct LineRecognizer {
    recognizers: Vec<Recognizer>,
}

const IPV4: &str = r"\d{1,3}(?:\.\d{1,3}){3}";

fn alternate_port(caps: &Captures<'_>) -> Option<LogEvent> {
    caps[1].parse().ok().map(LogEvent::AlternatePort)
}

fn bind_retry(caps: &Captures<'_>) -> Option<LogEvent> {
    caps[2].parse().ok().map(|port| LogEvent::BindRetry { port })
}

fn bound_address(caps: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::BoundAddress(caps[1].trim().to_string()))
}

fn initialized(_: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::Initialized)
}

fn player_connected(caps: &Captures<'_>) -> Option<LogEvent> {
    // Chat lines can be forged to look like connects.
    if caps[0].starts_with("CHAT ") {
        return None;
    }
    Some(LogEvent::PlayerSeen {
        name: caps[1].to_string(),
        ip: caps[2].to_string(),
        check_reputation: true,
    })
}

fn player_listed(caps: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::PlayerSeen {
        name: caps[1].to_string(),
        ip: caps[2].to_string(),
        check_reputation: false,
    })
}

fn credential_changed(caps: &Captures<'_>) -> Option<LogEvent> {
    let credential = Credential::from_cvar(&caps[1])?;
    let value = caps[2].trim();
    let value = value.strip_prefix('"').unwrap_or(value);
    let value = value.strip_suffix('"').unwrap_or(value);
    Some(LogEvent::CredentialChanged {
        credential,
        value: value.to_string(),
    })
}

fn activity(_: &Captures<'_>) -> Option<LogEvent> {
    Some(LogEvent::Activity)
}

impl LineRecognizer {
    pub fn new() -> Result<Self, regex::Error> {
        let table: [(&'static str, String, Handler); 8] = [
            (
                "alternate_port",
                r"^(?:Server )?using alternate port (\d{1,5})\.?\s*$".to_string(),
                alternate_port,
            ),
            (
                "bind_retry",
                r"^NETWORK_Construct: Couldn't bind to (\S+)\. Binding to (\d{1,5}) instead\.\.\.$"
                    .to_string(),
                bind_retry,
            ),
            ("bound_address", r"^Bound to IP: (.+)$".to_string(), bound_address),
            (
                "initialized",
                r"(?i)^(?:UDP Initialized\.|=+ Odamex Server Initialized =+)$".to_string(),
                initialized,
            ),
            (
                "player_connected",
                format!(r"^(.*?) \(({IPV4}):\d{{1,5}}\) has connected\.$"),
                player_connected,
            ),
            (
                "player_listed",
                format!(r"^\d{{1,2}}\. (.*?) - IP ({IPV4}):\d{{1,5}}"),
                player_listed,
            ),
            (
                "credential_changed",
                r"^-> (sv_hostname|sv_rconpassword|sv_joinpassword|sv_password)\s+(.*?)\s*(?:\(RCON|$)"
                    .to_string(),
                credential_changed,
            ),
            (
                "activity",
                r"(?:joined the game|has connected|disconnected)\.$".to_string(),
                activity,
            ),
        ];

        let mut recognizers = Vec::with_capacity(table.len());
        for (name, pattern, handler) in table {
            recognizers.push(Recognizer {
                name,
                pattern: Regex::new(&pattern)?,
                handler,
            });
        }
        Ok(Self { recognizers })
    }

    /// Events for one raw line, in recognizer order.
    pub fn recognize(&self, raw: &str) -> Vec<LogEvent> {
        let line = strip_timestamp(raw);
        let mut events = Vec::new();
        for r in &self.recognizers {
            if let Some(caps) = r.pattern.captures(line)
                && let Some(event) = (r.handler)(&caps)
            {
                tracing::trace!(recognizer = r.name, ?event, "matched");
                events.push(event);
            }
        }
        events
    }
}

/// Drop a leading `[...]` timestamp and surrounding whitespace.
pub fn strip_timestamp(line: &str) -> &str {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.starts_with('[')
        && let Some(end) = line.find(']')
    {
        return line[end + 1..].trim();
    }
    line.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognize(line: &str) -> Vec<LogEvent> {
        LineRecognizer::new().unwrap().recognize(line)
    }

    #[test]
    fn test_strip_timestamp() {
        assert_eq!(strip_timestamp("[12:00:01] UDP Initialized."), "UDP Initialized.");
        assert_eq!(strip_timestamp("  UDP Initialized.\r\n"), "UDP Initialized.");
        assert_eq!(strip_timestamp("no ] bracket prefix"), "no ] bracket prefix");
        assert_eq!(strip_timestamp("[unterminated"), "[unterminated");
    }

    #[test]
    fn test_alternate_port_variants() {
        assert_eq!(
            recognize("Server using alternate port 10667."),
            vec![LogEvent::AlternatePort(10667)]
        );
        assert_eq!(
            recognize("[01:02:03] using alternate port 10700."),
            vec![LogEvent::AlternatePort(10700)]
        );
    }

    #[test]
    fn test_bind_retry() {
        assert_eq!(
            recognize("NETWORK_Construct: Couldn't bind to 10666. Binding to 10667 instead..."),
            vec![LogEvent::BindRetry { port: 10667 }]
        );
    }

    #[test]
    fn test_bound_address() {
        assert_eq!(
            recognize("Bound to IP: 203.0.113.7:10666"),
            vec![LogEvent::BoundAddress("203.0.113.7:10666".to_string())]
        );
    }

    #[test]
    fn test_startup_sentinels() {
        assert_eq!(recognize("UDP Initialized."), vec![LogEvent::Initialized]);
        assert_eq!(
            recognize("========== Odamex Server Initialized =========="),
            vec![LogEvent::Initialized]
        );
        assert_eq!(recognize("udp initialized."), vec![LogEvent::Initialized]);
        assert!(recognize("UDP Initialized. twice").is_empty());
    }

    #[test]
    fn test_player_connect_also_counts_as_activity() {
        assert_eq!(
            recognize("Player One (198.51.100.4:10666) has connected."),
            vec![
                LogEvent::PlayerSeen {
                    name: "Player One".to_string(),
                    ip: "198.51.100.4".to_string(),
                    check_reputation: true,
                },
                LogEvent::Activity,
            ]
        );
    }

    #[test]
    fn test_chat_forged_connect_is_ignored() {
        let events = recognize("CHAT bob: x (198.51.100.4:10666) has connected.");
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, LogEvent::PlayerSeen { .. })),
            "got {events:?}"
        );
    }

    #[test]
    fn test_player_list_line_skips_reputation() {
        assert_eq!(
            recognize("3. someone - IP 192.0.2.10:10666"),
            vec![LogEvent::PlayerSeen {
                name: "someone".to_string(),
                ip: "192.0.2.10".to_string(),
                check_reputation: false,
            }]
        );
    }

    #[test]
    fn test_hostname_change_strips_quotes_and_rcon_suffix() {
        assert_eq!(
            recognize(r#"-> sv_hostname "Friday Night DM" (RCON by alice)"#),
            vec![LogEvent::CredentialChanged {
                credential: Credential::Hostname,
                value: "Friday Night DM".to_string(),
            }]
        );
    }

    #[test]
    fn test_password_changes() {
        assert_eq!(
            recognize("-> sv_rconpassword secret123 (RCON by alice)"),
            vec![LogEvent::CredentialChanged {
                credential: Credential::RconPassword,
                value: "secret123".to_string(),
            }]
        );
        assert_eq!(
            recognize("-> sv_joinpassword letmein"),
            vec![LogEvent::CredentialChanged {
                credential: Credential::JoinPassword,
                value: "letmein".to_string(),
            }]
        );
        assert_eq!(
            recognize("-> sv_password abc (RCON by bob)"),
            vec![LogEvent::CredentialChanged {
                credential: Credential::ConnectPassword,
                value: "abc".to_string(),
            }]
        );
    }

    #[test]
    fn test_activity_lines() {
        assert_eq!(recognize("bob joined the game."), vec![LogEvent::Activity]);
        assert_eq!(
            recognize("client 3 disconnected."),
            vec![LogEvent::Activity]
        );
    }

    #[test]
    fn test_unrelated_line_produces_nothing() {
        assert!(recognize("Loading map MAP01").is_empty());
        assert!(recognize("").is_empty());
    }
}
