use crate::instance::{InstanceSecrets, InstanceSummary};
use crate::query::QueryReport;
use serde::{Deserialize, Serialize};

fn default_log_lines() -> usize {
    15
}

/// One request per connection, sent as a single JSON line. `requester` is
/// the account the daemon checks levels and ownership against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Host {
        owner: String,
        /// Raw `key=value` option string.
        options: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(default)]
        recovering: bool,
    },
    Kill {
        requester: String,
        port: u16,
    },
    KillMine {
        requester: String,
    },
    List {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },
    Send {
        requester: String,
        port: u16,
        command: String,
    },
    SendAll {
        requester: String,
        command: String,
    },
    Broadcast {
        requester: String,
        message: String,
    },
    KillAll {
        requester: String,
    },
    KillVersion {
        requester: String,
        version: String,
    },
    KillInactive {
        requester: String,
        days: u64,
    },
    Protect {
        requester: String,
        port: u16,
    },
    Info {
        requester: String,
        port: u16,
    },
    Log {
        requester: String,
        port: u16,
        #[serde(default = "default_log_lines")]
        lines: usize,
    },
    Query {
        port: u16,
    },
    Cleanup {
        requester: String,
    },
    Accepting {
        requester: String,
        enabled: bool,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Success {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        message: String,
    },
    Hosted {
        server: Box<InstanceSummary>,
    },
    ServerList {
        servers: Vec<InstanceSummary>,
    },
    ServerInfo {
        info: Box<InstanceSecrets>,
    },
    LogLines {
        port: u16,
        lines: Vec<String>,
    },
    QueryResult {
        report: Box<QueryReport>,
    },
}

impl Response {
    pub fn success(message: impl Into<String>) -> Self {
        Response::Success {
            message: Some(message.into()),
        }
    }

    pub fn error(message: impl std::fmt::Display) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("failed to serialize/deserialize JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(String),
}

fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = serde_json::to_vec(value)?;
    buf.push(b'\n');
    Ok(buf)
}

fn decode_line<T: serde::de::DeserializeOwned>(line: &str) -> Result<T, ProtocolError> {
    let trimmed = line.trim_end();
    if trimmed.is_empty() {
        return Err(ProtocolError::Malformed("empty line".to_string()));
    }
    Ok(serde_json::from_str(trimmed)?)
}

pub fn encode_request(req: &Request) -> Result<Vec<u8>, ProtocolError> {
    encode_line(req)
}

pub fn decode_request(line: &str) -> Result<Request, ProtocolError> {
    decode_line(line)
}

pub fn encode_response(resp: &Response) -> Result<Vec<u8>, ProtocolError> {
    encode_line(resp)
}

pub fn decode_response(line: &str) -> Result<Response, ProtocolError> {
    decode_line(line)
}
