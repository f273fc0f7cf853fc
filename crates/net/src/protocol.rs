//! Application payload types and the envelope codec
//!
//! Every payload travels inside an envelope: a one-byte type tag
//! followed by a JSON document. The JSON carries a `"type"` field that
//! selects the payload variant; identifier fields are declared as
//! [`Uuid`] and serialize as UUID strings, object keys included.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Envelope type tag for JSON payloads
pub const TAG_JSON: u8 = 1;

/// A chat participant as tracked by the server roster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub uid: Uuid,
    pub username: String,
    /// Normalized 6-hex-digit RGB, lowercase, no leading '#'
    pub color: String,
}

/// Application payloads exchanged between peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Payload {
    /// Chat text attributed to a user
    ChatMessage { uid: Uuid, text: String },

    /// Informational text with no sender identity
    SystemMessage { text: String },

    /// First message a client sends after the transport connects
    JoinRequest { username: String, color: String },

    /// Full roster snapshot; `uid` tags the recipient's own identity
    ServerInfo {
        users: HashMap<Uuid, User>,
        uid: Option<Uuid>,
    },
}

impl Payload {
    /// Serialize payload to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))
    }

    /// Deserialize payload from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| Error::Protocol(format!("Invalid JSON: {}", e)))
    }

    /// Serialize into an envelope: type tag followed by the JSON document
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = self.to_bytes()?;
        let mut buf = Vec::with_capacity(json.len() + 1);
        buf.push(TAG_JSON);
        buf.extend_from_slice(&json);
        Ok(buf)
    }

    /// Decode an envelope back into a payload
    pub fn decode(data: &[u8]) -> Result<Self> {
        match data.split_first() {
            Some((&TAG_JSON, json)) => Self::from_bytes(json),
            Some((tag, _)) => Err(Error::Protocol(format!("Unknown type tag: {}", tag))),
            None => Err(Error::Protocol("Empty envelope".into())),
        }
    }
}

/// Normalize a hex RGB color: strip a leading '#', lowercase, and
/// require exactly 6 hex digits.
pub fn normalize_color(color: &str) -> Result<String> {
    let hex = color.strip_prefix('#').unwrap_or(color);
    if hex.len() == 6 && hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        Ok(hex.to_ascii_lowercase())
    } else {
        Err(Error::InvalidColor(color.to_string()))
    }
}
