//! Messages exchanged between a server instance and the discovery broker.
//!
//! Every message is one JSON text frame on the broker's `/connect` WebSocket,
//! shaped `{"type": "<snake_case name>", "data": {...}}`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::IceConfiguration;
use crate::sdp::SessionDescription;

pub const API_VERSION: &str = "1.0.0";

/// Path of the broker's instance WebSocket.
pub const CONNECT_PATH: &str = "/connect";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum BrokerMessage {
    /// Sent first by the instance; echoed by the broker with its own version.
    Handshake {
        version: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ServerArrivalRequest {
        /// Requested public URL; empty lets the broker pick.
        #[serde(default)]
        url: String,
        /// Fail the arrival instead of falling back when `url` is unavailable.
        #[serde(default)]
        required: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        basic_auth: Option<BasicAuth>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        redirect: Option<String>,
        #[serde(default)]
        redirect_only: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_secs: Option<u64>,
    },
    ServerArrivalResponse {
        #[serde(default)]
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GetOfferRequest {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ice: Option<IceConfiguration>,
    },
    GetOfferResponse {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        offer: Option<SessionDescription>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    GotAnswerRequest {
        session_id: String,
        answer: SessionDescription,
    },
    GotAnswerResponse {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FinishedSessionRequest {
        session_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    FinishedSessionResponse {
        session_id: String,
    },
    Ping,
    UpdatePingRateRequest {
        period_ms: u64,
    },
}

impl BrokerMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Session the message belongs to, if any.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            BrokerMessage::GetOfferRequest { session_id, .. }
            | BrokerMessage::GetOfferResponse { session_id, .. }
            | BrokerMessage::GotAnswerRequest { session_id, .. }
            | BrokerMessage::GotAnswerResponse { session_id, .. }
            | BrokerMessage::FinishedSessionRequest { session_id, .. }
            | BrokerMessage::FinishedSessionResponse { session_id } => Some(session_id),
            _ => None,
        }
    }
}

/// Credentials a browser must present before the broker hands out a token.
///
/// Stores a hex SHA-256 of the username and a bcrypt hash of the password so
/// the broker never sees either in the clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicAuth {
    pub username_hash: String,
    pub password_hash: String,
}

impl BasicAuth {
    pub fn from_credentials(username: &str, password: &str) -> Result<Self, bcrypt::BcryptError> {
        Ok(Self {
            username_hash: hash_username(username),
            password_hash: bcrypt::hash(password, bcrypt::DEFAULT_COST)?,
        })
    }

    pub fn verify(&self, username: &str, password: &str) -> bool {
        if hash_username(username) != self.username_hash {
            return false;
        }
        bcrypt::verify(password, &self.password_hash).unwrap_or(false)
    }
}

fn hash_username(username: &str) -> String {
    hex::encode(Sha256::digest(username.as_bytes()))
}

/// Compares dotted numeric versions; missing or non-numeric parts count as 0.
pub fn version_at_least(version: &str, minimum: &str) -> bool {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (have, want) = (parse(version), parse(minimum));
    let len = have.len().max(want.len());
    for i in 0..len {
        let a = have.get(i).copied().unwrap_or(0);
        let b = want.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    true
}
