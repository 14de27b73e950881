//! Offer/answer values exchanged by the signallers.

use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;

use crate::error::SdpError;

/// Session-level SDP attribute carrying the data-channel bearer token.
pub const BEARER_TOKEN_ATTRIBUTE: &str = "x-bearer-token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpKind {
    fn as_str(self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Rollback => "rollback",
        }
    }
}

/// Wire shape `{"type": "offer", "sdp": "..."}`, identical to the browser's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

macro_rules! description_newtype {
    ($name:ident, $kind:expr, $label:literal, $ctor:path) => {
        #[derive(Debug, Clone, PartialEq, Eq)]
        pub struct $name(String);

        impl $name {
            pub fn new(sdp: impl Into<String>) -> Self {
                Self(sdp.into())
            }

            pub fn sdp(&self) -> &str {
                &self.0
            }

            pub fn into_sdp(self) -> String {
                self.0
            }

            pub fn description(&self) -> SessionDescription {
                SessionDescription {
                    kind: $kind,
                    sdp: self.0.clone(),
                }
            }

            pub fn from_description(description: SessionDescription) -> Result<Self, SdpError> {
                if description.kind != $kind {
                    return Err(SdpError::WrongType {
                        expected: $label,
                        found: description.kind.as_str().to_string(),
                    });
                }
                Ok(Self(description.sdp))
            }

            pub fn from_json(json: &str) -> Result<Self, SdpError> {
                Self::from_description(serde_json::from_str(json)?)
            }

            pub fn to_json(&self) -> Result<String, SdpError> {
                Ok(serde_json::to_string(&self.description())?)
            }

            /// Parses the SDP, failing on anything webrtc would reject.
            pub fn to_rtc(&self) -> Result<RTCSessionDescription, SdpError> {
                $ctor(self.0.clone()).map_err(|err| SdpError::Invalid(err.to_string()))
            }

            pub fn bearer_token(&self) -> Option<&str> {
                session_attribute(&self.0, BEARER_TOKEN_ATTRIBUTE)
            }

            pub fn candidate_addresses(&self) -> Vec<String> {
                candidate_addresses(&self.0)
            }
        }

        impl From<$name> for SessionDescription {
            fn from(value: $name) -> Self {
                SessionDescription {
                    kind: $kind,
                    sdp: value.0,
                }
            }
        }
    };
}

description_newtype!(Offer, SdpKind::Offer, "offer", RTCSessionDescription::offer);
description_newtype!(Answer, SdpKind::Answer, "answer", RTCSessionDescription::answer);

impl Offer {
    pub(crate) fn from_rtc(description: &RTCSessionDescription) -> Self {
        Self(description.sdp.clone())
    }

    /// Stamps the bearer token attribute at session level, replacing any previous one.
    pub fn with_bearer_token(self, token: &str) -> Self {
        let prefix = format!("a={BEARER_TOKEN_ATTRIBUTE}:");
        let mut out = String::with_capacity(self.0.len() + prefix.len() + token.len() + 2);
        let mut inserted = false;
        for line in self.0.split_inclusive('\n') {
            if line.starts_with(&prefix) {
                continue;
            }
            if !inserted && line.starts_with("m=") {
                out.push_str(&prefix);
                out.push_str(token);
                out.push_str("\r\n");
                inserted = true;
            }
            out.push_str(line);
        }
        if !inserted {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push_str("\r\n");
            }
            out.push_str(&prefix);
            out.push_str(token);
            out.push_str("\r\n");
        }
        Self(out)
    }
}

impl Answer {
    pub(crate) fn from_rtc(description: &RTCSessionDescription) -> Self {
        Self(description.sdp.clone())
    }
}

fn session_attribute<'a>(sdp: &'a str, name: &str) -> Option<&'a str> {
    sdp.lines()
        .map(|line| line.trim_end_matches('\r'))
        .take_while(|line| !line.starts_with("m="))
        .find_map(|line| {
            line.strip_prefix("a=")
                .and_then(|attr| attr.strip_prefix(name))
                .and_then(|rest| rest.strip_prefix(':'))
        })
        .filter(|value| !value.is_empty())
}

/// `host:port` of every `a=candidate` line, in SDP order.
fn candidate_addresses(sdp: &str) -> Vec<String> {
    sdp.lines()
        .filter_map(|line| line.trim_end_matches('\r').strip_prefix("a=candidate:"))
        .filter_map(|candidate| {
            // foundation component transport priority address port typ ...
            let mut fields = candidate.split_whitespace().skip(4);
            let address = fields.next()?;
            let port: u16 = fields.next()?.parse().ok()?;
            Some(match address.parse::<IpAddr>() {
                Ok(ip) => SocketAddr::new(ip, port).to_string(),
                Err(_) => format!("{address}:{port}"),
            })
        })
        .collect()
}
