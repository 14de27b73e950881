use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::peer::LinkState;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("data channel closed")]
    ChannelClosed,
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("operation cancelled")]
    Cancelled,
    #[error("a peer connection is already active")]
    Busy,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    PeerConnection(#[from] PeerConnectionError),
    #[error(transparent)]
    Framing(#[from] FramingError),
    #[error(transparent)]
    Sdp(#[from] SdpError),
    #[error(transparent)]
    Signal(#[from] SignalError),
}

/// Which side of the negotiation produced a [`PeerConnectionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Local => f.write_str("local"),
            Origin::Remote => f.write_str("remote"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{origin} peer connection error: {kind}")]
pub struct PeerConnectionError {
    pub origin: Origin,
    pub kind: NegotiationError,
}

impl PeerConnectionError {
    pub fn local(kind: NegotiationError) -> Self {
        Self {
            origin: Origin::Local,
            kind,
        }
    }

    pub fn remote(kind: NegotiationError) -> Self {
        Self {
            origin: Origin::Remote,
            kind,
        }
    }

    pub fn is_local(&self) -> bool {
        self.origin == Origin::Local
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("failed to create offer: {0}")]
    CreateOffer(String),
    #[error("failed to set local description: {0}")]
    SetLocalDescription(String),
    #[error("failed to set remote description: {0}")]
    SetRemoteDescription(String),
    #[error("offer exchange failed: {0}")]
    Exchange(String),
    #[error("ICE checking did not complete within {0:?}")]
    CheckingTimeout(Duration),
    #[error("ICE connection {0}")]
    Ice(LinkState),
    #[error("peer connection {0}")]
    Connection(LinkState),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("binary frame received while reading a message head")]
    BinaryInHead,
    #[error("message head exceeds {0} bytes")]
    HeadTooLarge(usize),
    #[error("unexpected data after the end of a message head")]
    TrailingData,
    #[error("malformed start line {0:?}")]
    MalformedStartLine(String),
    #[error("malformed header line {0:?}")]
    MalformedHeader(String),
    #[error("invalid header name {0:?}")]
    InvalidHeaderName(String),
    #[error("invalid value for header {0}")]
    InvalidHeaderValue(String),
    #[error("unsupported protocol version {0:?}")]
    UnsupportedVersion(String),
    #[error("channel closed before the message head was complete")]
    Truncated,
}

#[derive(Debug, Error)]
pub enum SdpError {
    #[error("expected an {expected} description, got {found}")]
    WrongType {
        expected: &'static str,
        found: String,
    },
    #[error("session description is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid SDP: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signalling I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("broker request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker websocket failed: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed signalling message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("broker rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("broker handshake failed: {0}")]
    Handshake(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("signalling channel closed")]
    Closed,
}

pub(crate) fn to_setup_error<E: fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}
