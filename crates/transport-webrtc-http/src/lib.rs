//! HTTP request/response exchange over a WebRTC data channel.
//!
//! A [`server::Server`] creates the offer and answers requests; a
//! [`client::ClientTransport`] answers the offer and sends requests. How the
//! SDP blobs travel between them is up to a [`signal`] implementation.

pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod flow;
pub mod framing;
pub mod net;
pub mod peer;
pub mod sdp;
pub mod server;
pub mod signal;

pub use client::{ClientTransport, OutgoingBody, ResponseBody};
pub use config::{IceConfiguration, IceServer, WebRtcConfig};
pub use error::{PeerConnectionError, TransportError};
pub use sdp::{Answer, Offer, SessionDescription};
pub use server::{HttpHandler, RemoteAddr, RequestBody, ResponseWriter, Server};
pub use signal::{ClientSignaller, ClientSignallerConfig, ServerSignaller, ServerSignallerConfig};
