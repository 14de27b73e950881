//! How offers and answers travel between the two peers.
//!
//! The variant is picked once at startup from [`ServerSignallerConfig`] /
//! [`ClientSignallerConfig`]; everything downstream sees trait objects.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::IceConfiguration;
use crate::error::TransportError;
use crate::sdp::{Answer, Offer};

pub mod broker;
pub mod file;
pub mod protocol;

pub use broker::{
    negotiate_offer, post_answer, BrokerClientConfig, BrokerClientSignaller, BrokerServerConfig,
    BrokerServerSignaller, OfferEnvelope, AnswerEnvelope, CLIENT_USER_AGENT, SESSION_COOKIE,
    SESSION_TOKEN_HEADER,
};
pub use file::{FileClientSignaller, FileServerSignaller};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delivers a local offer to the remote peer and returns its answer.
#[async_trait]
pub trait AnswerOffer: Send + Sync {
    async fn answer_offer(&self, session_id: &str, offer: Offer) -> Result<Answer, TransportError>;
}

/// Server side: runs one session, from offer creation to the channel closing.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle_request(
        &self,
        cancel: CancellationToken,
        session_id: String,
        ice: Option<IceConfiguration>,
        exchange: Arc<dyn AnswerOffer>,
    ) -> Result<(), TransportError>;
}

/// Client side: turns a remote offer into a local answer.
#[async_trait]
pub trait OfferHandler: Send + Sync {
    async fn handle_offer(
        &self,
        session_id: &str,
        offer: Offer,
        ice: Option<IceConfiguration>,
    ) -> Result<Answer, TransportError>;
}

#[async_trait]
pub trait ServerSignaller: Send + Sync {
    /// Serves sessions until [`ServerSignaller::shutdown`] or a fatal error.
    async fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<(), TransportError>;

    fn shutdown(&self);
}

#[async_trait]
pub trait ClientSignaller: Send + Sync {
    /// Runs exactly one offer/answer exchange.
    async fn start(&self, handler: Arc<dyn OfferHandler>) -> Result<(), TransportError>;

    fn shutdown(&self);
}

#[derive(Debug, Clone)]
pub enum ServerSignallerConfig {
    File { dir: PathBuf },
    Broker(BrokerServerConfig),
}

impl ServerSignallerConfig {
    pub fn build(self) -> Box<dyn ServerSignaller> {
        match self {
            ServerSignallerConfig::File { dir } => Box::new(FileServerSignaller::new(dir)),
            ServerSignallerConfig::Broker(config) => Box::new(BrokerServerSignaller::new(config)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ClientSignallerConfig {
    File { session_dir: PathBuf },
    Broker(BrokerClientConfig),
}

impl ClientSignallerConfig {
    pub fn build(self) -> Box<dyn ClientSignaller> {
        match self {
            ClientSignallerConfig::File { session_dir } => {
                Box::new(FileClientSignaller::new(session_dir))
            }
            ClientSignallerConfig::Broker(config) => Box::new(BrokerClientSignaller::new(config)),
        }
    }
}
