//! Discovery and signalling broker.
//!
//! One server instance registers over the API listener's `/connect`
//! WebSocket and is given a public URL. Clients fetch an offer for that URL
//! from the HTTP listener and post their answer back; the broker relays both
//! to the instance one session at a time.

pub mod auth;
pub mod config;
pub mod connection;
pub mod error;
pub mod handlers;
pub mod state;
pub mod token;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use transport_webrtc_http::signal::protocol::CONNECT_PATH;
use transport_webrtc_http::IceConfiguration;

use crate::config::{Config, ConfigError};
use crate::state::{Broker, UrlAssignment};
use crate::token::SessionTokens;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
    pub tokens: Arc<SessionTokens>,
    pub config: Arc<Config>,
    pub ice: Arc<IceConfiguration>,
}

impl AppState {
    pub fn new(config: Config, ice: IceConfiguration) -> Result<Self, ConfigError> {
        let secret = config.resolve_jwt_secret()?;
        let urls = UrlAssignment {
            scheme: config.url_scheme.clone(),
            domain: config.url_domain.clone(),
            port: config.url_port.unwrap_or(config.http_port),
            path: config.url_path.clone(),
        };
        Ok(Self {
            broker: Arc::new(Broker::new(config.max_client_queue_size, urls)),
            tokens: Arc::new(SessionTokens::new(&secret)),
            config: Arc::new(config),
            ice: Arc::new(ice),
        })
    }
}

/// Public listener: every path goes through the discovery handler.
pub fn http_router(state: AppState) -> Router {
    Router::new()
        .fallback(handlers::handle_http)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Listener for the server instance.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route(CONNECT_PATH, get(connection::connect_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub struct RunningHarbor {
    pub http_addr: SocketAddr,
    pub api_addr: SocketAddr,
    pub state: AppState,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningHarbor {
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for mut task in self.tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        tracing::info!(target = "harbor", "harbor stopped");
    }
}

/// Binds both listeners and starts serving in the background.
pub async fn spawn(mut config: Config) -> anyhow::Result<RunningHarbor> {
    let http_listener = TcpListener::bind((config.bind_host.as_str(), config.http_port))
        .await
        .context("failed to bind http listener")?;
    let api_listener = TcpListener::bind((config.bind_host.as_str(), config.api_port))
        .await
        .context("failed to bind api listener")?;
    let http_addr = http_listener.local_addr()?;
    let api_addr = api_listener.local_addr()?;
    if config.url_port.is_none() {
        config.url_port = Some(http_addr.port());
    }

    let ice = config.load_ice()?;
    let state = AppState::new(config, ice)?;
    let cancel = CancellationToken::new();

    let worker = tokio::spawn(
        state
            .broker
            .clone()
            .run_worker(state.ice.as_ref().clone(), cancel.clone()),
    );
    let http = serve(http_listener, http_router(state.clone()), cancel.clone(), "http");
    let api = serve(api_listener, api_router(state.clone()), cancel.clone(), "api");

    tracing::info!(target = "harbor", %http_addr, %api_addr, "harbor listening");
    Ok(RunningHarbor {
        http_addr,
        api_addr,
        state,
        cancel,
        tasks: vec![worker, http, api],
    })
}

fn serve(listener: TcpListener, router: Router, cancel: CancellationToken, name: &'static str) -> JoinHandle<()> {
    tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(err) = axum::serve(listener, router).with_graceful_shutdown(shutdown).await {
            tracing::error!(target = "harbor", listener = name, error = %err, "listener failed");
        }
    })
}
