//! Signalling through the `beach-harbor` discovery broker.
//!
//! The serving side keeps a WebSocket open to the broker's API listener and
//! answers offer requests on it. The requesting side talks plain HTTP to the
//! broker's public listener: fetch an offer, post the answer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::protocol::{version_at_least, BasicAuth, BrokerMessage, API_VERSION};
use super::{AnswerOffer, ClientSignaller, OfferHandler, RequestHandler, ServerSignaller};
use crate::config::IceConfiguration;
use crate::error::{SignalError, TransportError};
use crate::sdp::{Answer, Offer, SessionDescription};

/// User agent that makes the broker answer its HTML endpoint with a bare 200.
pub const CLIENT_USER_AGENT: &str = "beach-http";
pub const SESSION_TOKEN_HEADER: &str = "x-session-token";
pub const SESSION_COOKIE: &str = "session_token";

pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_ARRIVAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_millis(250);
const MIN_BROKER_VERSION: &str = "1.0.0";

/// What the instance asks for when it registers with the broker.
#[derive(Debug, Clone, Default)]
pub struct Arrival {
    /// Requested public URL; empty lets the broker pick.
    pub url: String,
    pub required: bool,
    pub basic_auth: Option<BasicAuth>,
    pub redirect: Option<String>,
    pub redirect_only: bool,
    pub ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct BrokerServerConfig {
    /// WebSocket URL of the broker's `/connect` endpoint.
    pub api_url: Url,
    pub key: Option<String>,
    pub arrival: Arrival,
    pub ping_period: Duration,
    pub handshake_timeout: Duration,
}

impl BrokerServerConfig {
    pub fn new(api_url: Url) -> Self {
        Self {
            api_url,
            key: None,
            arrival: Arrival::default(),
            ping_period: DEFAULT_PING_PERIOD,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

type SessionRoutes = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<SessionDescription>>>>;

pub struct BrokerServerSignaller {
    config: BrokerServerConfig,
    cancel: CancellationToken,
    assigned_url: watch::Sender<Option<String>>,
}

impl BrokerServerSignaller {
    pub fn new(config: BrokerServerConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            assigned_url: watch::Sender::new(None),
        }
    }

    /// Public URL the broker assigned, once the arrival succeeded.
    pub fn assigned_url(&self) -> watch::Receiver<Option<String>> {
        self.assigned_url.subscribe()
    }

    async fn handshake<S>(
        &self,
        outbound: &mpsc::UnboundedSender<BrokerMessage>,
        inbound: &mut S,
    ) -> Result<String, SignalError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        send(
            outbound,
            BrokerMessage::Handshake {
                version: API_VERSION.to_string(),
                key: self.config.key.clone(),
                error: None,
            },
        )?;
        let reply = timeout(self.config.handshake_timeout, next_message(inbound))
            .await
            .map_err(|_| SignalError::Handshake("broker did not answer the handshake".into()))??;
        match reply {
            Some(BrokerMessage::Handshake { error: Some(error), .. }) => Err(SignalError::Handshake(error)),
            Some(BrokerMessage::Handshake { version, .. }) => {
                if !version_at_least(&version, MIN_BROKER_VERSION) {
                    return Err(SignalError::Handshake(format!(
                        "broker version {version} is older than {MIN_BROKER_VERSION}"
                    )));
                }
                Ok(version)
            }
            Some(other) => Err(SignalError::Protocol(format!(
                "expected handshake, got {other:?}"
            ))),
            None => Err(SignalError::Closed),
        }
    }

    async fn arrive<S>(
        &self,
        outbound: &mpsc::UnboundedSender<BrokerMessage>,
        inbound: &mut S,
    ) -> Result<String, SignalError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let arrival = &self.config.arrival;
        send(
            outbound,
            BrokerMessage::ServerArrivalRequest {
                url: arrival.url.clone(),
                required: arrival.required,
                basic_auth: arrival.basic_auth.clone(),
                redirect: arrival.redirect.clone(),
                redirect_only: arrival.redirect_only,
                ttl_secs: arrival.ttl.map(|ttl| ttl.as_secs()),
            },
        )?;
        timeout(DEFAULT_ARRIVAL_TIMEOUT, wait_for_arrival(inbound))
            .await
            .map_err(|_| SignalError::Handshake("broker did not answer the arrival".into()))?
    }
}

async fn wait_for_arrival<S>(inbound: &mut S) -> Result<String, SignalError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        match next_message(inbound).await? {
            Some(BrokerMessage::ServerArrivalResponse { error: Some(error), .. }) => {
                return Err(SignalError::Handshake(format!("arrival rejected: {error}")));
            }
            Some(BrokerMessage::ServerArrivalResponse { url, .. }) => return Ok(url),
            Some(other) => {
                tracing::debug!(target = "webrtc", ignored = ?other, "ignoring message before arrival");
            }
            None => return Err(SignalError::Closed),
        }
    }
}

#[async_trait]
impl ServerSignaller for BrokerServerSignaller {
    async fn start(&self, handler: Arc<dyn RequestHandler>) -> Result<(), TransportError> {
        let (ws_stream, _) = connect_async(self.config.api_url.as_str())
            .await
            .map_err(SignalError::from)?;
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<BrokerMessage>();
        let mut writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(err) => {
                        tracing::warn!(target = "webrtc", error = %err, "failed to encode broker message");
                        continue;
                    }
                };
                if ws_write.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let result = self.serve(handler, &outbound, &mut ws_read).await;
        self.assigned_url.send_replace(None);
        drop(outbound);
        // sessions still winding down keep the writer alive
        if timeout(DEFAULT_HANDSHAKE_TIMEOUT, &mut writer).await.is_err() {
            writer.abort();
        }
        result
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl BrokerServerSignaller {
    async fn serve<S>(
        &self,
        handler: Arc<dyn RequestHandler>,
        outbound: &mpsc::UnboundedSender<BrokerMessage>,
        inbound: &mut S,
    ) -> Result<(), TransportError>
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        let version = self.handshake(outbound, inbound).await?;
        let url = self.arrive(outbound, inbound).await?;
        tracing::info!(target = "webrtc", broker_version = %version, url = %url, "registered with broker");
        self.assigned_url.send_replace(Some(url));

        let (period_tx, period_rx) = watch::channel(self.config.ping_period);
        let pinger = tokio::spawn(ping_loop(outbound.clone(), period_rx, self.cancel.child_token()));
        let routes: SessionRoutes = Arc::new(Mutex::new(HashMap::new()));

        let result = loop {
            let message = tokio::select! {
                _ = self.cancel.cancelled() => break Ok(()),
                message = next_message(inbound) => message,
            };
            let message = match message {
                Ok(Some(message)) => message,
                Ok(None) => break Err(SignalError::Closed.into()),
                Err(err) => break Err(err.into()),
            };
            match message {
                BrokerMessage::GetOfferRequest { session_id, ice } => {
                    self.spawn_session(&handler, outbound, &routes, session_id, ice);
                }
                BrokerMessage::GotAnswerRequest { session_id, answer } => {
                    let route = routes.lock().get(&session_id).cloned();
                    match route {
                        Some(route) => {
                            let _ = route.send(answer);
                        }
                        None => {
                            tracing::warn!(target = "webrtc", session_id = %session_id, "answer for unknown session");
                            let _ = outbound.send(BrokerMessage::GotAnswerResponse {
                                session_id,
                                error: Some("unknown session".into()),
                            });
                        }
                    }
                }
                BrokerMessage::UpdatePingRateRequest { period_ms } => {
                    tracing::debug!(target = "webrtc", period_ms, "broker changed ping rate");
                    let _ = period_tx.send(Duration::from_millis(period_ms.max(1)));
                }
                BrokerMessage::FinishedSessionResponse { session_id } => {
                    tracing::debug!(target = "webrtc", session_id = %session_id, "broker released session");
                }
                other => {
                    tracing::debug!(target = "webrtc", ignored = ?other, "ignoring broker message");
                }
            }
        };
        pinger.abort();
        result
    }

    fn spawn_session(
        &self,
        handler: &Arc<dyn RequestHandler>,
        outbound: &mpsc::UnboundedSender<BrokerMessage>,
        routes: &SessionRoutes,
        session_id: String,
        ice: Option<IceConfiguration>,
    ) {
        let (route_tx, route_rx) = mpsc::unbounded_channel();
        routes.lock().insert(session_id.clone(), route_tx);
        let exchange = Arc::new(BrokerAnswerOffer {
            outbound: outbound.clone(),
            answers: tokio::sync::Mutex::new(route_rx),
            offered: AtomicBool::new(false),
            cancel: self.cancel.child_token(),
        });
        let handler = handler.clone();
        let outbound = outbound.clone();
        let routes = routes.clone();
        let cancel = self.cancel.child_token();
        tracing::info!(target = "webrtc", session_id = %session_id, "broker requested an offer");
        tokio::spawn(async move {
            let result = handler
                .handle_request(cancel, session_id.clone(), ice, exchange.clone())
                .await;
            routes.lock().remove(&session_id);
            let error = result.err().map(|err| {
                tracing::warn!(target = "webrtc", session_id = %session_id, error = %err, "session failed");
                err.to_string()
            });
            if !exchange.offered.load(Ordering::SeqCst) {
                let _ = outbound.send(BrokerMessage::GetOfferResponse {
                    session_id: session_id.clone(),
                    offer: None,
                    error: Some(error.clone().unwrap_or_else(|| "no offer was produced".into())),
                });
            }
            let _ = outbound.send(BrokerMessage::FinishedSessionRequest { session_id, error });
        });
    }
}

struct BrokerAnswerOffer {
    outbound: mpsc::UnboundedSender<BrokerMessage>,
    answers: tokio::sync::Mutex<mpsc::UnboundedReceiver<SessionDescription>>,
    offered: AtomicBool,
    cancel: CancellationToken,
}

#[async_trait]
impl AnswerOffer for BrokerAnswerOffer {
    async fn answer_offer(&self, session_id: &str, offer: Offer) -> Result<Answer, TransportError> {
        if self.offered.swap(true, Ordering::SeqCst) {
            return Err(SignalError::Protocol("offer already sent for this session".into()).into());
        }
        send(
            &self.outbound,
            BrokerMessage::GetOfferResponse {
                session_id: session_id.to_string(),
                offer: Some(offer.into()),
                error: None,
            },
        )?;

        let mut answers = self.answers.lock().await;
        let answer = tokio::select! {
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            answer = answers.recv() => answer.ok_or(SignalError::Closed)?,
        };
        let parsed = Answer::from_description(answer);
        send(
            &self.outbound,
            BrokerMessage::GotAnswerResponse {
                session_id: session_id.to_string(),
                error: parsed.as_ref().err().map(|err| err.to_string()),
            },
        )?;
        Ok(parsed?)
    }
}

async fn ping_loop(
    outbound: mpsc::UnboundedSender<BrokerMessage>,
    mut period: watch::Receiver<Duration>,
    cancel: CancellationToken,
) {
    loop {
        let current = (*period.borrow_and_update()).max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + current, current);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = period.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                _ = ticker.tick() => {
                    if outbound.send(BrokerMessage::Ping).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

fn send(outbound: &mpsc::UnboundedSender<BrokerMessage>, message: BrokerMessage) -> Result<(), SignalError> {
    outbound.send(message).map_err(|_| SignalError::Closed)
}

/// Next decoded broker message; `None` once the socket is closed.
async fn next_message<S>(inbound: &mut S) -> Result<Option<BrokerMessage>, SignalError>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = inbound.next().await {
        let text = match frame? {
            Message::Text(text) => text,
            Message::Binary(data) => String::from_utf8(data)
                .map_err(|err| SignalError::Protocol(format!("non utf-8 message: {err}")))?,
            Message::Close(_) => return Ok(None),
            _ => continue,
        };
        return Ok(Some(BrokerMessage::from_json(&text)?));
    }
    Ok(None)
}

/// JSON handed out by the broker's public endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferEnvelope {
    #[serde(rename = "RTCSessionDescription")]
    pub description: SessionDescription,
    #[serde(rename = "RTCConfiguration", default, skip_serializing_if = "Option::is_none")]
    pub ice: Option<IceConfiguration>,
    #[serde(rename = "SessionID")]
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerEnvelope {
    #[serde(rename = "Answer")]
    pub answer: SessionDescription,
    #[serde(rename = "SessionID")]
    pub session_id: String,
}

#[derive(Debug, Clone)]
pub struct BrokerClientConfig {
    /// Public URL the serving instance was assigned.
    pub url: Url,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl BrokerClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            username: None,
            password: None,
        }
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }
}

/// Fetches a session cookie from the HTML endpoint, then the offer JSON.
pub async fn negotiate_offer(
    client: &reqwest::Client,
    url: &Url,
    basic_auth: Option<(&str, &str)>,
) -> Result<OfferEnvelope, SignalError> {
    let mut request = client.get(url.clone()).header(USER_AGENT, CLIENT_USER_AGENT);
    if let Some((username, password)) = basic_auth {
        request = request.basic_auth(username, Some(password));
    }
    let response = check_status(request.send().await?).await?;
    let token = response
        .cookies()
        .find(|cookie| cookie.name() == SESSION_COOKIE)
        .map(|cookie| cookie.value().to_string())
        .ok_or_else(|| SignalError::Protocol(format!("broker did not set {SESSION_COOKIE}")))?;

    let response = client
        .get(url.clone())
        .header(USER_AGENT, CLIENT_USER_AGENT)
        .header(ACCEPT, "application/json")
        .header(SESSION_TOKEN_HEADER, token)
        .send()
        .await?;
    let envelope = check_status(response).await?.json::<OfferEnvelope>().await?;
    tracing::debug!(target = "webrtc", session_id = %envelope.session_id, "received offer from broker");
    Ok(envelope)
}

pub async fn post_answer(
    client: &reqwest::Client,
    url: &Url,
    envelope: &AnswerEnvelope,
) -> Result<(), SignalError> {
    let response = client
        .post(url.clone())
        .header(USER_AGENT, CLIENT_USER_AGENT)
        .header(ACCEPT, "application/json")
        .header(CONTENT_TYPE, "application/json")
        .json(envelope)
        .send()
        .await?;
    check_status(response).await?;
    Ok(())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, SignalError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(SignalError::Rejected {
        status: status.as_u16(),
        message,
    })
}

pub struct BrokerClientSignaller {
    config: BrokerClientConfig,
    client: reqwest::Client,
    cancel: CancellationToken,
}

impl BrokerClientSignaller {
    pub fn new(config: BrokerClientConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            cancel: CancellationToken::new(),
        }
    }

    async fn exchange(&self, handler: Arc<dyn OfferHandler>) -> Result<(), TransportError> {
        let basic_auth = self
            .config
            .username
            .as_deref()
            .map(|username| (username, self.config.password.as_deref().unwrap_or_default()));
        let envelope = negotiate_offer(&self.client, &self.config.url, basic_auth).await?;
        let offer = Offer::from_description(envelope.description)?;
        let answer = handler
            .handle_offer(&envelope.session_id, offer, envelope.ice)
            .await?;
        let reply = AnswerEnvelope {
            answer: answer.into(),
            session_id: envelope.session_id,
        };
        post_answer(&self.client, &self.config.url, &reply).await?;
        tracing::info!(target = "webrtc", session_id = %reply.session_id, "answer delivered to broker");
        Ok(())
    }
}

#[async_trait]
impl ClientSignaller for BrokerClientSignaller {
    async fn start(&self, handler: Arc<dyn OfferHandler>) -> Result<(), TransportError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
            result = self.exchange(handler) => result,
        }
    }

    fn shutdown(&self) {
        self.cancel.cancel();
    }
}
