//! WebSocket API used by the single server instance.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::{timeout, Instant};
use transport_webrtc_http::signal::protocol::{BasicAuth, BrokerMessage, API_VERSION};
use transport_webrtc_http::{IceConfiguration, SessionDescription};
use uuid::Uuid;

use crate::error::BrokerError;
use crate::AppState;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(1);
pub const ARRIVAL_TIMEOUT: Duration = Duration::from_secs(10);
pub const INSTANCE_REPLY_TIMEOUT: Duration = Duration::from_secs(30);
/// Silence longer than this drops the instance.
pub const PING_WINDOW: Duration = Duration::from_millis(500);
/// Once the connection has been stable this long the window widens.
pub const SLOWDOWN_AFTER: Duration = Duration::from_secs(6);
pub const SLOW_PING_WINDOW: Duration = Duration::from_millis(500 * 8);

/// Arrival options that shape how the HTTP listener treats clients.
#[derive(Debug, Clone, Default)]
pub struct ArrivalInfo {
    pub basic_auth: Option<BasicAuth>,
    pub redirect: Option<String>,
    pub redirect_only: bool,
}

/// The broker's side of a connected server instance.
pub struct InstanceHandle {
    pub(crate) id: Uuid,
    outbound: mpsc::UnboundedSender<BrokerMessage>,
    inbox: AsyncMutex<mpsc::UnboundedReceiver<BrokerMessage>>,
    pub arrival: ArrivalInfo,
}

impl InstanceHandle {
    pub fn new(
        outbound: mpsc::UnboundedSender<BrokerMessage>,
        inbox: mpsc::UnboundedReceiver<BrokerMessage>,
        arrival: ArrivalInfo,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            outbound,
            inbox: AsyncMutex::new(inbox),
            arrival,
        }
    }

    pub async fn request_offer(
        &self,
        session_id: &str,
        ice: Option<IceConfiguration>,
    ) -> Result<SessionDescription, BrokerError> {
        let mut inbox = self.inbox.lock().await;
        self.send(BrokerMessage::GetOfferRequest {
            session_id: session_id.to_string(),
            ice,
        })?;
        let reply = recv_for(&mut inbox, session_id, |message| {
            matches!(message, BrokerMessage::GetOfferResponse { .. })
        })
        .await?;
        match reply {
            BrokerMessage::GetOfferResponse {
                error: Some(error), ..
            } => Err(BrokerError::Instance(error)),
            BrokerMessage::GetOfferResponse {
                offer: Some(offer), ..
            } => Ok(offer),
            _ => Err(BrokerError::Instance("no offer in response".into())),
        }
    }

    pub async fn send_answer(&self, session_id: &str, answer: SessionDescription) -> Result<(), BrokerError> {
        let mut inbox = self.inbox.lock().await;
        self.send(BrokerMessage::GotAnswerRequest {
            session_id: session_id.to_string(),
            answer,
        })?;
        let reply = recv_for(&mut inbox, session_id, |message| {
            matches!(message, BrokerMessage::GotAnswerResponse { .. })
        })
        .await?;
        match reply {
            BrokerMessage::GotAnswerResponse {
                error: Some(error), ..
            } => Err(BrokerError::Instance(error)),
            _ => Ok(()),
        }
    }

    fn send(&self, message: BrokerMessage) -> Result<(), BrokerError> {
        self.outbound.send(message).map_err(|_| BrokerError::InstanceGone)
    }
}

/// Next inbox message of the wanted kind for `session_id`; anything else is
/// left over from an abandoned exchange and dropped.
async fn recv_for(
    inbox: &mut mpsc::UnboundedReceiver<BrokerMessage>,
    session_id: &str,
    wanted: fn(&BrokerMessage) -> bool,
) -> Result<BrokerMessage, BrokerError> {
    let wait = async {
        loop {
            let message = inbox.recv().await.ok_or(BrokerError::InstanceGone)?;
            if message.session_id() == Some(session_id) && wanted(&message) {
                return Ok(message);
            }
            tracing::debug!(target = "harbor", expected = session_id, dropped = ?message, "dropping stale instance message");
        }
    };
    timeout(INSTANCE_REPLY_TIMEOUT, wait)
        .await
        .map_err(|_| BrokerError::Timeout)?
}

pub async fn connect_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_instance(socket, app))
}

async fn handle_instance(socket: WebSocket, app: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<BrokerMessage>();
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.to_json() {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        break;
                    }
                }
                Err(err) => tracing::warn!(target = "harbor", error = %err, "failed to encode message"),
            }
        }
        let _ = sender.close().await;
    });

    if let Err(err) = handshake(&app, &tx, &mut receiver).await {
        tracing::warn!(target = "harbor", error = %err, "instance handshake failed");
        return;
    }

    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let instance = match arrive(&app, &tx, &mut receiver, inbox_rx).await {
        Ok(instance) => instance,
        Err(err) => {
            tracing::warn!(target = "harbor", error = %err, "instance arrival failed");
            return;
        }
    };

    hold(&app, &tx, &mut receiver, inbox_tx).await;
    app.broker.detach(&instance);
    tracing::info!(target = "harbor", instance = %instance.id, "server instance disconnected");
}

async fn handshake<S>(
    app: &AppState,
    tx: &mpsc::UnboundedSender<BrokerMessage>,
    receiver: &mut S,
) -> Result<(), String>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let first = timeout(HANDSHAKE_TIMEOUT, next_message(receiver))
        .await
        .map_err(|_| "timed out waiting for handshake".to_string())?;
    let (version, key) = match first {
        Some(BrokerMessage::Handshake { error: Some(error), .. }) => {
            return Err(format!("instance reported: {error}"));
        }
        Some(BrokerMessage::Handshake { version, key, .. }) => (version, key),
        Some(other) => return Err(format!("expected handshake, got {other:?}")),
        None => return Err("connection closed".into()),
    };

    let refusal = if app.config.required_key.is_some() && app.config.required_key != key {
        Some("unauthorized")
    } else if app.broker.has_instance() {
        Some("another server instance is already connected")
    } else {
        None
    };
    let _ = tx.send(BrokerMessage::Handshake {
        version: API_VERSION.to_string(),
        key: None,
        error: refusal.map(str::to_string),
    });
    if let Some(refusal) = refusal {
        return Err(refusal.to_string());
    }
    tracing::info!(target = "harbor", instance_version = %version, "server instance handshake");
    Ok(())
}

async fn arrive<S>(
    app: &AppState,
    tx: &mpsc::UnboundedSender<BrokerMessage>,
    receiver: &mut S,
    inbox: mpsc::UnboundedReceiver<BrokerMessage>,
) -> Result<Arc<InstanceHandle>, BrokerError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let request = timeout(ARRIVAL_TIMEOUT, next_message(receiver))
        .await
        .map_err(|_| BrokerError::Timeout)?;
    let Some(BrokerMessage::ServerArrivalRequest {
        url,
        required,
        basic_auth,
        redirect,
        redirect_only,
        ttl_secs,
    }) = request
    else {
        return Err(BrokerError::Instance("expected an arrival request".into()));
    };

    let result = app.broker.assign_url(&url, required).and_then(|assigned| {
        let instance = Arc::new(InstanceHandle::new(
            tx.clone(),
            inbox,
            ArrivalInfo {
                basic_auth,
                redirect: redirect.filter(|r| !r.is_empty()),
                redirect_only,
            },
        ));
        app.broker.attach(instance.clone(), assigned.clone())?;
        Ok((instance, assigned))
    });

    match result {
        Ok((instance, assigned)) => {
            tracing::info!(target = "harbor", url = %assigned, ttl_secs = ?ttl_secs, "assigned url to server instance");
            let _ = tx.send(BrokerMessage::ServerArrivalResponse {
                url: assigned.as_str().trim_end_matches('/').to_string(),
                error: None,
            });
            Ok(instance)
        }
        Err(err) => {
            let _ = tx.send(BrokerMessage::ServerArrivalResponse {
                url: String::new(),
                error: Some(err.to_string()),
            });
            Err(err)
        }
    }
}

/// Keeps the instance registered while it keeps pinging.
async fn hold<S>(
    app: &AppState,
    tx: &mpsc::UnboundedSender<BrokerMessage>,
    receiver: &mut S,
    inbox: mpsc::UnboundedSender<BrokerMessage>,
) where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let started = Instant::now();
    let mut window = PING_WINDOW;
    loop {
        let message = match timeout(window, next_message(receiver)).await {
            Ok(Some(message)) => message,
            Ok(None) => return,
            Err(_) => {
                tracing::warn!(target = "harbor", ?window, "server instance missed its ping window");
                return;
            }
        };

        if window == PING_WINDOW && started.elapsed() >= SLOWDOWN_AFTER {
            window = SLOW_PING_WINDOW;
            let period_ms = (window / 2).as_millis() as u64;
            tracing::debug!(target = "harbor", period_ms, "slowing instance ping rate");
            let _ = tx.send(BrokerMessage::UpdatePingRateRequest { period_ms });
        }

        match message {
            BrokerMessage::Ping => {}
            BrokerMessage::FinishedSessionRequest { session_id, error } => {
                match &error {
                    Some(error) => tracing::warn!(target = "harbor", session_id = %session_id, error = %error, "session failed"),
                    None => tracing::info!(target = "harbor", session_id = %session_id, "session finished"),
                }
                app.broker.finish_session(&session_id);
                let _ = tx.send(BrokerMessage::FinishedSessionResponse { session_id });
            }
            other => {
                let _ = inbox.send(other);
            }
        }
    }
}

/// Next decoded message; `None` on close, socket error or undecodable text.
async fn next_message<S>(receiver: &mut S) -> Option<BrokerMessage>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    while let Some(frame) = receiver.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Binary(data)) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(err) => {
                tracing::debug!(target = "harbor", error = %err, "instance socket error");
                return None;
            }
        };
        match BrokerMessage::from_json(&text) {
            Ok(message) => return Some(message),
            Err(err) => {
                tracing::warn!(target = "harbor", error = %err, "invalid message from instance");
                return None;
            }
        }
    }
    None
}

/// Instance handle plus the far ends of its outbound and inbox channels.
#[cfg(test)]
pub(crate) type TestInstance = (
    Arc<InstanceHandle>,
    mpsc::UnboundedReceiver<BrokerMessage>,
    mpsc::UnboundedSender<BrokerMessage>,
);

#[cfg(test)]
pub(crate) fn test_instance(arrival: ArrivalInfo) -> TestInstance {
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    (
        Arc::new(InstanceHandle::new(outbound, inbox_rx, arrival)),
        outbound_rx,
        inbox_tx,
    )
}
