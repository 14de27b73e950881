//! Broker state shared by both listeners and the queue worker.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use transport_webrtc_http::signal::{AnswerEnvelope, OfferEnvelope};
use transport_webrtc_http::{IceConfiguration, Offer};
use url::Url;

use crate::connection::{ArrivalInfo, InstanceHandle};
use crate::error::{ApiError, BrokerError};

/// How default URLs are built for arriving instances.
#[derive(Debug, Clone)]
pub struct UrlAssignment {
    pub scheme: String,
    pub domain: String,
    pub port: u16,
    pub path: String,
}

impl UrlAssignment {
    fn origin(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.domain, self.port)
    }

    /// Default URL: origin plus the configured path.
    fn base(&self) -> String {
        let path = self.path.trim_matches('/');
        let mut url = self.origin();
        if !path.is_empty() {
            url.push('/');
            url.push_str(path);
        }
        url
    }
}

type OfferReply = oneshot::Sender<Result<OfferEnvelope, ApiError>>;

struct QueuedRequest {
    ticket: u64,
    session_id: String,
    reply: OfferReply,
}

#[derive(Default)]
struct BrokerState {
    pending_session_id: Option<String>,
    assigned_url: Option<Url>,
    instance: Option<Arc<InstanceHandle>>,
    queue: VecDeque<QueuedRequest>,
    next_ticket: u64,
}

/// What the HTTP listener needs to route a request to the live instance.
#[derive(Debug, Clone)]
pub struct Target {
    pub url: Url,
    pub arrival: ArrivalInfo,
}

pub struct Broker {
    state: Mutex<BrokerState>,
    queued: Notify,
    capacity: usize,
    urls: UrlAssignment,
}

impl Broker {
    pub fn new(capacity: usize, urls: UrlAssignment) -> Self {
        Self {
            state: Mutex::new(BrokerState::default()),
            queued: Notify::new(),
            capacity,
            urls,
        }
    }

    pub fn pending_session(&self) -> Option<String> {
        self.state.lock().pending_session_id.clone()
    }

    pub fn has_instance(&self) -> bool {
        self.state.lock().instance.is_some()
    }

    pub fn target(&self) -> Option<Target> {
        let state = self.state.lock();
        let instance = state.instance.as_ref()?;
        Some(Target {
            url: state.assigned_url.clone()?,
            arrival: instance.arrival.clone(),
        })
    }

    /// Picks the public URL for an arriving instance.
    ///
    /// An empty request gets the default URL. Otherwise the requested path is
    /// kept on the broker's own scheme, host and port; a `required` request
    /// fails when that changes the URL.
    pub fn assign_url(&self, requested: &str, required: bool) -> Result<Url, BrokerError> {
        let assigned = if requested.is_empty() {
            if required {
                return Err(BrokerError::UrlUnavailable("no url provided".into()));
            }
            self.urls.base()
        } else {
            let parsed = Url::parse(requested)
                .map_err(|err| BrokerError::UrlUnavailable(format!("invalid url: {err}")))?;
            let rewritten = format!("{}{}", self.urls.origin(), parsed.path().trim_end_matches('/'));
            if required && !same_url(&rewritten, requested) {
                return Err(BrokerError::UrlUnavailable(requested.to_string()));
            }
            rewritten
        };
        Url::parse(&assigned).map_err(|err| BrokerError::UrlUnavailable(err.to_string()))
    }

    /// Registers the single server instance.
    pub fn attach(&self, instance: Arc<InstanceHandle>, url: Url) -> Result<(), BrokerError> {
        let mut state = self.state.lock();
        if state.instance.is_some() {
            return Err(BrokerError::AlreadyConnected);
        }
        state.instance = Some(instance);
        state.assigned_url = Some(url);
        state.pending_session_id = None;
        Ok(())
    }

    pub fn detach(&self, instance: &InstanceHandle) {
        let mut state = self.state.lock();
        if state.instance.as_ref().is_some_and(|current| current.id == instance.id) {
            state.instance = None;
            state.assigned_url = None;
            state.pending_session_id = None;
        }
    }

    /// Clears the pending session when the instance reports it finished.
    pub fn finish_session(&self, session_id: &str) -> bool {
        let mut state = self.state.lock();
        if state.pending_session_id.as_deref() == Some(session_id) {
            state.pending_session_id = None;
            true
        } else {
            false
        }
    }

    /// Queues an offer request; fails fast when the queue is full.
    pub fn enqueue(
        self: &Arc<Self>,
        session_id: String,
    ) -> Result<(QueueTicket, oneshot::Receiver<Result<OfferEnvelope, ApiError>>), ApiError> {
        let (reply, rx) = oneshot::channel();
        let ticket = {
            let mut state = self.state.lock();
            if state.queue.len() >= self.capacity {
                return Err(ApiError::queue_full());
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.queue.push_back(QueuedRequest {
                ticket,
                session_id,
                reply,
            });
            ticket
        };
        self.queued.notify_one();
        Ok((
            QueueTicket {
                broker: self.clone(),
                ticket,
            },
            rx,
        ))
    }

    pub fn queue_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Serves queued offer requests one at a time until cancelled.
    pub async fn run_worker(self: Arc<Self>, ice: IceConfiguration, cancel: CancellationToken) {
        loop {
            let next = self.state.lock().queue.pop_front();
            let mut request = match next {
                Some(request) => request,
                None => {
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.queued.notified() => {}
                    }
                    continue;
                }
            };
            if request.reply.is_closed() {
                continue;
            }
            let result = self.serve_offer(&request.session_id, &ice, &mut request.reply).await;
            let _ = request.reply.send(result);
        }
    }

    async fn serve_offer(
        &self,
        session_id: &str,
        ice: &IceConfiguration,
        reply: &mut OfferReply,
    ) -> Result<OfferEnvelope, ApiError> {
        let instance = {
            let mut state = self.state.lock();
            if state.pending_session_id.is_some() {
                return Err(ApiError::conflict());
            }
            let Some(instance) = state.instance.clone() else {
                return Err(ApiError::no_pending());
            };
            state.pending_session_id = Some(session_id.to_string());
            instance
        };

        let offer = tokio::select! {
            offer = instance.request_offer(session_id, Some(ice.clone())) => offer,
            _ = reply.closed() => Err(BrokerError::ClientGone),
        };
        let description = match offer {
            Ok(description) => description,
            Err(BrokerError::ClientGone) => {
                // the instance is still working on it and reports back when done
                tracing::debug!(
                    target = "harbor",
                    session_id,
                    "client left while its offer was being made; session stays pending until the instance finishes"
                );
                return Err(ApiError::internal("Client went away"));
            }
            Err(err) => {
                tracing::error!(target = "harbor", session_id, error = %err, "error requesting offer from server instance");
                self.finish_session(session_id);
                return Err(ApiError::internal("Error requesting offer from server"));
            }
        };

        let valid = Offer::from_description(description.clone())
            .ok()
            .and_then(|offer| offer.to_rtc().ok())
            .is_some();
        if !valid {
            tracing::error!(target = "harbor", session_id, "server instance sent an invalid offer");
            self.finish_session(session_id);
            return Err(ApiError::internal("Internal Server Error"));
        }

        tracing::info!(target = "harbor", session_id, "offer ready for client");
        Ok(OfferEnvelope {
            description,
            ice: Some(ice.clone()),
            session_id: session_id.to_string(),
        })
    }

    /// Forwards a client's answer for the pending session.
    pub async fn submit_answer(&self, envelope: AnswerEnvelope) -> Result<(), ApiError> {
        let instance = {
            let state = self.state.lock();
            match state.pending_session_id.as_deref() {
                None => {
                    return Err(ApiError::bad_request(
                        "No pending session found",
                        "Make sure a server is waiting for you before connecting.",
                    ))
                }
                Some(pending) if pending != envelope.session_id => {
                    return Err(ApiError::bad_request(
                        "Invalid Session ID",
                        "Make sure you are sending the correct session ID.",
                    ))
                }
                Some(_) => {}
            }
            state.instance.clone().ok_or_else(ApiError::no_pending)?
        };
        instance
            .send_answer(&envelope.session_id, envelope.answer)
            .await
            .map_err(|err| {
                tracing::error!(target = "harbor", session_id = %envelope.session_id, error = %err, "error forwarding answer");
                ApiError::internal("Error sending answer to server")
            })
    }

    fn cancel_ticket(&self, ticket: u64) {
        self.state.lock().queue.retain(|queued| queued.ticket != ticket);
    }
}

fn same_url(a: &str, b: &str) -> bool {
    match (Url::parse(a), Url::parse(b)) {
        (Ok(a), Ok(b)) => a.as_str().trim_end_matches('/') == b.as_str().trim_end_matches('/'),
        _ => false,
    }
}

/// Removes a still-queued request when its HTTP caller goes away.
pub struct QueueTicket {
    broker: Arc<Broker>,
    ticket: u64,
}

impl Drop for QueueTicket {
    fn drop(&mut self) {
        self.broker.cancel_ticket(self.ticket);
    }
}
