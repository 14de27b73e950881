//! Serving side: answers requests arriving on a data channel.

mod request;
mod response;

use std::sync::Arc;

use async_trait::async_trait;
use http::{Request, StatusCode};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;

pub use request::{RemoteAddr, RequestBody};
pub use response::ResponseWriter;

use crate::channel::FrameLink;
use crate::config::{IceConfiguration, WebRtcConfig};
use crate::error::{to_setup_error, PeerConnectionError, TransportError};
use crate::flow::FlowControlledWriter;
use crate::framing::{parse_request_head, read_head};
use crate::net::prefer_non_private_ip;
use crate::peer::{new_peer_connection, PeerEvent, PeerHandle, PeerOptions, PeerRole};
use crate::signal::{AnswerOffer, RequestHandler};
use request::pump_body;

/// Header a client must send when the offer carried a bearer token.
pub const AUTHORIZATION_HEADER: &str = "x-datachannel-authorization";

#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn serve(
        &self,
        request: Request<RequestBody>,
        response: &mut ResponseWriter,
    ) -> Result<(), TransportError>;
}

/// Serves one peer at a time, dispatching each request to `handler`.
pub struct Server {
    config: WebRtcConfig,
    handler: Arc<dyn HttpHandler>,
    active: Arc<Semaphore>,
}

impl Server {
    pub fn new(config: WebRtcConfig, handler: Arc<dyn HttpHandler>) -> Self {
        Self {
            config,
            handler,
            active: Arc::new(Semaphore::new(1)),
        }
    }

    pub(crate) async fn dispatch(
        &self,
        mut link: FrameLink,
        remote: Option<String>,
        errors: &mut mpsc::UnboundedReceiver<PeerConnectionError>,
        cancel: &CancellationToken,
    ) -> Result<(), TransportError> {
        let writer = FlowControlledWriter::new(link.sink.clone(), link.low_water.clone());
        let mut served = 0usize;
        loop {
            let head = tokio::select! {
                head = read_head(&mut link.frames) => head,
                _ = cancel.cancelled() => return Err(TransportError::Cancelled),
                Some(err) = errors.recv() => {
                    if served > 0 {
                        tracing::debug!(target = "webrtc", served, error = %err, "peer went away after serving");
                        return Ok(());
                    }
                    return Err(err.into());
                }
            };
            let head = match head? {
                Some(head) => head,
                None if served > 0 => return Ok(()),
                None => return Err(TransportError::ChannelClosed),
            };

            let parsed = parse_request_head(&head)?;
            tracing::debug!(target = "webrtc", method = %parsed.method, uri = %parsed.uri, "serving request");
            let (body_tx, body) = RequestBody::channel();
            let mut request = parsed.into_request(body);
            if let Some(addr) = &remote {
                request.extensions_mut().insert(RemoteAddr(addr.clone()));
            }

            let mut response = ResponseWriter::new(writer.clone());
            let handled = self.respond(request, &mut response);
            let (pumped, handled) = tokio::join!(pump_body(&mut link.frames, body_tx), handled);
            handled?;
            pumped?;
            served += 1;
        }
    }

    async fn respond(
        &self,
        request: Request<RequestBody>,
        response: &mut ResponseWriter,
    ) -> Result<(), TransportError> {
        if !self.authorized(&request) {
            tracing::warn!(target = "webrtc", uri = %request.uri(), "rejecting request without bearer token");
            response.set_status(StatusCode::UNAUTHORIZED);
            response.write(b"unauthorized").await?;
            return response.finish().await;
        }
        if let Err(err) = self.handler.serve(request, response).await {
            tracing::warn!(target = "webrtc", error = %err, "handler failed");
            if matches!(err, TransportError::ChannelClosed) {
                return Err(err);
            }
            if !response.head_sent() {
                response.set_status(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
        response.finish().await
    }

    fn authorized<B>(&self, request: &Request<B>) -> bool {
        let Some(token) = &self.config.bearer_token else {
            return true;
        };
        request
            .headers()
            .get(AUTHORIZATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .is_some_and(|presented| presented == token)
    }
}

#[async_trait]
impl RequestHandler for Server {
    async fn handle_request(
        &self,
        cancel: CancellationToken,
        session_id: String,
        ice: Option<IceConfiguration>,
        exchange: Arc<dyn AnswerOffer>,
    ) -> Result<(), TransportError> {
        let _permit = self
            .active
            .clone()
            .try_acquire_owned()
            .map_err(|_| TransportError::Busy)?;

        let ice = ice.unwrap_or_else(|| self.config.ice.clone());
        let pc = new_peer_connection(&self.config, &ice).await?;
        let options = PeerOptions::from_config(PeerRole::Offerer, session_id.clone(), &self.config)
            .with_exchange(exchange);
        let (peer, mut errors) = PeerHandle::spawn(pc.clone(), options, cancel.child_token());

        let init = RTCDataChannelInit {
            ordered: Some(self.config.ordered),
            ..Default::default()
        };
        let dc = match pc
            .create_data_channel(&self.config.data_channel_label, Some(init))
            .await
        {
            Ok(dc) => dc,
            Err(err) => {
                peer.close().await;
                return Err(to_setup_error(err));
            }
        };
        let opened = Arc::new(Notify::new());
        let open_signal = opened.clone();
        dc.on_open(Box::new(move || {
            let notify = open_signal.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", "data channel opened (server)");
                notify.notify_one();
            })
        }));
        let link = FrameLink::attach(dc).await;
        peer.notify(PeerEvent::NegotiationNeeded);

        let open = tokio::select! {
            _ = opened.notified() => Ok(()),
            Some(err) = errors.recv() => Err(err.into()),
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            _ = sleep(self.config.channel_open_timeout) => Err(TransportError::Timeout("data channel open")),
        };
        if let Err(err) = open {
            peer.close().await;
            return Err(err);
        }

        let remote = prefer_non_private_ip(&peer.remote_addresses());
        tracing::info!(target = "webrtc", session_id = %session_id, remote = ?remote, "data channel ready");
        let result = self.dispatch(link, remote, &mut errors, &cancel).await;
        peer.close().await;
        result
    }
}
