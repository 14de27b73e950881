//! Requesting side: answers an offer, then sends requests over the channel.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use http::header::{HeaderValue, HOST};
use http::{Request, Response};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use webrtc::data_channel::RTCDataChannel;

use crate::channel::{Frame, FrameLink};
use crate::config::{IceConfiguration, WebRtcConfig};
use crate::error::{NegotiationError, PeerConnectionError, TransportError};
use crate::flow::FlowControlledWriter;
use crate::framing::{encode_request_head, parse_response_head, read_head};
use crate::peer::{new_peer_connection, PeerEvent, PeerHandle, PeerOptions, PeerRole, PeerState};
use crate::sdp::{Answer, Offer};
use crate::server::AUTHORIZATION_HEADER;
use crate::signal::OfferHandler;

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, TransportError>> + Send>>;

/// Body of an outgoing request.
#[derive(Default)]
pub struct OutgoingBody(BodyKind);

#[derive(Default)]
enum BodyKind {
    #[default]
    Empty,
    Full(Bytes),
    Stream(BodyStream),
}

impl OutgoingBody {
    pub fn empty() -> Self {
        Self(BodyKind::Empty)
    }

    pub fn stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, TransportError>> + Send + 'static,
    {
        Self(BodyKind::Stream(Box::pin(stream)))
    }
}

impl From<Bytes> for OutgoingBody {
    fn from(bytes: Bytes) -> Self {
        Self(BodyKind::Full(bytes))
    }
}

impl From<Vec<u8>> for OutgoingBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self(BodyKind::Full(bytes.into()))
    }
}

impl From<String> for OutgoingBody {
    fn from(text: String) -> Self {
        Self(BodyKind::Full(text.into()))
    }
}

impl From<&'static str> for OutgoingBody {
    fn from(text: &'static str) -> Self {
        Self(BodyKind::Full(Bytes::from_static(text.as_bytes())))
    }
}

#[derive(Default)]
struct LinkSlot {
    pending: Option<(
        oneshot::Receiver<FrameLink>,
        mpsc::UnboundedReceiver<PeerConnectionError>,
    )>,
    link: Option<FrameLink>,
    /// A previous response body was dropped before its end marker.
    in_body: bool,
}

pub struct ClientTransport {
    config: WebRtcConfig,
    slot: Arc<AsyncMutex<LinkSlot>>,
    peer: Mutex<Option<Arc<PeerHandle>>>,
    /// Token announced in the last handled offer.
    bearer_token: Mutex<Option<String>>,
    cancel: CancellationToken,
}

impl ClientTransport {
    pub fn new(config: WebRtcConfig) -> Self {
        Self {
            config,
            slot: Arc::new(AsyncMutex::new(LinkSlot::default())),
            peer: Mutex::new(None),
            bearer_token: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    /// Local ICE candidates gathered so far, as `host:port`.
    pub fn peer_addresses(&self) -> Vec<String> {
        self.peer
            .lock()
            .as_ref()
            .map(|peer| peer.local_addresses())
            .unwrap_or_default()
    }

    pub fn connection_established(&self) -> bool {
        self.peer
            .lock()
            .as_ref()
            .is_some_and(|peer| peer.state() == PeerState::Connected)
    }

    pub async fn close(&self) {
        self.cancel.cancel();
        // a live response body holds the slot; its link goes with the peer
        if let Ok(mut slot) = self.slot.try_lock() {
            slot.pending = None;
            if let Some(link) = slot.link.take() {
                link.close().await;
            }
        }
        let peer = self.peer.lock().take();
        if let Some(peer) = peer {
            peer.close().await;
        }
    }

    pub async fn round_trip(
        &self,
        request: Request<OutgoingBody>,
    ) -> Result<Response<ResponseBody>, TransportError> {
        let (mut parts, body) = request.into_parts();
        let bearer = self.bearer_token.lock().clone();
        if let Some(token) = bearer {
            if !parts.headers.contains_key(AUTHORIZATION_HEADER) {
                let value = HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
                parts.headers.insert(AUTHORIZATION_HEADER, value);
            }
        }
        if !parts.headers.contains_key(HOST) {
            if let Some(authority) = parts.uri.authority() {
                let value = HeaderValue::from_str(authority.as_str())
                    .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
                parts.headers.insert(HOST, value);
            }
        }
        let head = encode_request_head(&parts.method, &parts.uri, &parts.headers)?;

        let mut slot = self.slot.clone().lock_owned().await;
        self.wait_for_link(&mut slot).await?;
        drain_previous_body(&mut slot).await?;

        let link = slot.link.as_mut().ok_or(TransportError::ChannelClosed)?;
        let writer = FlowControlledWriter::new(link.sink.clone(), link.low_water.clone());
        writer.write_text(&head).await?;
        if let Err(err) = send_body(&writer, body).await {
            link.close().await;
            slot.link = None;
            return Err(err);
        }
        writer.write_eof().await?;

        let head = match read_head(&mut link.frames).await? {
            Some(head) => head,
            None => {
                slot.link = None;
                return Err(TransportError::ChannelClosed);
            }
        };
        let parsed = parse_response_head(&head)?;
        tracing::debug!(target = "webrtc", method = %parts.method, uri = %parts.uri, status = %parsed.status, "round trip response");
        slot.in_body = true;
        Ok(parsed.into_response(ResponseBody { slot: Some(slot) }))
    }

    async fn wait_for_link(&self, slot: &mut LinkSlot) -> Result<(), TransportError> {
        if slot.link.is_some() {
            return Ok(());
        }
        // polled in place so a timed-out or dropped wait leaves the link for later callers
        let Some((link_rx, errors)) = slot.pending.as_mut() else {
            return Err(TransportError::InvalidRequest(
                "no offer has been handled yet".into(),
            ));
        };
        let opened = tokio::select! {
            link = link_rx => link.map_err(|_| TransportError::ChannelClosed),
            Some(err) = errors.recv() => Err(err.into()),
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            _ = sleep(self.config.channel_open_timeout) => {
                return Err(TransportError::Timeout("data channel open"));
            }
        };
        slot.pending = None;
        slot.link = Some(opened?);
        Ok(())
    }
}

async fn send_body(writer: &FlowControlledWriter, body: OutgoingBody) -> Result<(), TransportError> {
    match body.0 {
        BodyKind::Empty => Ok(()),
        BodyKind::Full(bytes) => writer.write_binary(&bytes).await.map(|_| ()),
        BodyKind::Stream(mut stream) => {
            while let Some(chunk) = stream.next().await {
                writer.write_binary(&chunk?).await?;
            }
            Ok(())
        }
    }
}

async fn drain_previous_body(slot: &mut LinkSlot) -> Result<(), TransportError> {
    if !slot.in_body {
        return Ok(());
    }
    let link = slot.link.as_mut().ok_or(TransportError::ChannelClosed)?;
    loop {
        match link.frames.recv().await {
            Some(Frame::Binary(_)) => continue,
            Some(Frame::Text(_)) => break,
            None => {
                slot.link = None;
                return Err(TransportError::ChannelClosed);
            }
        }
    }
    slot.in_body = false;
    Ok(())
}

#[async_trait]
impl OfferHandler for ClientTransport {
    async fn handle_offer(
        &self,
        session_id: &str,
        offer: Offer,
        ice: Option<IceConfiguration>,
    ) -> Result<Answer, TransportError> {
        let description = offer.to_rtc()?;
        let ice = ice.unwrap_or_else(|| self.config.ice.clone());
        let pc = new_peer_connection(&self.config, &ice).await?;
        let options = PeerOptions::from_config(PeerRole::Answerer, session_id, &self.config);
        let (peer, errors) = PeerHandle::spawn(pc.clone(), options, self.cancel.child_token());

        let (link_tx, link_rx) = oneshot::channel();
        let link_tx = Arc::new(Mutex::new(Some(link_tx)));
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let link_tx = link_tx.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", label = %dc.label(), "data channel announced");
                let link = Arc::new(Mutex::new(Some(FrameLink::attach(dc.clone()).await)));
                dc.on_open(Box::new(move || {
                    let link = link.clone();
                    let link_tx = link_tx.clone();
                    Box::pin(async move {
                        tracing::debug!(target = "webrtc", "data channel opened (client)");
                        let ready = link.lock().take();
                        let tx = link_tx.lock().take();
                        if let (Some(link), Some(tx)) = (ready, tx) {
                            let _ = tx.send(link);
                        }
                    })
                }));
            })
        }));

        let negotiated = async {
            pc.set_remote_description(description).await.map_err(|err| {
                PeerConnectionError::local(NegotiationError::SetRemoteDescription(err.to_string()))
            })?;
            let answer = pc.create_answer(None).await.map_err(|err| {
                PeerConnectionError::local(NegotiationError::SetLocalDescription(err.to_string()))
            })?;
            let mut gathered = pc.gathering_complete_promise().await;
            pc.set_local_description(answer).await.map_err(|err| {
                PeerConnectionError::local(NegotiationError::SetLocalDescription(err.to_string()))
            })?;
            peer.notify(PeerEvent::LocalDescriptionSet);
            match self.config.ice_gather_timeout {
                Some(limit) => {
                    if timeout(limit, gathered.recv()).await.is_err() {
                        tracing::debug!(target = "webrtc", ?limit, "answering with partial candidates");
                    }
                }
                None => {
                    let _ = gathered.recv().await;
                }
            }
            let local = pc
                .local_description()
                .await
                .ok_or_else(|| TransportError::Setup("missing local description".into()))?;
            Ok::<_, TransportError>(Answer::from_rtc(&local))
        }
        .await;

        let answer = match negotiated {
            Ok(answer) => answer,
            Err(err) => {
                peer.close().await;
                return Err(err);
            }
        };

        *self.bearer_token.lock() = offer.bearer_token().map(str::to_string);
        let previous = self.peer.lock().replace(Arc::new(peer));
        if let Some(previous) = previous {
            previous.close().await;
        }
        *self.slot.lock().await = LinkSlot {
            pending: Some((link_rx, errors)),
            link: None,
            in_body: false,
        };
        tracing::info!(target = "webrtc", session_id, "answer ready");
        Ok(answer)
    }
}

/// Streaming response body; ends at the server's end-of-body text frame.
pub struct ResponseBody {
    slot: Option<OwnedMutexGuard<LinkSlot>>,
}

impl std::fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseBody")
            .field("finished", &self.slot.is_none())
            .finish()
    }
}

impl ResponseBody {
    pub async fn chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.next().await
    }

    pub async fn collect(mut self) -> Result<Bytes, TransportError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(body.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            let Some(slot) = this.slot.as_mut() else {
                return Poll::Ready(None);
            };
            let frame = match slot.link.as_mut() {
                Some(link) => ready!(link.frames.poll_recv(cx)),
                None => None,
            };
            match frame {
                Some(Frame::Binary(data)) if data.is_empty() => continue,
                Some(Frame::Binary(data)) => return Poll::Ready(Some(Ok(data))),
                Some(Frame::Text(_)) => {
                    slot.in_body = false;
                    this.slot = None;
                    return Poll::Ready(None);
                }
                None => {
                    slot.link = None;
                    slot.in_body = false;
                    this.slot = None;
                    return Poll::Ready(Some(Err(TransportError::ChannelClosed)));
                }
            }
        }
    }
}

#[cfg(test)]
impl ClientTransport {
    fn with_link(config: WebRtcConfig, link: FrameLink) -> Self {
        let transport = Self::new(config);
        let slot = LinkSlot {
            pending: None,
            link: Some(link),
            in_body: false,
        };
        Self {
            slot: Arc::new(AsyncMutex::new(slot)),
            ..transport
        }
    }

    fn with_pending_link(config: WebRtcConfig) -> (Self, oneshot::Sender<FrameLink>) {
        let transport = Self::new(config);
        let (link_tx, link_rx) = oneshot::channel();
        let (_errors_tx, errors) = mpsc::unbounded_channel();
        let slot = LinkSlot {
            pending: Some((link_rx, errors)),
            link: None,
            in_body: false,
        };
        let transport = Self {
            slot: Arc::new(AsyncMutex::new(slot)),
            ..transport
        };
        (transport, link_tx)
    }
}

#[cfg(test)]
mod tests {
    use http::{Method, StatusCode};

    use super::*;
    use crate::channel::memory;
    use crate::flow::MTU;
    use crate::framing::{encode_response_head, parse_request_head};
    use crate::server::{HttpHandler, RequestBody, ResponseWriter, Server};

    struct Upper;

    #[async_trait]
    impl HttpHandler for Upper {
        async fn serve(
            &self,
            request: Request<RequestBody>,
            response: &mut ResponseWriter,
        ) -> Result<(), TransportError> {
            let body = request.into_body().collect().await?;
            response.set_status(StatusCode::CREATED);
            response.write(&body.to_ascii_uppercase()).await?;
            Ok(())
        }
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn round_trip_against_dispatch_loop() {
        let (client_end, server_end) = memory::pair();
        let client = ClientTransport::with_link(WebRtcConfig::localhost(), client_end.link);
        let server = Server::new(WebRtcConfig::localhost(), Arc::new(Upper));
        let serving = tokio::spawn(async move {
            let (_errors_tx, mut errors) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            server.dispatch(server_end.link, None, &mut errors, &cancel).await
        });

        let chunks = vec![Ok(Bytes::from(vec![b'a'; MTU])), Ok(Bytes::from_static(b"tail"))];
        let request = Request::builder()
            .method(Method::POST)
            .uri("http://peer.example/shout")
            .body(OutgoingBody::stream(futures_util::stream::iter(chunks)))
            .expect("request");
        let response = client.round_trip(request).await.expect("round trip");
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = response.into_body().collect().await.expect("body");
        let mut expected = vec![b'A'; MTU];
        expected.extend_from_slice(b"TAIL");
        assert_eq!(body, expected);

        let request = Request::builder()
            .uri("/again")
            .body(OutgoingBody::from("second"))
            .expect("request");
        let response = client.round_trip(request).await.expect("second round trip");
        assert_eq!(response.into_body().collect().await.expect("body"), "SECOND");

        client.close().await;
        drop(client);
        serving.await.expect("join").expect("served");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn dropped_body_is_drained_before_next_request() {
        let (client_end, mut server_end) = memory::pair();
        let client = ClientTransport::with_link(WebRtcConfig::localhost(), client_end.link);
        let server_writer =
            FlowControlledWriter::new(server_end.link.sink.clone(), server_end.link.low_water.clone());

        let peer = tokio::spawn(async move {
            for round in 0..2 {
                let head = read_head(&mut server_end.link.frames).await.expect("read").expect("head");
                let parsed = parse_request_head(&head).expect("parse");
                assert_eq!(parsed.headers[HOST], "peer.example");
                while !server_end.link.frames.recv().await.expect("frame").is_text() {}
                let head = encode_response_head(StatusCode::OK, &http::HeaderMap::new()).expect("head");
                server_writer.write_text(&head).await.expect("head");
                server_writer
                    .write_binary(format!("round-{round}").as_bytes())
                    .await
                    .expect("body");
                server_writer.write_binary(b"-more").await.expect("body");
                server_writer.write_eof().await.expect("eof");
            }
        });

        let first = client
            .round_trip(
                Request::builder()
                    .uri("http://peer.example/one")
                    .body(OutgoingBody::empty())
                    .expect("request"),
            )
            .await
            .expect("first");
        drop(first);

        let second = client
            .round_trip(
                Request::builder()
                    .uri("http://peer.example/two")
                    .body(OutgoingBody::empty())
                    .expect("request"),
            )
            .await
            .expect("second");
        assert_eq!(
            second.into_body().collect().await.expect("body"),
            "round-1-more"
        );
        peer.await.expect("peer");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn bearer_token_from_offer_is_attached() {
        let (client_end, mut server_end) = memory::pair();
        let client = ClientTransport::with_link(WebRtcConfig::localhost(), client_end.link);
        *client.bearer_token.lock() = Some("tok".into());

        let sent = tokio::spawn(async move {
            let head = read_head(&mut server_end.link.frames).await.expect("read").expect("head");
            parse_request_head(&head).expect("parse")
        });
        let pending = tokio::spawn(async move {
            let _ = client
                .round_trip(Request::builder().uri("/").body(OutgoingBody::empty()).expect("request"))
                .await;
        });
        let head = sent.await.expect("join");
        assert_eq!(head.headers[AUTHORIZATION_HEADER], "Bearer tok");
        pending.abort();
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn late_channel_serves_round_trip_after_timeout() {
        let config = WebRtcConfig {
            channel_open_timeout: std::time::Duration::from_millis(50),
            ..WebRtcConfig::localhost()
        };
        let (client, link_tx) = ClientTransport::with_pending_link(config);
        let request = || {
            Request::builder()
                .uri("http://peer.example/late")
                .body(OutgoingBody::from("late"))
                .expect("request")
        };

        let err = client.round_trip(request()).await.expect_err("channel not open yet");
        assert!(matches!(err, TransportError::Timeout(_)), "{err:?}");

        let (client_end, server_end) = memory::pair();
        assert!(link_tx.send(client_end.link).is_ok());
        let server = Server::new(WebRtcConfig::localhost(), Arc::new(Upper));
        let serving = tokio::spawn(async move {
            let (_errors_tx, mut errors) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            server.dispatch(server_end.link, None, &mut errors, &cancel).await
        });

        let response = client.round_trip(request()).await.expect("round trip once open");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.into_body().collect().await.expect("body"), "LATE");

        client.close().await;
        drop(client);
        serving.await.expect("join").expect("served");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn round_trip_without_offer_is_rejected() {
        let client = ClientTransport::new(WebRtcConfig::localhost());
        let err = client
            .round_trip(Request::builder().uri("/").body(OutgoingBody::empty()).expect("request"))
            .await
            .expect_err("no link");
        assert!(matches!(err, TransportError::InvalidRequest(_)));
    }
}
