//! Peer-connection negotiation as an explicit state machine.
//!
//! webrtc callbacks only translate into [`PeerEvent`]s and push them onto an
//! unbounded channel. A single driver task feeds them to [`PeerMachine`] and
//! performs the returned [`PeerAction`]s, so no callback ever blocks.

use std::fmt;
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Sleep};
use tokio_util::sync::CancellationToken;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

use crate::config::{IceConfiguration, WebRtcConfig};
use crate::error::{to_setup_error, NegotiationError, Origin, PeerConnectionError, TransportError};
use crate::sdp::Offer;
use crate::signal::AnswerOffer;

/// ICE or overall connection state, collapsed from the webrtc enums.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unspecified,
    New,
    Checking,
    Connecting,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Unspecified => "unspecified",
            LinkState::New => "new",
            LinkState::Checking => "checking",
            LinkState::Connecting => "connecting",
            LinkState::Connected => "connected",
            LinkState::Completed => "completed",
            LinkState::Disconnected => "disconnected",
            LinkState::Failed => "failed",
            LinkState::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl From<RTCIceConnectionState> for LinkState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::New => LinkState::New,
            RTCIceConnectionState::Checking => LinkState::Checking,
            RTCIceConnectionState::Connected => LinkState::Connected,
            RTCIceConnectionState::Completed => LinkState::Completed,
            RTCIceConnectionState::Disconnected => LinkState::Disconnected,
            RTCIceConnectionState::Failed => LinkState::Failed,
            RTCIceConnectionState::Closed => LinkState::Closed,
            _ => LinkState::Unspecified,
        }
    }
}

impl From<RTCPeerConnectionState> for LinkState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::New => LinkState::New,
            RTCPeerConnectionState::Connecting => LinkState::Connecting,
            RTCPeerConnectionState::Connected => LinkState::Connected,
            RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
            RTCPeerConnectionState::Failed => LinkState::Failed,
            RTCPeerConnectionState::Closed => LinkState::Closed,
            _ => LinkState::Unspecified,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PeerState::Disconnected | PeerState::Failed | PeerState::Closed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Creates the data channel and the offer; the server side.
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    NegotiationNeeded,
    LocalDescriptionSet,
    /// `None` marks the end of candidate gathering.
    IceCandidate(Option<String>),
    IceConnection(LinkState),
    Connection(LinkState),
    Signalling(String),
    WatchdogExpired,
    GatherTimeout,
    /// Remote description applied; carries the answer's candidate addresses.
    Exchanged(Vec<String>),
    LocalFailure(NegotiationError),
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    CreateOffer,
    ExchangeOffer,
    ArmWatchdog(Duration),
    DisarmWatchdog,
    ArmGatherTimeout(Duration),
    Report(PeerConnectionError),
    Close,
}

#[derive(Debug)]
pub struct PeerMachine {
    role: PeerRole,
    state: PeerState,
    checking_timeout: Duration,
    gather_timeout: Option<Duration>,
    offer_requested: bool,
    local_description_set: bool,
    gathering_complete: bool,
    exchange_started: bool,
    watchdog_armed: bool,
    local_candidates: Vec<String>,
    remote_candidates: Vec<String>,
}

impl PeerMachine {
    pub fn new(role: PeerRole, checking_timeout: Duration, gather_timeout: Option<Duration>) -> Self {
        Self {
            role,
            state: PeerState::New,
            checking_timeout,
            gather_timeout,
            offer_requested: false,
            local_description_set: false,
            gathering_complete: false,
            exchange_started: false,
            watchdog_armed: false,
            local_candidates: Vec::new(),
            remote_candidates: Vec::new(),
        }
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn local_candidates(&self) -> &[String] {
        &self.local_candidates
    }

    pub fn remote_candidates(&self) -> &[String] {
        &self.remote_candidates
    }

    pub fn handle(&mut self, event: PeerEvent) -> Vec<PeerAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        match event {
            PeerEvent::NegotiationNeeded => {
                if self.role != PeerRole::Offerer || self.offer_requested {
                    return Vec::new();
                }
                self.offer_requested = true;
                self.state = PeerState::Negotiating;
                vec![PeerAction::CreateOffer]
            }
            PeerEvent::LocalDescriptionSet => {
                self.local_description_set = true;
                if self.state == PeerState::New {
                    self.state = PeerState::Negotiating;
                }
                let mut actions = Vec::new();
                if let (Some(timeout), false) = (self.gather_timeout, self.gathering_complete) {
                    actions.push(PeerAction::ArmGatherTimeout(timeout));
                }
                actions.extend(self.try_exchange());
                actions
            }
            PeerEvent::IceCandidate(Some(address)) => {
                self.local_candidates.push(address);
                Vec::new()
            }
            PeerEvent::IceCandidate(None) | PeerEvent::GatherTimeout => {
                self.gathering_complete = true;
                self.try_exchange()
            }
            PeerEvent::Exchanged(remote) => {
                self.remote_candidates = remote;
                Vec::new()
            }
            PeerEvent::IceConnection(LinkState::Checking) => {
                if self.state == PeerState::Connected || self.watchdog_armed {
                    return Vec::new();
                }
                self.watchdog_armed = true;
                vec![PeerAction::ArmWatchdog(self.checking_timeout)]
            }
            PeerEvent::IceConnection(LinkState::Connected | LinkState::Completed)
            | PeerEvent::Connection(LinkState::Connected) => {
                self.state = PeerState::Connected;
                if self.watchdog_armed {
                    self.watchdog_armed = false;
                    vec![PeerAction::DisarmWatchdog]
                } else {
                    Vec::new()
                }
            }
            PeerEvent::IceConnection(
                link @ (LinkState::Disconnected | LinkState::Failed | LinkState::Closed),
            ) => self.fail(Origin::Remote, NegotiationError::Ice(link), terminal_for(link)),
            PeerEvent::Connection(
                link @ (LinkState::Disconnected | LinkState::Failed | LinkState::Closed),
            ) => self.fail(
                Origin::Remote,
                NegotiationError::Connection(link),
                terminal_for(link),
            ),
            PeerEvent::IceConnection(_) | PeerEvent::Connection(_) | PeerEvent::Signalling(_) => {
                Vec::new()
            }
            PeerEvent::WatchdogExpired => {
                if !self.watchdog_armed || self.state == PeerState::Connected {
                    return Vec::new();
                }
                // the timer already fired; nothing left to disarm
                self.watchdog_armed = false;
                self.fail(
                    Origin::Local,
                    NegotiationError::CheckingTimeout(self.checking_timeout),
                    PeerState::Failed,
                )
            }
            PeerEvent::LocalFailure(kind) => self.fail(Origin::Local, kind, PeerState::Failed),
            PeerEvent::Cancelled => {
                // checking in progress: the watchdog decides
                if self.watchdog_armed {
                    return Vec::new();
                }
                self.state = PeerState::Closed;
                vec![PeerAction::Close]
            }
        }
    }

    fn try_exchange(&mut self) -> Vec<PeerAction> {
        if self.role != PeerRole::Offerer
            || !self.local_description_set
            || !self.gathering_complete
            || self.exchange_started
        {
            return Vec::new();
        }
        self.exchange_started = true;
        vec![PeerAction::ExchangeOffer]
    }

    fn fail(&mut self, origin: Origin, kind: NegotiationError, next: PeerState) -> Vec<PeerAction> {
        self.state = next;
        let mut actions = Vec::with_capacity(3);
        if self.watchdog_armed {
            self.watchdog_armed = false;
            actions.push(PeerAction::DisarmWatchdog);
        }
        actions.push(PeerAction::Report(PeerConnectionError { origin, kind }));
        actions.push(PeerAction::Close);
        actions
    }
}

fn terminal_for(link: LinkState) -> PeerState {
    match link {
        LinkState::Disconnected => PeerState::Disconnected,
        LinkState::Closed => PeerState::Closed,
        _ => PeerState::Failed,
    }
}

pub(crate) fn build_api(setting: SettingEngine) -> Result<API, TransportError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(to_setup_error)?;

    let mut registry = Registry::new();
    registry =
        register_default_interceptors(registry, &mut media_engine).map_err(to_setup_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub(crate) async fn new_peer_connection(
    config: &WebRtcConfig,
    ice: &IceConfiguration,
) -> Result<Arc<RTCPeerConnection>, TransportError> {
    let api = build_api(config.setting_engine())?;
    let pc = api
        .new_peer_connection(ice.to_rtc())
        .await
        .map_err(to_setup_error)?;
    Ok(Arc::new(pc))
}

pub(crate) struct PeerOptions {
    pub role: PeerRole,
    pub session_id: String,
    pub checking_timeout: Duration,
    pub gather_timeout: Option<Duration>,
    pub bearer_token: Option<String>,
    pub exchange: Option<Arc<dyn AnswerOffer>>,
}

impl PeerOptions {
    pub fn from_config(role: PeerRole, session_id: impl Into<String>, config: &WebRtcConfig) -> Self {
        Self {
            role,
            session_id: session_id.into(),
            checking_timeout: config.checking_timeout,
            gather_timeout: config.ice_gather_timeout,
            bearer_token: config.bearer_token.clone(),
            exchange: None,
        }
    }

    pub fn with_exchange(mut self, exchange: Arc<dyn AnswerOffer>) -> Self {
        self.exchange = Some(exchange);
        self
    }
}

/// Handle to a running driver task.
pub(crate) struct PeerHandle {
    pub(crate) pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    state: watch::Receiver<PeerState>,
    machine: Arc<Mutex<PeerMachine>>,
    cancel: CancellationToken,
}

impl PeerHandle {
    /// Registers the peer-connection callbacks and starts the driver.
    pub(crate) fn spawn(
        pc: Arc<RTCPeerConnection>,
        options: PeerOptions,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<PeerConnectionError>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(PeerState::New);
        let machine = Arc::new(Mutex::new(PeerMachine::new(
            options.role,
            options.checking_timeout,
            options.gather_timeout,
        )));

        register_callbacks(&pc, &events_tx);

        let driver = Driver {
            machine: machine.clone(),
            pc: pc.clone(),
            events_tx: events_tx.clone(),
            errors_tx,
            state_tx,
            options,
            cancel: cancel.clone(),
        };
        tokio::spawn(driver.run(events_rx));

        let handle = Self {
            pc,
            events: events_tx,
            state: state_rx,
            machine,
            cancel,
        };
        (handle, errors_rx)
    }

    pub(crate) fn notify(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn state(&self) -> PeerState {
        *self.state.borrow()
    }

    pub(crate) fn local_addresses(&self) -> Vec<String> {
        self.machine.lock().local_candidates().to_vec()
    }

    pub(crate) fn remote_addresses(&self) -> Vec<String> {
        self.machine.lock().remote_candidates().to_vec()
    }

    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        if let Err(err) = self.pc.close().await {
            tracing::debug!(target = "webrtc", error = %err, "peer connection close failed");
        }
    }
}

fn register_callbacks(pc: &RTCPeerConnection, events: &mpsc::UnboundedSender<PeerEvent>) {
    let tx = events.clone();
    pc.on_negotiation_needed(Box::new(move || {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::NegotiationNeeded);
        })
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let address = candidate.map(|c| candidate_address(&c.address, c.port));
            let _ = tx.send(PeerEvent::IceCandidate(address));
        })
    }));

    let tx = events.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::IceConnection(state.into()));
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::Connection(state.into()));
        })
    }));

    let tx = events.clone();
    pc.on_signaling_state_change(Box::new(move |state: RTCSignalingState| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::Signalling(state.to_string()));
        })
    }));
}

fn candidate_address(address: &str, port: u16) -> String {
    match address.parse::<IpAddr>() {
        Ok(ip) => SocketAddr::new(ip, port).to_string(),
        Err(_) => format!("{address}:{port}"),
    }
}

struct Driver {
    machine: Arc<Mutex<PeerMachine>>,
    pc: Arc<RTCPeerConnection>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    errors_tx: mpsc::UnboundedSender<PeerConnectionError>,
    state_tx: watch::Sender<PeerState>,
    options: PeerOptions,
    cancel: CancellationToken,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<PeerEvent>) {
        let mut watchdog: Option<Pin<Box<Sleep>>> = None;
        let mut gather: Option<Pin<Box<Sleep>>> = None;
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        let mut cancel_seen = false;

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    PeerEvent::Cancelled
                }
                _ = deadline(&mut watchdog) => {
                    watchdog = None;
                    PeerEvent::WatchdogExpired
                }
                _ = deadline(&mut gather) => {
                    gather = None;
                    PeerEvent::GatherTimeout
                }
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            tracing::trace!(target = "webrtc", session_id = %self.options.session_id, event = ?event, "peer event");

            let actions = self.machine.lock().handle(event);
            for action in actions {
                match action {
                    PeerAction::CreateOffer => tasks.push(tokio::spawn(create_offer(
                        self.pc.clone(),
                        self.events_tx.clone(),
                    ))),
                    PeerAction::ExchangeOffer => tasks.push(tokio::spawn(exchange_offer(
                        self.pc.clone(),
                        self.events_tx.clone(),
                        self.options.session_id.clone(),
                        self.options.bearer_token.clone(),
                        self.options.exchange.clone(),
                    ))),
                    PeerAction::ArmWatchdog(after) => watchdog = Some(Box::pin(sleep(after))),
                    PeerAction::DisarmWatchdog => watchdog = None,
                    PeerAction::ArmGatherTimeout(after) => gather = Some(Box::pin(sleep(after))),
                    PeerAction::Report(err) => {
                        tracing::warn!(target = "webrtc", session_id = %self.options.session_id, error = %err, "peer connection failed");
                        let _ = self.errors_tx.send(err);
                    }
                    PeerAction::Close => {
                        if let Err(err) = self.pc.close().await {
                            tracing::debug!(target = "webrtc", error = %err, "peer connection close failed");
                        }
                    }
                }
            }

            let state = self.machine.lock().state();
            self.state_tx.send_if_modified(|current| {
                let changed = *current != state;
                *current = state;
                changed
            });
            if state.is_terminal() {
                break;
            }
        }

        for task in tasks {
            task.abort();
        }
        tracing::debug!(target = "webrtc", session_id = %self.options.session_id, state = ?self.machine.lock().state(), "peer driver finished");
    }
}

fn deadline(slot: &mut Option<Pin<Box<Sleep>>>) -> impl Future<Output = ()> + '_ {
    async move {
        match slot {
            Some(sleep) => sleep.as_mut().await,
            None => std::future::pending().await,
        }
    }
}

async fn create_offer(pc: Arc<RTCPeerConnection>, events: mpsc::UnboundedSender<PeerEvent>) {
    let event = match pc.create_offer(None).await {
        Ok(offer) => match pc.set_local_description(offer).await {
            Ok(()) => PeerEvent::LocalDescriptionSet,
            Err(err) => PeerEvent::LocalFailure(NegotiationError::SetLocalDescription(err.to_string())),
        },
        Err(err) => PeerEvent::LocalFailure(NegotiationError::CreateOffer(err.to_string())),
    };
    let _ = events.send(event);
}

async fn exchange_offer(
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<PeerEvent>,
    session_id: String,
    bearer_token: Option<String>,
    exchange: Option<Arc<dyn AnswerOffer>>,
) {
    let event = match run_exchange(&pc, &session_id, bearer_token.as_deref(), exchange).await {
        Ok(remote) => PeerEvent::Exchanged(remote),
        Err(kind) => PeerEvent::LocalFailure(kind),
    };
    let _ = events.send(event);
}

async fn run_exchange(
    pc: &RTCPeerConnection,
    session_id: &str,
    bearer_token: Option<&str>,
    exchange: Option<Arc<dyn AnswerOffer>>,
) -> Result<Vec<String>, NegotiationError> {
    let exchange =
        exchange.ok_or_else(|| NegotiationError::Exchange("no exchange callback".into()))?;
    let local = pc
        .local_description()
        .await
        .ok_or_else(|| NegotiationError::Exchange("missing local description".into()))?;
    let mut offer = Offer::from_rtc(&local);
    if let Some(token) = bearer_token {
        offer = offer.with_bearer_token(token);
    }
    tracing::debug!(target = "webrtc", session_id, "exchanging offer");
    let answer = exchange
        .answer_offer(session_id, offer)
        .await
        .map_err(|err| NegotiationError::Exchange(err.to_string()))?;
    let remote = answer.candidate_addresses();
    let description = answer
        .to_rtc()
        .map_err(|err| NegotiationError::SetRemoteDescription(err.to_string()))?;
    pc.set_remote_description(description)
        .await
        .map_err(|err| NegotiationError::SetRemoteDescription(err.to_string()))?;
    Ok(remote)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::sdp::Answer;

    fn offerer() -> PeerMachine {
        PeerMachine::new(PeerRole::Offerer, Duration::from_secs(3), None)
    }

    #[test_timeout::timeout]
    fn offer_is_created_once_and_exchanged_after_gathering() {
        let mut machine = offerer();
        assert_eq!(machine.handle(PeerEvent::NegotiationNeeded), vec![PeerAction::CreateOffer]);
        assert!(machine.handle(PeerEvent::NegotiationNeeded).is_empty());
        assert_eq!(machine.state(), PeerState::Negotiating);

        assert!(machine.handle(PeerEvent::LocalDescriptionSet).is_empty());
        assert!(machine
            .handle(PeerEvent::IceCandidate(Some("10.0.0.1:5000".into())))
            .is_empty());
        assert_eq!(
            machine.handle(PeerEvent::IceCandidate(None)),
            vec![PeerAction::ExchangeOffer]
        );
        assert!(machine.handle(PeerEvent::IceCandidate(None)).is_empty());
        assert!(machine.handle(PeerEvent::GatherTimeout).is_empty());
        assert_eq!(machine.local_candidates(), ["10.0.0.1:5000".to_string()]);
    }

    #[test_timeout::timeout]
    fn gathering_complete_before_local_description_still_exchanges() {
        let mut machine = offerer();
        machine.handle(PeerEvent::NegotiationNeeded);
        assert!(machine.handle(PeerEvent::IceCandidate(None)).is_empty());
        assert_eq!(
            machine.handle(PeerEvent::LocalDescriptionSet),
            vec![PeerAction::ExchangeOffer]
        );
    }

    #[test_timeout::timeout]
    fn gather_timeout_exchanges_partial_candidates() {
        let mut machine =
            PeerMachine::new(PeerRole::Offerer, Duration::from_secs(3), Some(Duration::from_millis(200)));
        machine.handle(PeerEvent::NegotiationNeeded);
        assert_eq!(
            machine.handle(PeerEvent::LocalDescriptionSet),
            vec![PeerAction::ArmGatherTimeout(Duration::from_millis(200))]
        );
        assert_eq!(machine.handle(PeerEvent::GatherTimeout), vec![PeerAction::ExchangeOffer]);
        assert!(machine.handle(PeerEvent::IceCandidate(None)).is_empty());
    }

    #[test_timeout::timeout]
    fn checking_without_connect_times_out() {
        let mut machine = offerer();
        machine.handle(PeerEvent::NegotiationNeeded);
        assert_eq!(
            machine.handle(PeerEvent::IceConnection(LinkState::Checking)),
            vec![PeerAction::ArmWatchdog(Duration::from_secs(3))]
        );
        let actions = machine.handle(PeerEvent::WatchdogExpired);
        assert_eq!(
            actions,
            vec![
                PeerAction::Report(PeerConnectionError::local(NegotiationError::CheckingTimeout(
                    Duration::from_secs(3)
                ))),
                PeerAction::Close,
            ]
        );
        assert_eq!(machine.state(), PeerState::Failed);
        assert!(machine
            .handle(PeerEvent::IceConnection(LinkState::Failed))
            .is_empty());
    }

    #[test_timeout::timeout]
    fn connected_disarms_the_watchdog() {
        let mut machine = offerer();
        machine.handle(PeerEvent::IceConnection(LinkState::Checking));
        assert_eq!(
            machine.handle(PeerEvent::IceConnection(LinkState::Connected)),
            vec![PeerAction::DisarmWatchdog]
        );
        assert!(machine.handle(PeerEvent::WatchdogExpired).is_empty());
        assert_eq!(machine.state(), PeerState::Connected);
    }

    #[test_timeout::timeout]
    fn remote_disconnect_reports_once() {
        let mut machine = offerer();
        machine.handle(PeerEvent::Connection(LinkState::Connected));
        let actions = machine.handle(PeerEvent::Connection(LinkState::Disconnected));
        assert_eq!(
            actions,
            vec![
                PeerAction::Report(PeerConnectionError::remote(NegotiationError::Connection(
                    LinkState::Disconnected
                ))),
                PeerAction::Close,
            ]
        );
        assert_eq!(machine.state(), PeerState::Disconnected);
        assert!(machine
            .handle(PeerEvent::IceConnection(LinkState::Closed))
            .is_empty());
    }

    #[test_timeout::timeout]
    fn cancellation_during_checking_defers_to_watchdog() {
        let mut machine = offerer();
        machine.handle(PeerEvent::IceConnection(LinkState::Checking));
        assert!(machine.handle(PeerEvent::Cancelled).is_empty());
        let actions = machine.handle(PeerEvent::WatchdogExpired);
        assert!(matches!(actions.first(), Some(PeerAction::Report(err)) if err.is_local()));

        let mut idle = offerer();
        assert_eq!(idle.handle(PeerEvent::Cancelled), vec![PeerAction::Close]);
        assert_eq!(idle.state(), PeerState::Closed);
    }

    #[test_timeout::timeout]
    fn answerer_never_offers() {
        let mut machine = PeerMachine::new(PeerRole::Answerer, Duration::from_secs(3), None);
        assert!(machine.handle(PeerEvent::NegotiationNeeded).is_empty());
        machine.handle(PeerEvent::LocalDescriptionSet);
        assert!(machine.handle(PeerEvent::IceCandidate(None)).is_empty());
        assert_eq!(machine.state(), PeerState::Negotiating);
    }

    #[test_timeout::timeout]
    fn local_failure_is_tagged_local() {
        let mut machine = offerer();
        machine.handle(PeerEvent::NegotiationNeeded);
        let actions = machine.handle(PeerEvent::LocalFailure(NegotiationError::Exchange(
            "broker went away".into(),
        )));
        assert!(matches!(&actions[0], PeerAction::Report(err) if err.is_local()));
        assert_eq!(machine.state(), PeerState::Failed);
    }

    /// Counts offers and never answers, leaving the exchange in flight.
    #[derive(Default)]
    struct CountingExchange {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AnswerOffer for CountingExchange {
        async fn answer_offer(&self, _session_id: &str, _offer: Offer) -> Result<Answer, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    async fn driver_options(
        checking_timeout: Duration,
        gather_timeout: Option<Duration>,
        exchange: Option<Arc<dyn AnswerOffer>>,
    ) -> (Arc<RTCPeerConnection>, PeerOptions) {
        let config = WebRtcConfig::localhost();
        let pc = new_peer_connection(&config, &config.ice).await.expect("peer connection");
        let options = PeerOptions {
            role: PeerRole::Offerer,
            session_id: "driver-test".into(),
            checking_timeout,
            gather_timeout,
            bearer_token: None,
            exchange,
        };
        (pc, options)
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn driver_reports_stuck_checking_once() {
        let (pc, options) = driver_options(Duration::from_millis(50), None, None).await;
        let (peer, mut errors) = PeerHandle::spawn(pc, options, CancellationToken::new());

        peer.notify(PeerEvent::IceConnection(LinkState::Checking));
        peer.notify(PeerEvent::IceConnection(LinkState::Checking));

        let err = errors.recv().await.expect("checking timeout reported");
        assert_eq!(
            err,
            PeerConnectionError::local(NegotiationError::CheckingTimeout(Duration::from_millis(50)))
        );
        assert!(errors.recv().await.is_none(), "driver stops after one report");
        assert_eq!(peer.state(), PeerState::Failed);
    }

    #[test_timeout::tokio_timeout_test(20)]
    async fn driver_exchanges_once_when_gathering_ends_twice() {
        let exchange = Arc::new(CountingExchange::default());
        let answerer: Arc<dyn AnswerOffer> = exchange.clone();
        let (pc, options) = driver_options(
            Duration::from_secs(3),
            Some(Duration::from_millis(50)),
            Some(answerer),
        )
        .await;
        let (peer, _errors) = PeerHandle::spawn(pc.clone(), options, CancellationToken::new());

        pc.create_data_channel("http", None).await.expect("data channel");
        peer.notify(PeerEvent::NegotiationNeeded);
        while exchange.calls.load(Ordering::SeqCst) == 0 {
            sleep(Duration::from_millis(10)).await;
        }

        peer.notify(PeerEvent::IceCandidate(None));
        peer.notify(PeerEvent::GatherTimeout);
        sleep(Duration::from_millis(200)).await;

        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
        assert_eq!(peer.state(), PeerState::Negotiating);
        peer.close().await;
    }
}
