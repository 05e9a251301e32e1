//! In-memory fakes for the peer stack and the external collaborators.

use crate::error::PeerError;
use crate::peer::media::MediaDevices;
use crate::peer::transport::{
    DataChannel, DataChannelEvent, Dispatcher, LocalTrack, PeerFactory, PeerTransport,
};
use crate::peer::types::{
    IceCandidate, MediaKind, PeerConfig, PeerState, SdpType, SenderId, SessionDescription,
    SignalingState, TransportStats,
};
use crate::services::{
    CredentialMinter, EphemeralSecret, IdentityProvider, MetricsStore, MintRequest, MintResponse,
    QuotaStore, Settings, SettingsStore, SignalingExchange, UserId,
};
use crate::session::metrics::{MetricUpdate, SessionStart};
use crate::session::quota::{QuotaLimits, UsageDelta};
use anyhow::anyhow;
use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{n} 1 udp 2130706431 10.0.0.{n} 5000{n} typ host"),
        sdp_mid: Some("0".into()),
        sdp_mline_index: Some(0),
        username_fragment: None,
    }
}

/// Что делает fake peer после применения удалённого answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnswerBehavior {
    #[default]
    Connect,
    Fail,
    Nothing,
}

#[derive(Debug, Default)]
struct Behavior {
    fail_create: AtomicBool,
    fail_offers: AtomicBool,
    fail_candidates: AtomicBool,
    on_answer: Mutex<AnswerBehavior>,
    stats: Mutex<TransportStats>,
}

#[derive(Debug, Default)]
pub struct FakePeerFactory {
    behavior: Arc<Behavior>,
    peers: Mutex<Vec<Arc<FakePeer>>>,
}

impl FakePeerFactory {
    pub fn created(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    pub fn peer(&self, index: usize) -> Arc<FakePeer> {
        Arc::clone(&self.peers.lock().unwrap()[index])
    }

    pub fn last_peer(&self) -> Arc<FakePeer> {
        let peers = self.peers.lock().unwrap();
        Arc::clone(peers.last().expect("no peer created"))
    }

    pub fn fail_create(&self, fail: bool) {
        self.behavior.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_offers(&self, fail: bool) {
        self.behavior.fail_offers.store(fail, Ordering::SeqCst);
    }

    pub fn fail_candidates(&self, fail: bool) {
        self.behavior.fail_candidates.store(fail, Ordering::SeqCst);
    }

    pub fn on_answer(&self, behavior: AnswerBehavior) {
        *self.behavior.on_answer.lock().unwrap() = behavior;
    }

    pub fn set_stats(&self, stats: TransportStats) {
        *self.behavior.stats.lock().unwrap() = stats;
    }
}

#[async_trait]
impl PeerFactory for FakePeerFactory {
    async fn create(
        &self,
        _config: &PeerConfig,
        dispatcher: Dispatcher,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        if self.behavior.fail_create.load(Ordering::SeqCst) {
            return Err(PeerError::Media("peer creation failed".into()));
        }
        let mut peers = self.peers.lock().unwrap();
        let peer = Arc::new(FakePeer {
            id: peers.len(),
            dispatcher,
            behavior: Arc::clone(&self.behavior),
            inner: Mutex::new(PeerInner::default()),
        });
        peers.push(Arc::clone(&peer));
        Ok(peer)
    }
}

#[derive(Debug)]
struct PeerInner {
    connection: PeerState,
    signaling: SignalingState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidates: Vec<IceCandidate>,
    senders: Vec<Option<String>>,
    channels: Vec<Arc<FakeDataChannel>>,
    offers: u32,
    rollbacks: u32,
    close_calls: u32,
}

impl Default for PeerInner {
    fn default() -> Self {
        Self {
            connection: PeerState::New,
            signaling: SignalingState::Stable,
            local: None,
            remote: None,
            candidates: Vec::new(),
            senders: Vec::new(),
            channels: Vec::new(),
            offers: 0,
            rollbacks: 0,
            close_calls: 0,
        }
    }
}

/// Peer connection с упрощённой машиной signaling состояний
#[derive(Debug)]
pub struct FakePeer {
    id: usize,
    dispatcher: Dispatcher,
    behavior: Arc<Behavior>,
    inner: Mutex<PeerInner>,
}

impl FakePeer {
    /// Меняет connectionState и сообщает об этом обработчикам
    pub fn emit_state(&self, state: PeerState) {
        self.inner.lock().unwrap().connection = state;
        self.dispatcher.connection_state(state);
    }

    /// Открывает все data channel'ы
    pub fn open_channels(&self) {
        let channels = self.inner.lock().unwrap().channels.clone();
        for channel in channels {
            channel.open.store(true, Ordering::SeqCst);
            self.dispatcher.data_channel(DataChannelEvent::Open {
                label: channel.label.clone(),
            });
        }
    }

    /// Сообщение от удалённой стороны
    pub fn deliver(&self, label: &str, text: &str) {
        self.dispatcher.data_channel(DataChannelEvent::Message {
            label: label.to_string(),
            text: text.to_string(),
        });
    }

    pub fn channel(&self, label: &str) -> Arc<FakeDataChannel> {
        let inner = self.inner.lock().unwrap();
        let channel = inner
            .channels
            .iter()
            .find(|c| c.label == label)
            .expect("no such data channel");
        Arc::clone(channel)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().connection == PeerState::Closed
    }

    pub fn close_calls(&self) -> u32 {
        self.inner.lock().unwrap().close_calls
    }

    /// Браузер просит пересогласовать соединение
    pub fn request_negotiation(&self) {
        self.dispatcher.negotiation_needed();
    }

    pub fn offers(&self) -> u32 {
        self.inner.lock().unwrap().offers
    }

    pub fn remote_sdp(&self) -> Option<String> {
        self.inner.lock().unwrap().remote.as_ref().map(|d| d.sdp.clone())
    }

    pub fn rollbacks(&self) -> u32 {
        self.inner.lock().unwrap().rollbacks
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.inner.lock().unwrap().candidates.clone()
    }

    /// Id трека на sender'е (None, если трека нет)
    pub fn sender_track(&self, sender: usize) -> Option<String> {
        self.inner.lock().unwrap().senders[sender].clone()
    }

    pub fn sender_count(&self) -> usize {
        self.inner.lock().unwrap().senders.len()
    }

    fn after_answer(&self) {
        let behavior = *self.behavior.on_answer.lock().unwrap();
        match behavior {
            // повторный answer (пересогласование) уже ничего не меняет
            AnswerBehavior::Connect if self.connection_state() == PeerState::Connected => {}
            AnswerBehavior::Connect => {
                self.emit_state(PeerState::Connected);
                self.open_channels();
            }
            AnswerBehavior::Fail => self.emit_state(PeerState::Failed),
            AnswerBehavior::Nothing => {}
        }
    }

    fn invalid(&self, action: &str, state: SignalingState) -> PeerError {
        PeerError::InvalidState(format!("peer #{}: {action} in {state:?}", self.id))
    }
}

#[async_trait]
impl PeerTransport for FakePeer {
    fn connection_state(&self) -> PeerState {
        self.inner.lock().unwrap().connection
    }

    fn signaling_state(&self) -> SignalingState {
        self.inner.lock().unwrap().signaling
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        if self.behavior.fail_offers.load(Ordering::SeqCst) {
            return Err(PeerError::Media("offer failed".into()));
        }
        let mut inner = self.inner.lock().unwrap();
        inner.offers += 1;
        Ok(SessionDescription::offer(format!(
            "v=0 offer {}-{}",
            self.id, inner.offers
        )))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let inner = self.inner.lock().unwrap();
        if inner.signaling != SignalingState::HaveRemoteOffer {
            return Err(self.invalid("create_answer", inner.signaling));
        }
        Ok(SessionDescription::answer(format!("v=0 answer {}", self.id)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.signaling = match (desc.kind, inner.signaling) {
            (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveLocalOffer,
            (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
            (_, state) => return Err(self.invalid("set_local_description", state)),
        };
        inner.local = Some(desc);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let is_answer = desc.kind == SdpType::Answer;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.signaling = match (desc.kind, inner.signaling) {
                (SdpType::Offer, SignalingState::Stable) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (_, state) => return Err(self.invalid("set_remote_description", state)),
            };
            inner.remote = Some(desc);
        }
        if is_answer {
            self.after_answer();
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.signaling != SignalingState::HaveLocalOffer {
            return Err(self.invalid("rollback", inner.signaling));
        }
        inner.signaling = SignalingState::Stable;
        inner.local = None;
        inner.rollbacks += 1;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.inner.lock().unwrap().local.clone()
    }

    async fn has_remote_description(&self) -> bool {
        self.inner.lock().unwrap().remote.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        if self.behavior.fail_candidates.load(Ordering::SeqCst) {
            return Err(PeerError::InvalidState("candidate rejected".into()));
        }
        self.inner.lock().unwrap().candidates.push(candidate);
        Ok(())
    }

    async fn wait_for_ice_gathering(&self, _timeout: Duration) {}

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        let channel = Arc::new(FakeDataChannel::new(label));
        self.inner
            .lock()
            .unwrap()
            .channels
            .push(Arc::clone(&channel));
        Ok(channel)
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<SenderId, PeerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.senders.push(Some(track.id().to_string()));
        Ok(SenderId(inner.senders.len() - 1))
    }

    async fn add_transceiver(&self, _kind: MediaKind) -> Result<SenderId, PeerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.senders.push(None);
        Ok(SenderId(inner.senders.len() - 1))
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<Arc<dyn LocalTrack>>,
    ) -> Result<(), PeerError> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .senders
            .get_mut(sender.0)
            .ok_or(PeerError::UnknownSender(sender.0))?;
        *slot = track.map(|t| t.id().to_string());
        Ok(())
    }

    async fn transport_stats(&self) -> Result<TransportStats, PeerError> {
        Ok(*self.behavior.stats.lock().unwrap())
    }

    async fn close(&self) -> Result<(), PeerError> {
        let mut inner = self.inner.lock().unwrap();
        inner.close_calls += 1;
        inner.connection = PeerState::Closed;
        inner.signaling = SignalingState::Closed;
        for channel in &inner.channels {
            channel.open.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeDataChannel {
    label: String,
    open: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl FakeDataChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DataChannel for FakeDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> Result<usize, PeerError> {
        if !self.is_open() {
            return Err(PeerError::Closed);
        }
        let len = text.len();
        self.sent.lock().unwrap().push(text);
        Ok(len)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    kind: MediaKind,
    stopped: AtomicBool,
}

impl LocalTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug, Default)]
pub struct FakeMedia {
    issued: Mutex<Vec<Arc<FakeTrack>>>,
}

impl FakeMedia {
    pub fn issued(&self) -> Vec<Arc<FakeTrack>> {
        self.issued.lock().unwrap().clone()
    }

    pub fn live(&self) -> Vec<Arc<FakeTrack>> {
        self.issued()
            .into_iter()
            .filter(|t| !t.is_stopped())
            .collect()
    }
}

#[async_trait]
impl MediaDevices for FakeMedia {
    async fn acquire(&self, kind: MediaKind) -> Result<Arc<dyn LocalTrack>, PeerError> {
        let mut issued = self.issued.lock().unwrap();
        let track = Arc::new(FakeTrack {
            id: format!("{kind:?}-{}", issued.len()).to_lowercase(),
            kind,
            stopped: AtomicBool::new(false),
        });
        issued.push(Arc::clone(&track));
        Ok(track)
    }
}

pub struct StaticIdentity(pub Option<UserId>);

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Option<UserId> {
        self.0.clone()
    }
}

pub struct StaticSettings(pub Settings);

#[async_trait]
impl SettingsStore for StaticSettings {
    async fn fetch_settings(&self) -> anyhow::Result<Settings> {
        Ok(self.0.clone())
    }
}

pub struct FakeMinter {
    pub response: Mutex<MintResponse>,
    pub requests: Mutex<Vec<MintRequest>>,
}

impl Default for FakeMinter {
    fn default() -> Self {
        Self {
            response: Mutex::new(MintResponse {
                version: 1,
                secret: Some(EphemeralSecret::new("ek_test")),
                ..MintResponse::default()
            }),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl CredentialMinter for FakeMinter {
    async fn mint(&self, request: &MintRequest) -> anyhow::Result<MintResponse> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.response.lock().unwrap().clone())
    }
}

#[derive(Default)]
pub struct FakeSignaling {
    fail: AtomicBool,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<Instant>>,
}

impl FakeSignaling {
    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Задержка ответа сервера
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalingExchange for FakeSignaling {
    async fn exchange(
        &self,
        _model: &str,
        secret: &EphemeralSecret,
        offer_sdp: &str,
    ) -> anyhow::Result<String> {
        self.calls.lock().unwrap().push(Instant::now());
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("signaling returned 503: upstream unavailable"));
        }
        assert!(!secret.is_empty());
        assert!(offer_sdp.starts_with("v=0 offer"));
        Ok("v=0 remote answer".to_string())
    }
}

pub struct MemoryQuota {
    pub limits: Mutex<QuotaLimits>,
    pub updates: Mutex<Vec<UsageDelta>>,
}

impl MemoryQuota {
    pub fn new(limits: QuotaLimits) -> Self {
        Self {
            limits: Mutex::new(limits),
            updates: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryQuota {
    async fn ensure_limits(&self, _user: &UserId) -> anyhow::Result<QuotaLimits> {
        Ok(*self.limits.lock().unwrap())
    }

    async fn update_limits(&self, _user: &UserId, delta: UsageDelta) -> anyhow::Result<QuotaLimits> {
        self.updates.lock().unwrap().push(delta);
        let mut limits = self.limits.lock().unwrap();
        limits.seconds_used_today += delta.seconds;
        Ok(*limits)
    }
}

#[derive(Default)]
pub struct MemoryMetrics {
    pub inserts: Mutex<Vec<SessionStart>>,
    pub updates: Mutex<Vec<(Uuid, MetricUpdate)>>,
}

#[async_trait]
impl MetricsStore for MemoryMetrics {
    async fn insert_metric(&self, start: &SessionStart) -> anyhow::Result<()> {
        self.inserts.lock().unwrap().push(start.clone());
        Ok(())
    }

    async fn update_metric(&self, session_id: Uuid, update: &MetricUpdate) -> anyhow::Result<()> {
        self.updates
            .lock()
            .unwrap()
            .push((session_id, update.clone()));
        Ok(())
    }
}
