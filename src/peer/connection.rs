use crate::error::PeerError;
use crate::peer::data_channel::attach_dc;
use crate::peer::media::SampleTrack;
use crate::peer::transport::{
    DataChannel, DataChannelEvent, Dispatcher, LocalTrack, PeerFactory, PeerTransport,
};
use crate::peer::types::{
    IceCandidate, IceServer, MediaKind, PeerConfig, PeerState, SdpType, SenderId,
    SessionDescription, SignalingState, TrackInfo, TransportStats,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::stats::StatsReportType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Фабрика peer connection поверх `webrtc` (Opus/VP8 + стандартные интерсепторы)
pub struct WebRtcPeerFactory {
    api: API,
}

impl fmt::Debug for WebRtcPeerFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebRtcPeerFactory").finish_non_exhaustive()
    }
}

impl WebRtcPeerFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerFactory for WebRtcPeerFactory {
    async fn create(
        &self,
        config: &PeerConfig,
        dispatcher: Dispatcher,
    ) -> Result<Arc<dyn PeerTransport>, PeerError> {
        let pc = Arc::new(self.api.new_peer_connection(rtc_config(config)).await?);
        attach_handlers(&pc, &dispatcher);
        log::info!(
            "Peer connection created with {} ICE servers",
            config.ice_servers.len()
        );
        Ok(Arc::new(RtcPeer {
            pc,
            dispatcher,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(config: &PeerConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: config.ice_servers.iter().map(rtc_ice_server).collect(),
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

fn rtc_ice_server(server: &IceServer) -> RTCIceServer {
    RTCIceServer {
        urls: server.urls.clone(),
        username: server.username.clone().unwrap_or_default(),
        credential: server.credential.clone().unwrap_or_default(),
        ..Default::default()
    }
}

/// Все колбэки `RTCPeerConnection` уходят в диспетчер
fn attach_handlers(pc: &Arc<RTCPeerConnection>, dispatcher: &Dispatcher) {
    let d = dispatcher.clone();
    pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
        log::info!("Peer connection state changed to: {:?}", st);
        if let Some(state) = map_peer_state(st) {
            d.connection_state(state);
        }
        Box::pin(async {})
    }));

    let d = dispatcher.clone();
    pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
        match cand {
            Some(c) => match c.to_json() {
                Ok(init) => d.ice_candidate(Some(IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                })),
                Err(e) => d.ice_error(format!("failed to serialize local candidate: {e}")),
            },
            // cand == None означает конец сбора
            None => d.ice_candidate(None),
        }
        Box::pin(async {})
    }));

    let d = dispatcher.clone();
    pc.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        log::debug!("ICE connection state changed to: {:?}", state);
        if state == RTCIceConnectionState::Failed {
            d.ice_error("ICE connection failed".to_string());
        }
        Box::pin(async {})
    }));

    let d = dispatcher.clone();
    pc.on_negotiation_needed(Box::new(move || {
        d.negotiation_needed();
        Box::pin(async {})
    }));

    let d = dispatcher.clone();
    pc.on_track(Box::new(
        move |track: Arc<TrackRemote>, _receiver: Arc<RTCRtpReceiver>, _t: Arc<RTCRtpTransceiver>| {
            let kind = match track.kind() {
                RTPCodecType::Video => MediaKind::Video,
                _ => MediaKind::Audio,
            };
            d.track(TrackInfo {
                id: track.id(),
                kind,
            });
            Box::pin(async {})
        },
    ));

    let d = dispatcher.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let channel = attach_dc(&dc, d.clone());
        d.data_channel(DataChannelEvent::Announced(channel));
        Box::pin(async {})
    }));
}

fn map_peer_state(st: RTCPeerConnectionState) -> Option<PeerState> {
    match st {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

fn map_signaling_state(st: RTCSignalingState) -> SignalingState {
    match st {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        _ => SignalingState::Stable,
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let rtc = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpType::Rollback => {
            return Err(PeerError::InvalidDescription(
                "rollback is applied through PeerTransport::rollback".into(),
            ))
        }
    };
    Ok(rtc)
}

fn from_rtc(desc: &RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => {
            return Err(PeerError::InvalidDescription(format!(
                "unexpected sdp type {other:?}"
            )))
        }
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp.clone(),
    })
}

/// Преобразует локальный трек в `TrackLocal`; поддерживается только `SampleTrack`
fn rtc_track(track: &dyn LocalTrack) -> Result<Arc<dyn TrackLocal + Send + Sync>, PeerError> {
    track
        .as_any()
        .downcast_ref::<SampleTrack>()
        .map(SampleTrack::rtc_track)
        .ok_or_else(|| PeerError::UnsupportedTrack(track.id().to_string()))
}

fn codec_type(kind: MediaKind) -> RTPCodecType {
    match kind {
        MediaKind::Audio => RTPCodecType::Audio,
        MediaKind::Video => RTPCodecType::Video,
    }
}

/// `RTCPeerConnection` за интерфейсом `PeerTransport`
pub struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    dispatcher: Dispatcher,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

impl fmt::Debug for RtcPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcPeer")
            .field("connection_state", &self.pc.connection_state())
            .field("signaling_state", &self.pc.signaling_state())
            .finish()
    }
}

impl RtcPeer {
    async fn register_sender(&self, sender: Arc<RTCRtpSender>) -> SenderId {
        // RTCP нужно вычитывать, иначе интерсепторы не работают
        let reader = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while reader.read(&mut buf).await.is_ok() {}
        });

        let mut senders = self.senders.lock().await;
        senders.push(sender);
        SenderId(senders.len() - 1)
    }
}

#[async_trait]
impl PeerTransport for RtcPeer {
    fn connection_state(&self) -> PeerState {
        map_peer_state(self.pc.connection_state()).unwrap_or(PeerState::New)
    }

    fn signaling_state(&self) -> SignalingState {
        map_signaling_state(self.pc.signaling_state())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc(&offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc(&answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), PeerError> {
        let rollback: RTCSessionDescription =
            serde_json::from_value(serde_json::json!({ "type": "rollback", "sdp": "" }))
                .map_err(|e| PeerError::InvalidDescription(e.to_string()))?;
        self.pc.set_local_description(rollback).await?;
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.local_description().await?;
        from_rtc(&desc).ok()
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await?;
        Ok(())
    }

    async fn wait_for_ice_gathering(&self, timeout: Duration) {
        let mut done = self.pc.gathering_complete_promise().await;
        if tokio::time::timeout(timeout, done.recv()).await.is_err() {
            log::debug!(
                "ICE gathering still running after {} ms, sending offer as is",
                timeout.as_millis()
            );
        }
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError> {
        let dc = self
            .pc
            .create_data_channel(label, Some(RTCDataChannelInit::default()))
            .await?;
        Ok(attach_dc(&dc, self.dispatcher.clone()))
    }

    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<SenderId, PeerError> {
        let sender = self.pc.add_track(rtc_track(track.as_ref())?).await?;
        Ok(self.register_sender(sender).await)
    }

    async fn add_transceiver(&self, kind: MediaKind) -> Result<SenderId, PeerError> {
        let transceiver = self
            .pc
            .add_transceiver_from_kind(
                codec_type(kind),
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendrecv,
                    send_encodings: vec![],
                }),
            )
            .await?;
        let sender = transceiver.sender().await;
        Ok(self.register_sender(sender).await)
    }

    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<Arc<dyn LocalTrack>>,
    ) -> Result<(), PeerError> {
        let rtp_sender = self
            .senders
            .lock()
            .await
            .get(sender.0)
            .cloned()
            .ok_or(PeerError::UnknownSender(sender.0))?;
        let rtc = match track {
            Some(t) => Some(rtc_track(t.as_ref())?),
            None => None,
        };
        rtp_sender.replace_track(rtc).await?;
        Ok(())
    }

    /// Быстрый снимок getStats → выбранная пара
    async fn transport_stats(&self) -> Result<TransportStats, PeerError> {
        let report = self.pc.get_stats().await;
        let mut stats = TransportStats::default();
        for (_, v) in report.reports {
            if let StatsReportType::CandidatePair(pair) = v {
                if pair.nominated {
                    stats.bytes_sent = pair.bytes_sent as u64;
                    stats.bytes_received = pair.bytes_received as u64;
                }
            }
        }
        Ok(stats)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await?;
        Ok(())
    }
}
