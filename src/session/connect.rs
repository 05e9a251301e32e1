//! The connect routine: everything between "connecting" and a remote answer.
//!
//! Runs as a spawned task so the actor keeps serving commands and peer
//! events while it waits on the network. Dropping the future (abort) stops
//! any local track it has acquired.

use crate::config::CallConfig;
use crate::peer::negotiator::Negotiator;
use crate::peer::transport::{DataChannel, LocalTrack, PeerHandlers};
use crate::peer::types::{MediaKind, SenderId, SessionDescription};
use crate::services::{CallContext, MintRequest, SignalingExchange};
use crate::session::Services;
use anyhow::{anyhow, Context};
use std::sync::Arc;
use uuid::Uuid;

/// Локальные треки сессии; останавливаются при drop
#[derive(Debug, Default)]
pub(crate) struct LocalTracks {
    pub audio: Option<Arc<dyn LocalTrack>>,
    pub video: Option<Arc<dyn LocalTrack>>,
}

impl LocalTracks {
    pub fn stop_all(&mut self) {
        for track in self.audio.take().into_iter().chain(self.video.take()) {
            track.stop();
        }
    }
}

impl Drop for LocalTracks {
    fn drop(&mut self) {
        self.stop_all();
    }
}

#[derive(Clone)]
pub(crate) struct ConnectEnv {
    pub negotiator: Arc<Negotiator>,
    pub services: Arc<Services>,
    pub config: Arc<CallConfig>,
}

#[derive(Debug)]
pub(crate) struct ConnectRequest {
    pub session_id: Uuid,
    pub with_video: bool,
    /// `None` при первом подключении: настройки и минт читаются заново
    pub context: Option<Arc<CallContext>>,
}

pub(crate) struct ConnectReport {
    pub context: Arc<CallContext>,
    pub tracks: LocalTracks,
    pub video_sender: SenderId,
    pub data_channel: Arc<dyn DataChannel>,
}

/// `on_prepared` получает новый контекст сразу после минта, до обмена offer/answer
pub(crate) async fn connect(
    env: &ConnectEnv,
    request: ConnectRequest,
    handlers: PeerHandlers,
    on_prepared: impl FnOnce(Arc<CallContext>),
) -> anyhow::Result<ConnectReport> {
    let context = match request.context.clone() {
        Some(context) => {
            // переподключение всегда через новое соединение
            env.negotiator.close().await;
            context
        }
        None => {
            let context = prepare(env, &request).await?;
            on_prepared(Arc::clone(&context));
            context
        }
    };

    let (peer, _) = env
        .negotiator
        .ensure_peer_connection(&context.peer_config, handlers)
        .await
        .context("create peer connection")?;

    let mut tracks = LocalTracks::default();
    let audio = env
        .services
        .media
        .acquire(MediaKind::Audio)
        .await
        .context("acquire microphone")?;
    tracks.audio = Some(Arc::clone(&audio));
    peer.add_track(audio).await.context("add audio track")?;

    // sender для видео есть всегда, чтобы toggle_video не требовал renegotiation
    let video_sender = peer
        .add_transceiver(MediaKind::Video)
        .await
        .context("add video transceiver")?;
    if request.with_video {
        let video = env
            .services
            .media
            .acquire(MediaKind::Video)
            .await
            .context("acquire camera")?;
        tracks.video = Some(Arc::clone(&video));
        peer.replace_track(video_sender, Some(video))
            .await
            .context("attach video track")?;
    }

    let data_channel = peer
        .create_data_channel(&env.config.data_channel_label)
        .await
        .context("create data channel")?;

    env.negotiator.make_offer().await.context("create offer")?;
    peer.wait_for_ice_gathering(env.config.ice_gathering_timeout)
        .await;
    let offer = peer
        .local_description()
        .await
        .ok_or_else(|| anyhow!("local description is missing after offer"))?;

    let answer = env
        .services
        .signaling
        .exchange(&context.model, &context.secret, &offer.sdp)
        .await
        .context("signaling exchange")?;
    env.negotiator
        .handle_remote_description(SessionDescription::answer(answer))
        .await
        .context("apply remote answer")?;

    log::info!("Offer/answer exchange done for session {}", request.session_id);
    Ok(ConnectReport {
        context,
        tracks,
        video_sender,
        data_channel,
    })
}

/// Настройки и минт; только для первого подключения
async fn prepare(env: &ConnectEnv, request: &ConnectRequest) -> anyhow::Result<Arc<CallContext>> {
    let settings = env
        .services
        .settings
        .fetch_settings()
        .await
        .context("fetch settings")?;
    let model = settings
        .model
        .clone()
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| env.config.default_model.clone());

    let mint = env
        .services
        .minter
        .mint(&MintRequest {
            session_id: request.session_id,
            model: model.clone(),
        })
        .await
        .context("mint ephemeral key")?;
    Ok(Arc::new(mint.into_context(&settings, &env.config)?))
}

/// Повторное согласование на живом соединении (negotiationneeded)
pub(crate) async fn renegotiate(
    negotiator: &Negotiator,
    signaling: &dyn SignalingExchange,
    context: &CallContext,
) -> anyhow::Result<()> {
    let offer = negotiator.make_offer().await.context("create offer")?;
    let answer = signaling
        .exchange(&context.model, &context.secret, &offer.sdp)
        .await
        .context("signaling exchange")?;
    negotiator
        .handle_remote_description(SessionDescription::answer(answer))
        .await
        .context("apply remote answer")?;
    Ok(())
}
