//! Seam between the negotiator and a concrete WebRTC stack.
//!
//! The production implementation lives in [`crate::peer::connection`] and
//! wraps `webrtc::peer_connection::RTCPeerConnection`. Every callback of the
//! underlying connection is routed through a [`Dispatcher`], so handlers can be
//! swapped or removed on a live connection and detached entirely when the
//! negotiator closes it.

use crate::error::PeerError;
use crate::peer::types::{
    IceCandidate, MediaKind, PeerConfig, PeerState, SenderId, SessionDescription, SignalingState,
    TrackInfo, TransportStats,
};
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// Одно peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync + fmt::Debug {
    fn connection_state(&self) -> PeerState;
    fn signaling_state(&self) -> SignalingState;

    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    /// Откат локального offer (have-local-offer → stable)
    async fn rollback(&self) -> Result<(), PeerError>;
    async fn local_description(&self) -> Option<SessionDescription>;
    async fn has_remote_description(&self) -> bool;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;
    /// Ждём окончания сбора кандидатов, но не дольше `timeout`
    async fn wait_for_ice_gathering(&self, timeout: Duration);

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PeerError>;
    async fn add_track(&self, track: Arc<dyn LocalTrack>) -> Result<SenderId, PeerError>;
    /// Исходящий sender без трека, чтобы потом подменять трек без renegotiation
    async fn add_transceiver(&self, kind: MediaKind) -> Result<SenderId, PeerError>;
    async fn replace_track(
        &self,
        sender: SenderId,
        track: Option<Arc<dyn LocalTrack>>,
    ) -> Result<(), PeerError>;

    async fn transport_stats(&self) -> Result<TransportStats, PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Создаёт peer connection и подключает к нему диспетчер событий
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        config: &PeerConfig,
        dispatcher: Dispatcher,
    ) -> Result<Arc<dyn PeerTransport>, PeerError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Возвращает число отправленных байт
    async fn send_text(&self, text: String) -> Result<usize, PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// Локальный медиа-трек (микрофон, камера)
pub trait LocalTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    /// Освобождает устройство; повторный вызов ничего не делает
    fn stop(&self);
    fn is_stopped(&self) -> bool;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Debug, Clone)]
pub enum DataChannelEvent {
    /// Канал, открытый удалённой стороной (ondatachannel)
    Announced(Arc<dyn DataChannel>),
    Open { label: String },
    Message { label: String, text: String },
    Closed { label: String },
    Error { label: String, message: String },
}

pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Обработчики событий peer connection
#[derive(Clone, Default)]
pub struct PeerHandlers {
    pub on_track: Option<Handler<TrackInfo>>,
    pub on_data_channel: Option<Handler<DataChannelEvent>>,
    pub on_ice_candidate: Option<Handler<Option<IceCandidate>>>,
    pub on_ice_error: Option<Handler<String>>,
    pub on_negotiation_needed: Option<Handler<()>>,
    pub on_connection_state_change: Option<Handler<PeerState>>,
}

impl fmt::Debug for PeerHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandlers")
            .field("on_track", &self.on_track.is_some())
            .field("on_data_channel", &self.on_data_channel.is_some())
            .field("on_ice_candidate", &self.on_ice_candidate.is_some())
            .field("on_ice_error", &self.on_ice_error.is_some())
            .field("on_negotiation_needed", &self.on_negotiation_needed.is_some())
            .field(
                "on_connection_state_change",
                &self.on_connection_state_change.is_some(),
            )
            .finish()
    }
}

/// Частичная замена обработчиков.
///
/// `None`: не трогать; `Some(None)`: снять обработчик; `Some(Some(h))`: заменить.
#[derive(Clone, Default)]
pub struct HandlersUpdate {
    pub on_track: Option<Option<Handler<TrackInfo>>>,
    pub on_data_channel: Option<Option<Handler<DataChannelEvent>>>,
    pub on_ice_candidate: Option<Option<Handler<Option<IceCandidate>>>>,
    pub on_ice_error: Option<Option<Handler<String>>>,
    pub on_negotiation_needed: Option<Option<Handler<()>>>,
    pub on_connection_state_change: Option<Option<Handler<PeerState>>>,
}

impl PeerHandlers {
    pub fn apply(&mut self, update: HandlersUpdate) {
        if let Some(h) = update.on_track {
            self.on_track = h;
        }
        if let Some(h) = update.on_data_channel {
            self.on_data_channel = h;
        }
        if let Some(h) = update.on_ice_candidate {
            self.on_ice_candidate = h;
        }
        if let Some(h) = update.on_ice_error {
            self.on_ice_error = h;
        }
        if let Some(h) = update.on_negotiation_needed {
            self.on_negotiation_needed = h;
        }
        if let Some(h) = update.on_connection_state_change {
            self.on_connection_state_change = h;
        }
    }
}

/// Таблица обработчиков одного peer connection.
///
/// Клон разделяет ту же таблицу; транспорт вызывает методы-диспетчеры,
/// negotiator меняет содержимое.
#[derive(Clone, Default)]
pub struct Dispatcher {
    handlers: Arc<RwLock<PeerHandlers>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Dispatcher").field(&self.snapshot()).finish()
    }
}

impl Dispatcher {
    pub fn new(handlers: PeerHandlers) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(handlers)),
        }
    }

    pub fn update(&self, update: HandlersUpdate) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .apply(update);
    }

    /// Снимает все обработчики; поздние события закрытого соединения теряются
    pub fn detach(&self) {
        *self.handlers.write().unwrap_or_else(PoisonError::into_inner) = PeerHandlers::default();
    }

    pub fn snapshot(&self) -> PeerHandlers {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn track(&self, info: TrackInfo) {
        if let Some(h) = self.snapshot().on_track {
            h(info);
        }
    }

    pub fn data_channel(&self, event: DataChannelEvent) {
        if let Some(h) = self.snapshot().on_data_channel {
            h(event);
        }
    }

    pub fn ice_candidate(&self, candidate: Option<IceCandidate>) {
        if let Some(h) = self.snapshot().on_ice_candidate {
            h(candidate);
        }
    }

    pub fn ice_error(&self, message: String) {
        if let Some(h) = self.snapshot().on_ice_error {
            h(message);
        }
    }

    pub fn negotiation_needed(&self) {
        if let Some(h) = self.snapshot().on_negotiation_needed {
            h(());
        }
    }

    pub fn connection_state(&self, state: PeerState) {
        if let Some(h) = self.snapshot().on_connection_state_change {
            h(state);
        }
    }
}
