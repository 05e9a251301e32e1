//! Perfect negotiation over a single, replaceable peer connection.
//!
//! The negotiator owns at most one [`PeerTransport`] at a time. Replacing or
//! closing a connection shuts the old one down first, resets the negotiation
//! flags (the role stays) and drops the remote candidates buffered for it.
//! Candidates that arrive before any connection exists stay buffered until a
//! remote description is applied to the first one.

use crate::error::PeerError;
use crate::peer::ice::apply_pending_candidates;
use crate::peer::state::{FlagsUpdate, NegotiationFlags, PendingCandidates};
use crate::peer::transport::{Dispatcher, HandlersUpdate, PeerFactory, PeerHandlers, PeerTransport};
use crate::peer::types::{IceCandidate, PeerConfig, SdpType, SessionDescription, SignalingState};
use std::sync::{Arc, Mutex, PoisonError};

struct PeerSlot {
    peer: Arc<dyn PeerTransport>,
    config: Arc<PeerConfig>,
    dispatcher: Dispatcher,
}

pub struct Negotiator {
    factory: Arc<dyn PeerFactory>,
    slot: tokio::sync::Mutex<Option<PeerSlot>>,
    flags: Mutex<NegotiationFlags>,
    pending: Mutex<PendingCandidates>,
    // ответы применяются строго по одному
    answer_gate: tokio::sync::Mutex<()>,
}

/// Сбрасывает making_offer на любом выходе, включая отмену future
struct OfferGuard<'a>(&'a Mutex<NegotiationFlags>);

impl Drop for OfferGuard<'_> {
    fn drop(&mut self) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).making_offer = false;
    }
}

struct AnswerGuard<'a>(&'a Mutex<NegotiationFlags>);

impl Drop for AnswerGuard<'_> {
    fn drop(&mut self) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_setting_remote_answer_pending = false;
    }
}

impl Negotiator {
    pub fn new(factory: Arc<dyn PeerFactory>, polite: bool) -> Self {
        Self {
            factory,
            slot: tokio::sync::Mutex::new(None),
            flags: Mutex::new(NegotiationFlags::new(polite)),
            pending: Mutex::new(PendingCandidates::default()),
            answer_gate: tokio::sync::Mutex::new(()),
        }
    }

    /// Возвращает живое соединение, созданное с тем же `Arc<PeerConfig>`,
    /// иначе закрывает старое и создаёт новое. Второй элемент: `true`, если создано.
    pub async fn ensure_peer_connection(
        &self,
        config: &Arc<PeerConfig>,
        handlers: PeerHandlers,
    ) -> Result<(Arc<dyn PeerTransport>, bool), PeerError> {
        let mut slot = self.slot.lock().await;

        if let Some(current) = slot.as_ref() {
            if Arc::ptr_eq(&current.config, config) && current.peer.connection_state().is_open() {
                log::debug!("Reusing existing peer connection");
                return Ok((Arc::clone(&current.peer), false));
            }
        }

        if let Some(old) = slot.take() {
            log::info!("Replacing peer connection");
            self.shutdown(old).await;
        }

        let dispatcher = Dispatcher::new(handlers);
        let peer = self.factory.create(config, dispatcher.clone()).await?;
        *slot = Some(PeerSlot {
            peer: Arc::clone(&peer),
            config: Arc::clone(config),
            dispatcher,
        });
        Ok((peer, true))
    }

    /// Меняет часть обработчиков живого соединения
    pub async fn set_handlers(&self, update: HandlersUpdate) -> Result<(), PeerError> {
        let slot = self.slot.lock().await;
        let current = slot.as_ref().ok_or(PeerError::NoPeer)?;
        current.dispatcher.update(update);
        Ok(())
    }

    pub(crate) fn update_flags(&self, update: FlagsUpdate) {
        self.lock_flags().apply(update);
    }

    pub fn flags(&self) -> NegotiationFlags {
        *self.lock_flags()
    }

    pub async fn current_peer(&self) -> Option<Arc<dyn PeerTransport>> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|current| Arc::clone(&current.peer))
    }

    pub fn pending_candidates(&self) -> usize {
        self.lock_pending().len()
    }

    /// Закрывает соединение; повторный вызов ничего не делает
    pub async fn close(&self) {
        let old = self.slot.lock().await.take();
        match old {
            Some(old) => self.shutdown(old).await,
            None => self.reset(),
        }
    }

    async fn shutdown(&self, old: PeerSlot) {
        // поздние колбэки закрытого соединения никуда не попадут
        old.dispatcher.detach();
        if let Err(e) = old.peer.close().await {
            log::warn!("Failed to close peer connection: {e}");
        }
        self.reset();
    }

    fn reset(&self) {
        self.lock_flags().reset();
        self.lock_pending().clear();
    }

    /// Создаёт offer и ставит его локально.
    ///
    /// `making_offer` держится только на время вызова.
    pub async fn make_offer(&self) -> Result<SessionDescription, PeerError> {
        let peer = self.current_peer().await.ok_or(PeerError::NoPeer)?;

        {
            let mut flags = self.lock_flags();
            if flags.is_setting_remote_answer_pending {
                return Err(PeerError::NegotiationBusy);
            }
            flags.making_offer = true;
        }
        let _guard = OfferGuard(&self.flags);

        let offer = peer.create_offer().await?;
        peer.set_local_description(offer).await?;
        peer.local_description()
            .await
            .ok_or(PeerError::MissingLocalDescription)
    }

    /// Принимает удалённое описание.
    ///
    /// Для offer возвращает answer, который нужно отправить обратно; `None`,
    /// если offer проигнорирован (impolite сторона при коллизии) или пришёл answer.
    pub async fn handle_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<Option<SessionDescription>, PeerError> {
        let peer = self.current_peer().await.ok_or(PeerError::NoPeer)?;

        match desc.kind {
            SdpType::Offer => self.accept_offer(peer.as_ref(), desc).await,
            SdpType::Answer | SdpType::Pranswer => {
                self.apply_answer(peer.as_ref(), desc).await?;
                Ok(None)
            }
            SdpType::Rollback => {
                let state = peer.signaling_state();
                if state != SignalingState::HaveLocalOffer {
                    return Err(PeerError::InvalidState(format!("rollback in {state:?}")));
                }
                peer.rollback().await?;
                Ok(None)
            }
        }
    }

    async fn accept_offer(
        &self,
        peer: &dyn PeerTransport,
        desc: SessionDescription,
    ) -> Result<Option<SessionDescription>, PeerError> {
        let signaling = peer.signaling_state();
        let ignore = {
            let mut flags = self.lock_flags();
            let collision = flags.making_offer || signaling != SignalingState::Stable;
            flags.ignore_offer = !flags.polite && collision;
            flags.ignore_offer
        };
        if ignore {
            log::info!("Offer collision, ignoring remote offer (impolite)");
            return Ok(None);
        }

        if signaling == SignalingState::HaveLocalOffer {
            log::info!("Offer collision, rolling back local offer (polite)");
            peer.rollback().await?;
        }

        peer.set_remote_description(desc).await?;
        self.flush_pending(peer).await;

        let answer = peer.create_answer().await?;
        peer.set_local_description(answer).await?;
        peer.local_description()
            .await
            .map(Some)
            .ok_or(PeerError::MissingLocalDescription)
    }

    async fn apply_answer(
        &self,
        peer: &dyn PeerTransport,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        let _gate = self.answer_gate.lock().await;
        self.update_flags(FlagsUpdate {
            is_setting_remote_answer_pending: Some(true),
            ..FlagsUpdate::default()
        });
        let guard = AnswerGuard(&self.flags);

        peer.set_remote_description(desc).await?;
        drop(guard);

        self.flush_pending(peer).await;
        Ok(())
    }

    /// Кандидат от удалённой стороны; до remote description он откладывается
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        let peer = match self.current_peer().await {
            Some(peer) if peer.has_remote_description().await => peer,
            _ => {
                log::debug!("Buffering remote candidate until remote description is set");
                self.lock_pending().push(candidate);
                return Ok(());
            }
        };

        match peer.add_ice_candidate(candidate).await {
            Err(e) if self.flags().ignore_offer => {
                log::debug!("Ignoring candidate error for ignored offer: {e}");
                Ok(())
            }
            other => other,
        }
    }

    async fn flush_pending(&self, peer: &dyn PeerTransport) {
        let candidates = self.lock_pending().take();
        if candidates.is_empty() {
            return;
        }
        let total = candidates.len();
        let applied = apply_pending_candidates(peer, candidates).await;
        log::info!("Applied {applied}/{total} buffered remote candidates");
    }

    fn lock_flags(&self) -> std::sync::MutexGuard<'_, NegotiationFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingCandidates> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Negotiator")
            .field("flags", &self.flags())
            .field("pending_candidates", &self.pending_candidates())
            .finish_non_exhaustive()
    }
}
