//! Session orchestrator.
//!
//! A single actor task owns the call state. User commands, peer callbacks,
//! timer ticks and connect results all arrive on one unbounded channel and are
//! applied in arrival order. Peer callbacks carry the epoch of the peer that
//! produced them and timer messages carry their timer generation, so anything
//! left over from a replaced peer or a cancelled timer is dropped.

pub mod connect;
pub mod control;
pub mod events;
pub mod machine;
pub mod metrics;
pub mod quota;
pub mod timers;


use crate::config::CallConfig;
use crate::error::CallError;
use crate::logger::dump_candidate;
use crate::peer::ice::analyze_candidates;
use crate::peer::media::MediaDevices;
use crate::peer::negotiator::Negotiator;
use crate::peer::transport::{
    DataChannel, DataChannelEvent, Handler, PeerFactory, PeerHandlers,
};
use crate::peer::types::{IceCandidate, MediaKind, PeerState, SenderId, TrackInfo};
use crate::services::{
    CallContext, CredentialMinter, IdentityProvider, MetricsStore, QuotaStore, SettingsStore,
    SignalingExchange, UserId,
};
use crate::utils::{image_data_url, new_session_id};
use chrono::Utc;
use connect::{ConnectEnv, ConnectReport, ConnectRequest, LocalTracks};
use control::ServerEvent;
use events::{CallEvent, LastError, Publisher, SessionSnapshot};
use machine::{transition, CallState, Counters, Effect, Input, TeardownReason};
use metrics::{MetricUpdate, MetricsReporter, SessionStart, TransferCounters};
use quota::QuotaLedger;
use std::sync::Arc;
use timers::Timer;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Внешние зависимости оркестратора
pub struct Services {
    pub identity: Arc<dyn IdentityProvider>,
    pub settings: Arc<dyn SettingsStore>,
    pub minter: Arc<dyn CredentialMinter>,
    pub signaling: Arc<dyn SignalingExchange>,
    pub quota: Arc<dyn QuotaStore>,
    pub metrics: Arc<dyn MetricsStore>,
    pub media: Arc<dyn MediaDevices>,
    pub peers: Arc<dyn PeerFactory>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    pub with_video: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

type Reply<T> = oneshot::Sender<Result<T, CallError>>;

enum Command {
    Start {
        options: StartOptions,
        reply: Reply<Uuid>,
    },
    Stop {
        reply: Reply<()>,
    },
    ToggleVideo {
        reply: Reply<bool>,
    },
    SendImage {
        image: ImagePayload,
        reply: Reply<u32>,
    },
}

#[derive(Debug)]
enum PeerEvent {
    State(PeerState),
    Track(TrackInfo),
    DataChannel(DataChannelEvent),
    IceCandidate(Option<IceCandidate>),
    IceError(String),
    NegotiationNeeded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TimerKind {
    Tick,
    Stats,
    Retry,
}

enum Msg {
    Command(Command),
    Peer {
        epoch: u64,
        event: PeerEvent,
    },
    Timer {
        kind: TimerKind,
        generation: u64,
    },
    /// Контекст первого подключения готов, обмен ещё идёт
    Prepared {
        epoch: u64,
        context: Arc<CallContext>,
    },
    Connect {
        epoch: u64,
        fresh: bool,
        outcome: anyhow::Result<ConnectReport>,
    },
}

/// Ручка управления звонком; клоны разделяют один актор
#[derive(Clone)]
pub struct CallHandle {
    tx: UnboundedSender<Msg>,
    snapshot: watch::Receiver<SessionSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl std::fmt::Debug for CallHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallHandle")
            .field("snapshot", &*self.snapshot.borrow())
            .finish_non_exhaustive()
    }
}

impl CallHandle {
    /// Запускает актор; он живёт, пока существует хотя бы одна ручка
    pub fn spawn(config: CallConfig, services: Services) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let publisher = Publisher::new();
        let handle = Self {
            tx: tx.clone(),
            snapshot: publisher.watch(),
            events: publisher.events(),
        };

        let config = Arc::new(config);
        let services = Arc::new(services);
        let actor = Actor {
            negotiator: Arc::new(Negotiator::new(Arc::clone(&services.peers), config.polite)),
            metrics: Arc::new(MetricsReporter::new(Arc::clone(&services.metrics))),
            config,
            services,
            publisher,
            tx: tx.downgrade(),
            state: CallState::Idle,
            counters: Counters::default(),
            session: None,
            last_error: None,
            epoch: 0,
            job: None,
            renegotiation: None,
            ticker: Timer::default(),
            stats: Timer::default(),
            retry: Timer::default(),
            pending_start: None,
            queued_image: None,
        };
        drop(tx);
        tokio::spawn(actor.run(rx));
        handle
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> Command) -> Result<T, CallError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Msg::Command(command(reply)))
            .map_err(|_| CallError::Shutdown)?;
        rx.await.map_err(|_| CallError::Shutdown)?
    }

    /// Завершается после обмена offer/answer; возвращает id сессии
    pub async fn start_call(&self, options: StartOptions) -> Result<Uuid, CallError> {
        self.request(|reply| Command::Start { options, reply }).await
    }

    pub async fn stop_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Stop { reply }).await
    }

    /// Возвращает новое намерение (видео включено или нет)
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await
    }

    /// Возвращает число отправленных за сессию изображений
    pub async fn send_image(&self, image: ImagePayload) -> Result<u32, CallError> {
        self.request(|reply| Command::SendImage { image, reply })
            .await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }
}

struct Session {
    id: Uuid,
    user: UserId,
    ledger: QuotaLedger,
    desired_video: bool,
    context: Option<Arc<CallContext>>,
    metric_started: bool,
    transfer: TransferCounters,
    tracks: LocalTracks,
    video_sender: Option<SenderId>,
    data_channel: Option<Arc<dyn DataChannel>>,
    session_update_pending: bool,
    local_candidates: Vec<IceCandidate>,
}

impl Session {
    fn new(user: UserId, ledger: QuotaLedger, desired_video: bool) -> Self {
        Self {
            id: new_session_id(),
            user,
            ledger,
            desired_video,
            context: None,
            metric_started: false,
            transfer: TransferCounters::default(),
            tracks: LocalTracks::default(),
            video_sender: None,
            data_channel: None,
            session_update_pending: false,
            local_candidates: Vec::new(),
        }
    }

    /// Всё, что относится к конкретному peer connection
    fn detach_peer(&mut self) {
        self.transfer.rebase();
        self.tracks.stop_all();
        self.video_sender = None;
        self.data_channel = None;
        self.session_update_pending = false;
        self.local_candidates.clear();
    }
}

struct Actor {
    config: Arc<CallConfig>,
    services: Arc<Services>,
    negotiator: Arc<Negotiator>,
    metrics: Arc<MetricsReporter>,
    publisher: Publisher,
    tx: WeakUnboundedSender<Msg>,

    state: CallState,
    counters: Counters,
    session: Option<Session>,
    last_error: Option<CallError>,

    /// Номер текущего peer connection (и задачи подключения)
    epoch: u64,
    job: Option<JoinHandle<()>>,
    renegotiation: Option<JoinHandle<()>>,
    ticker: Timer,
    stats: Timer,
    retry: Timer,

    pending_start: Option<Reply<Uuid>>,
    queued_image: Option<ImagePayload>,
}

impl Actor {
    async fn run(mut self, mut rx: UnboundedReceiver<Msg>) {
        log::info!("Call orchestrator started");
        while let Some(msg) = rx.recv().await {
            self.handle(msg).await;
            self.publish();
        }

        // все ручки закрыты
        if self.state != CallState::Idle {
            self.teardown(TeardownReason::Stopped).await;
        }
        log::info!("Call orchestrator stopped");
    }

    async fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Command(command) => self.handle_command(command).await,
            Msg::Peer { epoch, event } => {
                if epoch != self.epoch {
                    log::trace!("Dropping event of replaced peer #{epoch}: {event:?}");
                    return;
                }
                self.handle_peer_event(event).await;
            }
            Msg::Timer { kind, generation } => self.handle_timer(kind, generation).await,
            Msg::Prepared { epoch, context } => {
                if epoch != self.epoch {
                    log::debug!("Dropping stale call context #{epoch}");
                    return;
                }
                self.handle_prepared(context).await;
            }
            Msg::Connect {
                epoch,
                fresh,
                outcome,
            } => {
                if epoch != self.epoch {
                    log::debug!("Dropping stale connect result #{epoch}");
                    return;
                }
                self.job = None;
                self.handle_connect(fresh, outcome).await;
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { options, reply } => self.start(options, reply).await,
            Command::Stop { reply } => {
                let _ = reply.send(self.apply(Input::Stop).await);
            }
            Command::ToggleVideo { reply } => {
                let result = self.apply(Input::ToggleVideo).await.map(|()| {
                    self.session
                        .as_ref()
                        .map(|s| s.desired_video)
                        .unwrap_or(false)
                });
                let _ = reply.send(result);
            }
            Command::SendImage { image, reply } => {
                self.queued_image = Some(image);
                let result = self
                    .apply(Input::SendImage)
                    .await
                    .map(|()| self.counters.images_sent);
                self.queued_image = None;
                let _ = reply.send(result);
            }
        }
    }

    async fn start(&mut self, options: StartOptions, reply: Reply<Uuid>) {
        if self.state.is_active() {
            let _ = reply.send(Err(CallError::AlreadyActive));
            return;
        }

        let (user, ledger) = match self.precheck().await {
            Ok(checked) => checked,
            Err(e) if e.is_quota() => {
                log::info!("Call start refused by quota: {e}");
                let _ = reply.send(Err(e));
                return;
            }
            Err(e) => {
                log::warn!("Call start refused: {e}");
                let _ = reply.send(Err(e));
                return;
            }
        };

        let input = Input::Start {
            allowance_seconds: ledger.allowance_seconds(),
            images_per_session: ledger.limits().images_per_session,
            policy: self.config.default_reconnect,
        };
        let session = Session::new(user, ledger, options.with_video);
        log::info!(
            "Starting call {} (video: {})",
            session.id,
            options.with_video
        );
        self.last_error = None;
        self.session = Some(session);
        self.pending_start = Some(reply);

        if let Err(e) = self.apply(input).await {
            self.session = None;
            if let Some(reply) = self.pending_start.take() {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn precheck(&self) -> Result<(UserId, QuotaLedger), CallError> {
        let user = self
            .services
            .identity
            .current_user()
            .await
            .ok_or(CallError::Unauthenticated)?;
        let limits = self
            .services
            .quota
            .ensure_limits(&user)
            .await
            .map_err(|e| CallError::StartFailed(format!("quota lookup: {e:#}")))?;
        let ledger = QuotaLedger::new(limits);
        ledger.check_start()?;
        Ok((user, ledger))
    }

    /// Прогоняет вход через автомат и выполняет эффекты
    async fn apply(&mut self, input: Input) -> Result<(), CallError> {
        let t = transition(self.state, self.counters, &input)?;
        let from = self.state;
        self.state = t.next;
        self.counters = t.counters;
        self.publisher.emit_state(from, t.next);

        for effect in t.effects {
            self.run_effect(effect).await?;
        }
        Ok(())
    }

    async fn run_effect(&mut self, effect: Effect) -> Result<(), CallError> {
        match effect {
            Effect::BeginConnect { fresh } => self.begin_connect(fresh),
            Effect::StartTimers => self.start_timers(),
            Effect::ScheduleRetry { attempt, delay } => {
                self.schedule_retry(attempt, delay).await
            }
            Effect::CancelRetry => self.retry.cancel(),
            Effect::Teardown(reason) => self.teardown(reason).await,
            Effect::SwapVideo => return self.swap_video().await,
            Effect::SendImage => return self.send_queued_image().await,
            Effect::SendSessionUpdate => self.send_session_update().await,
        }
        Ok(())
    }

    fn begin_connect(&mut self, fresh: bool) {
        if let Some(job) = self.job.take() {
            job.abort();
        }
        // ответ для старого соединения не должен попасть в новое
        if let Some(task) = self.renegotiation.take() {
            task.abort();
        }
        let Some(session) = self.session.as_mut() else {
            log::warn!("Connect requested without a session");
            return;
        };
        if !fresh {
            session.detach_peer();
        }

        self.epoch += 1;
        let epoch = self.epoch;
        let request = ConnectRequest {
            session_id: session.id,
            with_video: session.desired_video,
            context: if fresh {
                None
            } else {
                session.context.clone()
            },
        };
        log::info!(
            "Connecting session {} (peer #{}, {})",
            request.session_id,
            epoch,
            if fresh { "fresh" } else { "reconnect" }
        );

        let env = self.connect_env();
        let handlers = peer_handlers(self.tx.clone(), epoch);
        let tx = self.tx.clone();
        self.job = Some(tokio::spawn(async move {
            let prepared = |context| {
                send(&tx, Msg::Prepared { epoch, context });
            };
            let outcome = if !fresh && request.context.is_none() {
                Err(anyhow::anyhow!("no call context to reconnect with"))
            } else {
                connect::connect(&env, request, handlers, prepared).await
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(Msg::Connect {
                    epoch,
                    fresh,
                    outcome,
                });
            }
        }));
    }

    fn connect_env(&self) -> ConnectEnv {
        ConnectEnv {
            negotiator: Arc::clone(&self.negotiator),
            services: Arc::clone(&self.services),
            config: Arc::clone(&self.config),
        }
    }

    /// Строка метрики создаётся, как только есть контекст, чтобы её закрыл любой teardown
    async fn handle_prepared(&mut self, context: Arc<CallContext>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.context.is_some() {
            return;
        }
        session.context = Some(Arc::clone(&context));
        session.metric_started = self
            .metrics
            .start(&SessionStart {
                session_id: session.id,
                user_id: session.user.clone(),
                started_at: Utc::now(),
                model: context.model.clone(),
                with_video: session.desired_video,
            })
            .await;
    }

    async fn handle_connect(&mut self, fresh: bool, outcome: anyhow::Result<ConnectReport>) {
        match outcome {
            Ok(report) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let policy = report.context.reconnect;
                if session.context.is_none() {
                    session.context = Some(Arc::clone(&report.context));
                }
                session.tracks = report.tracks;
                session.video_sender = Some(report.video_sender);
                session.data_channel = Some(report.data_channel);
                let session_id = session.id;
                let update_now = session.session_update_pending;

                if let Err(e) = self
                    .apply(Input::ConnectSucceeded {
                        policy: Some(policy),
                    })
                    .await
                {
                    log::warn!("Connect result rejected: {e}");
                }
                if update_now {
                    self.send_session_update().await;
                }
                if let Some(reply) = self.pending_start.take() {
                    let _ = reply.send(Ok(session_id));
                }
            }
            Err(e) => {
                let reason = format!("{e:#}");
                log::warn!("Connect attempt failed: {reason}");
                if let Err(err) = self
                    .apply(Input::ConnectFailed {
                        fresh,
                        reason: reason.clone(),
                    })
                    .await
                {
                    log::warn!("Connect failure rejected: {err}");
                }
                if fresh {
                    if let Some(reply) = self.pending_start.take() {
                        let _ = reply.send(Err(CallError::StartFailed(reason)));
                    }
                }
            }
        }
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        let input = match event {
            PeerEvent::State(state) => {
                log::info!("Peer state: {:?}", state);
                match state {
                    PeerState::Connected => Some(Input::PeerConnected),
                    PeerState::Closed => Some(Input::PeerClosed),
                    state if state.is_lost() => Some(Input::PeerLost),
                    _ => None,
                }
            }
            PeerEvent::Track(info) => {
                log::info!("Remote {:?} track {}", info.kind, info.id);
                self.publisher.emit(CallEvent::RemoteTrack(info));
                None
            }
            PeerEvent::DataChannel(event) => self.on_data_channel(event),
            PeerEvent::IceCandidate(candidate) => {
                self.on_local_candidate(candidate);
                None
            }
            PeerEvent::IceError(message) => {
                log::warn!("ICE error: {message}");
                self.publisher.emit(CallEvent::TransportError(message));
                None
            }
            PeerEvent::NegotiationNeeded => {
                self.renegotiate();
                None
            }
        };

        if let Some(input) = input {
            if let Err(e) = self.apply(input).await {
                log::debug!("Peer input ignored: {e}");
            }
        }
    }

    fn on_data_channel(&mut self, event: DataChannelEvent) -> Option<Input> {
        let ours = |label: &str| label == self.config.data_channel_label;
        match event {
            DataChannelEvent::Announced(channel) => {
                log::info!("Remote side opened data channel '{}'", channel.label());
                None
            }
            DataChannelEvent::Open { label } if ours(&label) => Some(Input::ChannelOpened),
            DataChannelEvent::Closed { label } if ours(&label) => Some(Input::ChannelClosed),
            DataChannelEvent::Message { label, text } => {
                match ServerEvent::parse(&text) {
                    Ok(event) => {
                        if event.is_error() {
                            let error = event.error.as_ref();
                            log::warn!(
                                "Server error on '{}': {} ({:?})",
                                label,
                                error.map(|e| e.message.as_str()).unwrap_or_default(),
                                error.and_then(|e| e.code.as_deref())
                            );
                        } else {
                            log::debug!("Server event on '{}': {}", label, event.kind);
                        }
                        self.publisher.emit(CallEvent::ServerEvent(event));
                    }
                    Err(e) => log::warn!("Dropping unparsable message on '{}': {}", label, e),
                }
                None
            }
            DataChannelEvent::Error { label, message } => {
                let message = format!("data channel '{label}': {message}");
                self.publisher.emit(CallEvent::TransportError(message));
                None
            }
            DataChannelEvent::Open { .. } | DataChannelEvent::Closed { .. } => None,
        }
    }

    fn on_local_candidate(&mut self, candidate: Option<IceCandidate>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match candidate {
            Some(candidate) => {
                dump_candidate("local", &candidate);
                session.local_candidates.push(candidate);
            }
            None => {
                analyze_candidates(&session.local_candidates);
            }
        }
    }

    fn renegotiate(&mut self) {
        if self.state != CallState::Connected {
            log::debug!("Negotiation needed while {}, skipping", self.state.as_str());
            return;
        }
        let Some(context) = self.session.as_ref().and_then(|s| s.context.clone()) else {
            return;
        };
        if let Some(task) = self.renegotiation.take() {
            task.abort();
        }

        let negotiator = Arc::clone(&self.negotiator);
        let signaling = Arc::clone(&self.services.signaling);
        self.renegotiation = Some(tokio::spawn(async move {
            match connect::renegotiate(&negotiator, signaling.as_ref(), &context).await {
                Ok(()) => log::info!("Renegotiation done"),
                Err(e) => log::warn!("Renegotiation failed: {e:#}"),
            }
        }));
    }

    async fn handle_timer(&mut self, kind: TimerKind, generation: u64) {
        let timer = match kind {
            TimerKind::Tick => &self.ticker,
            TimerKind::Stats => &self.stats,
            TimerKind::Retry => &self.retry,
        };
        if !timer.is_current(generation) {
            log::trace!(
                "Dropping stale {kind:?} timer message (generation {generation}, current {})",
                timer.generation()
            );
            return;
        }

        match kind {
            TimerKind::Tick => {
                if let Err(e) = self.apply(Input::Tick).await {
                    log::debug!("Tick ignored: {e}");
                }
            }
            TimerKind::Stats => self.sample_stats("SAMPLE").await,
            TimerKind::Retry => {
                if let Err(e) = self.apply(Input::RetryDue).await {
                    log::debug!("Retry ignored: {e}");
                }
            }
        }
    }

    fn start_timers(&mut self) {
        let tx = self.tx.clone();
        self.ticker
            .start_interval(self.config.tick_interval, move |generation| {
                send(&tx, Msg::Timer {
                    kind: TimerKind::Tick,
                    generation,
                })
            });

        let tx = self.tx.clone();
        self.stats
            .start_interval(self.config.stats_interval, move |generation| {
                send(&tx, Msg::Timer {
                    kind: TimerKind::Stats,
                    generation,
                })
            });
    }

    async fn schedule_retry(&mut self, attempt: u32, delay: std::time::Duration) {
        log::warn!(
            "Connection lost, retry {}/{} in {} ms",
            attempt,
            self.counters.policy.max_attempts,
            delay.as_millis()
        );
        self.sample_stats("BEFORE RECONNECT").await;
        self.publisher.emit(CallEvent::RetryScheduled {
            attempt,
            delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
        });

        let tx = self.tx.clone();
        self.retry.start_once(delay, move |generation| async move {
            send(&tx, Msg::Timer {
                kind: TimerKind::Retry,
                generation,
            });
        });
    }

    async fn sample_stats(&mut self, moment: &str) {
        let Some(peer) = self.negotiator.current_peer().await else {
            return;
        };
        if let Some(stats) = MetricsReporter::sample(peer.as_ref(), moment).await {
            if let Some(session) = self.session.as_mut() {
                session.transfer.absorb(stats);
            }
        }
    }

    async fn send_session_update(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let (Some(channel), Some(context)) = (session.data_channel.clone(), session.context.clone())
        else {
            // канал открылся раньше, чем пришёл отчёт подключения
            session.session_update_pending = true;
            return;
        };
        session.session_update_pending = false;

        match channel.send_text(context.session_update.to_string()).await {
            Ok(bytes) => {
                session.transfer.estimate_up(bytes as u64);
                log::info!("Sent session.update ({bytes} bytes)");
            }
            Err(e) => log::warn!("Failed to send session.update: {e}"),
        }
    }

    async fn swap_video(&mut self) -> Result<(), CallError> {
        let peer = self
            .negotiator
            .current_peer()
            .await
            .ok_or(CallError::NotConnected)?;
        let session = self.session.as_mut().ok_or(CallError::NotActive)?;
        let sender = session.video_sender.ok_or(CallError::NotConnected)?;

        if session.desired_video {
            peer.replace_track(sender, None)
                .await
                .map_err(|e| CallError::Media(e.to_string()))?;
            if let Some(track) = session.tracks.video.take() {
                track.stop();
            }
            session.desired_video = false;
        } else {
            let track = self
                .services
                .media
                .acquire(MediaKind::Video)
                .await
                .map_err(|e| CallError::Media(e.to_string()))?;
            if let Err(e) = peer.replace_track(sender, Some(Arc::clone(&track))).await {
                track.stop();
                return Err(CallError::Media(e.to_string()));
            }
            session.tracks.video = Some(track);
            session.desired_video = true;
        }
        log::info!("Video toggled, enabled: {}", session.desired_video);
        Ok(())
    }

    async fn send_queued_image(&mut self) -> Result<(), CallError> {
        let image = self.queued_image.take().ok_or(CallError::NotActive)?;
        let session = self.session.as_mut().ok_or(CallError::NotActive)?;
        let channel = session
            .data_channel
            .clone()
            .filter(|c| c.is_open())
            .ok_or(CallError::DataChannelClosed)?;

        let url = image_data_url(&image.mime_type, &image.bytes);
        let mut sent = 0usize;
        for message in control::image_messages(&url) {
            sent += channel.send_text(message.to_string()).await.map_err(|e| {
                log::warn!("Failed to send image: {e}");
                CallError::DataChannelClosed
            })?;
        }
        session.transfer.estimate_up(sent as u64);

        self.counters = transition(self.state, self.counters, &Input::ImageSent)?.counters;
        log::info!(
            "Image sent ({} bytes), {}/{} this session",
            sent,
            self.counters.images_sent,
            self.counters.images_per_session
        );
        Ok(())
    }

    async fn teardown(&mut self, reason: TeardownReason) {
        // сначала синхронно гасим всё, что может прислать новые сообщения
        self.ticker.cancel();
        self.stats.cancel();
        self.retry.cancel();
        if let Some(job) = self.job.take() {
            job.abort();
        }
        if let Some(task) = self.renegotiation.take() {
            task.abort();
        }
        self.epoch += 1;
        self.publish();

        log::info!("Tearing down call: {:?}", reason);
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(reason.last_error().unwrap_or(CallError::Cancelled)));
        }

        if let Some(mut session) = self.session.take() {
            if reason.flushes() && session.context.is_some() {
                if let Some(peer) = self.negotiator.current_peer().await {
                    if let Some(stats) = MetricsReporter::sample(peer.as_ref(), "TEARDOWN").await {
                        session.transfer.absorb(stats);
                    }
                }
                self.flush(&session, &reason).await;
            }
            self.negotiator.close().await;
            session.tracks.stop_all();
        } else {
            self.negotiator.close().await;
        }

        if let Some(error) = reason.last_error() {
            self.last_error = Some(error);
        }
        self.counters = Counters::default();
        let from = self.state;
        self.state = reason.final_state();
        self.publisher.emit_state(from, self.state);
    }

    async fn flush(&self, session: &Session, reason: &TeardownReason) {
        if session.metric_started {
            let update = MetricUpdate {
                ended_at: Utc::now(),
                duration_seconds: self.counters.elapsed_seconds,
                images_sent: self.counters.images_sent,
                bytes_up: session.transfer.bytes_up,
                bytes_down: session.transfer.bytes_down,
                error_code: reason.error_code().map(str::to_string),
            };
            self.metrics.flush(session.id, &update).await;
        }

        let delta = session
            .ledger
            .settle(self.counters.elapsed_seconds, self.counters.images_sent);
        if let Err(e) = self.services.quota.update_limits(&session.user, delta).await {
            log::warn!("Failed to update quota for {}: {e:#}", session.user);
        }
    }

    fn publish(&self) {
        self.publisher.publish(self.snapshot());
    }

    fn snapshot(&self) -> SessionSnapshot {
        let session = self.session.as_ref();
        SessionSnapshot {
            state: self.state,
            session_id: session.map(|s| s.id),
            elapsed_seconds: self.counters.elapsed_seconds,
            remaining_seconds: session
                .map(|s| s.ledger.remaining_seconds(self.counters.elapsed_seconds))
                .unwrap_or(0),
            reconnect_attempts: self.counters.reconnect_attempts,
            video_enabled: session.map(|s| s.desired_video).unwrap_or(false),
            images_sent: self.counters.images_sent,
            bytes_up: session.map(|s| s.transfer.bytes_up).unwrap_or(0),
            bytes_down: session.map(|s| s.transfer.bytes_down).unwrap_or(0),
            last_error: self.last_error.as_ref().map(LastError::from),
        }
    }
}

fn send(tx: &WeakUnboundedSender<Msg>, msg: Msg) -> bool {
    match tx.upgrade() {
        Some(tx) => tx.send(msg).is_ok(),
        None => false,
    }
}

/// Обработчики peer connection с номером эпохи
fn peer_handlers(tx: WeakUnboundedSender<Msg>, epoch: u64) -> PeerHandlers {
    let forward: Arc<dyn Fn(PeerEvent) + Send + Sync> = Arc::new(move |event| {
        send(&tx, Msg::Peer { epoch, event });
    });

    let f = Arc::clone(&forward);
    let on_track: Handler<TrackInfo> = Arc::new(move |info| f(PeerEvent::Track(info)));
    let f = Arc::clone(&forward);
    let on_data_channel: Handler<DataChannelEvent> =
        Arc::new(move |event| f(PeerEvent::DataChannel(event)));
    let f = Arc::clone(&forward);
    let on_ice_candidate: Handler<Option<IceCandidate>> =
        Arc::new(move |candidate| f(PeerEvent::IceCandidate(candidate)));
    let f = Arc::clone(&forward);
    let on_ice_error: Handler<String> = Arc::new(move |message| f(PeerEvent::IceError(message)));
    let f = Arc::clone(&forward);
    let on_negotiation_needed: Handler<()> = Arc::new(move |()| f(PeerEvent::NegotiationNeeded));
    let f = forward;
    let on_connection_state_change: Handler<PeerState> =
        Arc::new(move |state| f(PeerEvent::State(state)));

    PeerHandlers {
        on_track: Some(on_track),
        on_data_channel: Some(on_data_channel),
        on_ice_candidate: Some(on_ice_candidate),
        on_ice_error: Some(on_ice_error),
        on_negotiation_needed: Some(on_negotiation_needed),
        on_connection_state_change: Some(on_connection_state_change),
    }
}
