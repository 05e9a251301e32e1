//! Call lifecycle as a pure transition function.
//!
//! The actor feeds every input through [`transition`] and then executes the
//! returned effects. Nothing here touches I/O or timers.

use crate::error::CallError;
use crate::services::ReconnectPolicy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallState {
    #[default]
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Error,
    Disconnected,
}

impl CallState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Error => "error",
            Self::Disconnected => "disconnected",
        }
    }

    /// Звонок идёт или устанавливается
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected | Self::Reconnecting)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TeardownReason {
    Stopped,
    QuotaExhausted,
    ReconnectFailed,
    RemoteClosed,
    StartFailed(String),
}

impl TeardownReason {
    /// `error_code` для строки метрик
    pub fn error_code(&self) -> Option<&'static str> {
        match self {
            Self::Stopped => None,
            Self::QuotaExhausted => Some("quota_minutes"),
            Self::ReconnectFailed => Some("reconnect_failed"),
            Self::RemoteClosed => Some("remote_closed"),
            Self::StartFailed(_) => Some("start_failed"),
        }
    }

    /// Неудачный старт метрики не пишет
    pub fn flushes(&self) -> bool {
        !matches!(self, Self::StartFailed(_))
    }

    pub fn final_state(&self) -> CallState {
        match self {
            Self::Stopped | Self::QuotaExhausted | Self::ReconnectFailed => CallState::Idle,
            Self::RemoteClosed => CallState::Disconnected,
            Self::StartFailed(_) => CallState::Error,
        }
    }

    pub fn last_error(&self) -> Option<CallError> {
        match self {
            Self::Stopped | Self::RemoteClosed => None,
            Self::QuotaExhausted => Some(CallError::QuotaMinutes),
            Self::ReconnectFailed => Some(CallError::ReconnectFailed),
            Self::StartFailed(descriptor) => Some(CallError::StartFailed(descriptor.clone())),
        }
    }
}

/// Счётчики текущей сессии
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Counters {
    pub elapsed_seconds: u64,
    /// Дневной остаток на момент старта
    pub allowance_seconds: i64,
    pub reconnect_attempts: u32,
    pub retry_pending: bool,
    pub policy: ReconnectPolicy,
    pub images_sent: u32,
    pub images_per_session: u32,
    pub data_channel_open: bool,
}

impl Counters {
    pub fn remaining_seconds(&self) -> i64 {
        self.allowance_seconds
            .saturating_sub(i64::try_from(self.elapsed_seconds).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start {
        allowance_seconds: i64,
        images_per_session: u32,
        policy: ReconnectPolicy,
    },
    ConnectSucceeded {
        policy: Option<ReconnectPolicy>,
    },
    ConnectFailed {
        fresh: bool,
        reason: String,
    },
    PeerConnected,
    /// failed или disconnected
    PeerLost,
    PeerClosed,
    RetryDue,
    Tick,
    Stop,
    ToggleVideo,
    SendImage,
    ImageSent,
    ChannelOpened,
    ChannelClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    BeginConnect { fresh: bool },
    /// Тикер и сэмплер статистики, каждый перезапускается
    StartTimers,
    ScheduleRetry { attempt: u32, delay: Duration },
    CancelRetry,
    Teardown(TeardownReason),
    SwapVideo,
    SendImage,
    SendSessionUpdate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: CallState,
    pub counters: Counters,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn stay(state: CallState, counters: Counters) -> Self {
        Self {
            next: state,
            counters,
            effects: Vec::new(),
        }
    }

    fn to(next: CallState, counters: Counters, effects: Vec<Effect>) -> Self {
        Self {
            next,
            counters,
            effects,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    AlreadyActive,
    NotActive,
    NotConnected,
    DataChannelClosed,
    QuotaImages,
}

impl From<Rejection> for CallError {
    fn from(rejection: Rejection) -> Self {
        match rejection {
            Rejection::AlreadyActive => CallError::AlreadyActive,
            Rejection::NotActive => CallError::NotActive,
            Rejection::NotConnected => CallError::NotConnected,
            Rejection::DataChannelClosed => CallError::DataChannelClosed,
            Rejection::QuotaImages => CallError::QuotaImages,
        }
    }
}

pub fn transition(
    state: CallState,
    counters: Counters,
    input: &Input,
) -> Result<Transition, Rejection> {
    use CallState::*;

    let mut c = counters;
    let t = match input {
        Input::Start {
            allowance_seconds,
            images_per_session,
            policy,
        } => {
            if state.is_active() {
                return Err(Rejection::AlreadyActive);
            }
            let fresh = Counters {
                allowance_seconds: *allowance_seconds,
                images_per_session: *images_per_session,
                policy: *policy,
                ..Counters::default()
            };
            Transition::to(Connecting, fresh, vec![Effect::BeginConnect { fresh: true }])
        }

        Input::ConnectSucceeded { policy } => {
            if let Some(policy) = policy {
                c.policy = *policy;
            }
            Transition::stay(state, c)
        }

        Input::ConnectFailed { fresh: true, reason } if state == Connecting => Transition::to(
            Error,
            c,
            vec![Effect::Teardown(TeardownReason::StartFailed(reason.clone()))],
        ),
        Input::ConnectFailed { .. } | Input::PeerLost => match state {
            Connecting | Connected | Reconnecting => on_loss(state, c),
            _ => Transition::stay(state, c),
        },

        Input::PeerConnected => match state {
            Connecting | Reconnecting => {
                let mut effects = Vec::new();
                if c.retry_pending {
                    effects.push(Effect::CancelRetry);
                }
                effects.push(Effect::StartTimers);
                c.reconnect_attempts = 0;
                c.retry_pending = false;
                Transition::to(Connected, c, effects)
            }
            _ => Transition::stay(state, c),
        },

        Input::PeerClosed => {
            if state.is_active() {
                Transition::to(
                    Disconnected,
                    c,
                    vec![Effect::Teardown(TeardownReason::RemoteClosed)],
                )
            } else {
                Transition::stay(state, c)
            }
        }

        Input::RetryDue => {
            if state == Reconnecting && c.retry_pending {
                c.retry_pending = false;
                Transition::to(Reconnecting, c, vec![Effect::BeginConnect { fresh: false }])
            } else {
                Transition::stay(state, c)
            }
        }

        Input::Tick => match state {
            Connected | Reconnecting => {
                c.elapsed_seconds += 1;
                if c.remaining_seconds() <= 0 {
                    Transition::to(
                        Idle,
                        c,
                        vec![Effect::Teardown(TeardownReason::QuotaExhausted)],
                    )
                } else {
                    Transition::stay(state, c)
                }
            }
            _ => Transition::stay(state, c),
        },

        Input::Stop => {
            if state == Idle {
                return Err(Rejection::NotActive);
            }
            Transition::to(Idle, c, vec![Effect::Teardown(TeardownReason::Stopped)])
        }

        Input::ToggleVideo => {
            if state != Connected {
                return Err(Rejection::NotConnected);
            }
            Transition::to(state, c, vec![Effect::SwapVideo])
        }

        Input::SendImage => {
            if !c.data_channel_open {
                return Err(Rejection::DataChannelClosed);
            }
            if c.images_sent >= c.images_per_session {
                return Err(Rejection::QuotaImages);
            }
            Transition::to(state, c, vec![Effect::SendImage])
        }

        Input::ImageSent => {
            c.images_sent += 1;
            Transition::stay(state, c)
        }

        Input::ChannelOpened => {
            c.data_channel_open = true;
            if state.is_active() {
                Transition::to(state, c, vec![Effect::SendSessionUpdate])
            } else {
                Transition::stay(state, c)
            }
        }

        Input::ChannelClosed => {
            c.data_channel_open = false;
            Transition::stay(state, c)
        }
    };
    Ok(t)
}

/// Потеря соединения: ещё одна попытка или окончательная ошибка
fn on_loss(state: CallState, mut c: Counters) -> Transition {
    if c.retry_pending {
        // уже запланирована попытка
        return Transition::stay(CallState::Reconnecting, c);
    }
    if c.reconnect_attempts < c.policy.max_attempts {
        c.reconnect_attempts += 1;
        c.retry_pending = true;
        c.data_channel_open = false;
        let mut effects = Vec::new();
        // время переподключения оплачивается, даже если первое соединение не поднялось
        if state == CallState::Connecting {
            effects.push(Effect::StartTimers);
        }
        effects.push(Effect::ScheduleRetry {
            attempt: c.reconnect_attempts,
            delay: c.policy.delay_for(c.reconnect_attempts),
        });
        Transition::to(CallState::Reconnecting, c, effects)
    } else {
        Transition::to(
            CallState::Error,
            c,
            vec![Effect::Teardown(TeardownReason::ReconnectFailed)],
        )
    }
}
