use crate::error::CallError;
use crate::peer::types::TrackInfo;
use crate::session::control::ServerEvent;
use crate::session::machine::CallState;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

/// Последняя ошибка в форме, удобной UI
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub code: &'static str,
    pub message: String,
}

impl From<&CallError> for LastError {
    fn from(err: &CallError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Снимок состояния звонка для UI
#[derive(Serialize, Debug, Clone, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub state: CallState,
    pub session_id: Option<Uuid>,
    pub elapsed_seconds: u64,
    pub remaining_seconds: u64,
    pub reconnect_attempts: u32,
    pub video_enabled: bool,
    pub images_sent: u32,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub last_error: Option<LastError>,
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    StateChanged { from: CallState, to: CallState },
    RetryScheduled { attempt: u32, delay_ms: u64 },
    RemoteTrack(TrackInfo),
    ServerEvent(ServerEvent),
    TransportError(String),
}

const EVENT_CAPACITY: usize = 64;

/// Публикация снимков и событий; аналог emit_* для UI
#[derive(Debug)]
pub struct Publisher {
    snapshot: watch::Sender<SessionSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl Publisher {
    pub fn new() -> Self {
        let (snapshot, _) = watch::channel(SessionSnapshot::default());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { snapshot, events }
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> broadcast::Sender<CallEvent> {
        self.events.clone()
    }

    /// Публикует, только если снимок изменился
    pub fn publish(&self, snapshot: SessionSnapshot) {
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    pub fn emit(&self, event: CallEvent) {
        log::debug!("emit {:?}", event);
        // без подписчиков событие просто теряется
        let _ = self.events.send(event);
    }

    pub fn emit_state(&self, from: CallState, to: CallState) {
        if from != to {
            log::info!("Call state {} -> {}", from.as_str(), to.as_str());
            self.emit(CallEvent::StateChanged { from, to });
        }
    }
}

impl Default for Publisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes_state_string() {
        let snapshot = SessionSnapshot {
            state: CallState::Reconnecting,
            last_error: Some(LastError::from(&CallError::ReconnectFailed)),
            ..SessionSnapshot::default()
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["state"], "reconnecting");
        assert_eq!(json["lastError"]["code"], "reconnect_failed");
    }

    #[tokio::test]
    async fn test_unchanged_snapshot_is_not_republished() {
        let publisher = Publisher::new();
        let mut rx = publisher.watch();
        publisher.publish(SessionSnapshot::default());
        assert!(!rx.has_changed().unwrap());

        publisher.publish(SessionSnapshot {
            elapsed_seconds: 1,
            ..SessionSnapshot::default()
        });
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().elapsed_seconds, 1);
    }
}
