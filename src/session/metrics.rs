use crate::logger::dump_transport_stats;
use crate::peer::transport::PeerTransport;
use crate::peer::types::TransportStats;
use crate::services::{MetricsStore, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Строка метрики, создаваемая при старте сессии
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SessionStart {
    pub session_id: Uuid,
    pub user_id: UserId,
    pub started_at: DateTime<Utc>,
    pub model: String,
    pub with_video: bool,
}

/// Итог сессии, записывается при teardown
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricUpdate {
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub images_sent: u32,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub error_code: Option<String>,
}

/// Накопительные счётчики трафика за всю сессию.
///
/// Каждое новое peer connection начинает свои счётчики с нуля, поэтому при
/// переподключении последний снимок переносится в базу.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferCounters {
    pub bytes_up: u64,
    pub bytes_down: u64,
    base: TransportStats,
    last: TransportStats,
}

impl TransferCounters {
    pub fn absorb(&mut self, stats: TransportStats) {
        self.last = stats;
        self.bytes_up = self
            .bytes_up
            .max(self.base.bytes_sent.saturating_add(stats.bytes_sent));
        self.bytes_down = self
            .bytes_down
            .max(self.base.bytes_received.saturating_add(stats.bytes_received));
    }

    /// Вызывается перед заменой peer connection
    pub fn rebase(&mut self) {
        self.base.bytes_sent = self.base.bytes_sent.saturating_add(self.last.bytes_sent);
        self.base.bytes_received = self
            .base
            .bytes_received
            .saturating_add(self.last.bytes_received);
        self.last = TransportStats::default();
    }

    /// Оценка исходящего трафика до следующего снимка getStats
    pub fn estimate_up(&mut self, bytes: u64) {
        self.bytes_up = self.bytes_up.saturating_add(bytes);
    }
}

pub struct MetricsReporter {
    store: Arc<dyn MetricsStore>,
}

impl MetricsReporter {
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self { store }
    }

    /// Возвращает `true`, если строка создана
    pub async fn start(&self, start: &SessionStart) -> bool {
        match self.store.insert_metric(start).await {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to insert metric for {}: {e:#}", start.session_id);
                false
            }
        }
    }

    pub async fn sample(peer: &dyn PeerTransport, moment: &str) -> Option<TransportStats> {
        match peer.transport_stats().await {
            Ok(stats) => {
                dump_transport_stats(moment, &stats);
                Some(stats)
            }
            Err(e) => {
                log::debug!("Stats sampling failed: {e}");
                None
            }
        }
    }

    pub async fn flush(&self, session_id: Uuid, update: &MetricUpdate) {
        log::info!(
            "Flushing metrics for {}: {}s, {} images, {}/{} bytes, error={:?}",
            session_id,
            update.duration_seconds,
            update.images_sent,
            update.bytes_up,
            update.bytes_down,
            update.error_code
        );
        if let Err(e) = self.store.update_metric(session_id, update).await {
            log::warn!("Failed to update metric for {session_id}: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(sent: u64, received: u64) -> TransportStats {
        TransportStats {
            bytes_sent: sent,
            bytes_received: received,
        }
    }

    #[test]
    fn test_counters_survive_peer_replacement() {
        let mut counters = TransferCounters::default();
        counters.absorb(stats(100, 400));
        counters.absorb(stats(150, 500));
        counters.rebase();
        counters.absorb(stats(20, 30));

        assert_eq!(counters.bytes_up, 170);
        assert_eq!(counters.bytes_down, 530);
    }

    #[test]
    fn test_estimate_is_not_lowered_by_older_sample() {
        let mut counters = TransferCounters::default();
        counters.absorb(stats(100, 0));
        counters.estimate_up(1_000);
        counters.absorb(stats(120, 0));
        assert_eq!(counters.bytes_up, 1_100);

        counters.absorb(stats(1_500, 0));
        assert_eq!(counters.bytes_up, 1_500);
    }
}
