use crate::peer::types::{IceCandidate, TransportStats};
use std::io::Write;

/// Логирование с временными метками.
///
/// Формат строки прежний: `RUST: [время] LEVEL сообщение`. Фильтр берётся
/// из `RUST_LOG`, по умолчанию `info`. Повторный вызов ничего не делает.
pub fn init() {
    // Проверяем конфигурацию логирования
    if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
        return;
    }

    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let now = chrono::Local::now();
            writeln!(
                buf,
                "RUST: [{}] {} {}",
                now.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .try_init();
}

/// Печать ICE-candidate при появлении (Trickle-ICE)
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    log::debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} username_fragment={:?}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.username_fragment
    );
}

/// Снимок счётчиков выбранной пары
pub fn dump_transport_stats(moment: &str, stats: &TransportStats) {
    log::debug!(
        "STATS {moment}: bytes={}/{}",
        stats.bytes_sent,
        stats.bytes_received
    );
}
