use crate::peer::transport::PeerTransport;
use crate::peer::types::IceCandidate;

/// Применяет все отложенные кандидаты после установки remote description.
///
/// Ошибки отдельных кандидатов только логируются. Возвращает число применённых.
pub async fn apply_pending_candidates(
    peer: &dyn PeerTransport,
    candidates: Vec<IceCandidate>,
) -> usize {
    let mut applied = 0;
    for candidate in candidates {
        log::debug!("Applying pending candidate: {:?}", candidate);
        match peer.add_ice_candidate(candidate).await {
            Ok(()) => applied += 1,
            Err(e) => log::warn!("Failed to apply pending candidate: {e}"),
        }
    }
    applied
}

/// Счётчики кандидатов по типу
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateCounts {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

pub fn analyze_candidates(candidates: &[IceCandidate]) -> CandidateCounts {
    let mut counts = CandidateCounts::default();

    for candidate in candidates {
        if candidate.candidate.contains("typ host") {
            counts.host += 1;
        } else if candidate.candidate.contains("typ srflx") {
            counts.srflx += 1;
        } else if candidate.candidate.contains("typ relay") {
            counts.relay += 1;
        }
    }

    log::info!(
        "Candidate analysis: {} host, {} srflx, {} relay",
        counts.host,
        counts.srflx,
        counts.relay
    );

    if counts.relay == 0 && counts.srflx == 0 {
        log::warn!("No srflx or relay candidates gathered, connection through NAT may fail");
    }

    counts
}
