use thiserror::Error;

/// Ошибки транспорта и согласования (peer connection)
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("webrtc: {0}")]
    WebRtc(#[from] webrtc::Error),
    #[error("no live peer connection")]
    NoPeer,
    #[error("peer connection is closed")]
    Closed,
    #[error("local description is missing after setLocalDescription")]
    MissingLocalDescription,
    #[error("invalid signaling state: {0}")]
    InvalidState(String),
    #[error("a remote answer is still being applied")]
    NegotiationBusy,
    #[error("unsupported session description: {0}")]
    InvalidDescription(String),
    #[error("unsupported local track: {0}")]
    UnsupportedTrack(String),
    #[error("unknown rtp sender #{0}")]
    UnknownSender(usize),
    #[error("media device error: {0}")]
    Media(String),
}

/// Ошибки HTTP коллабораторов (минтинг ключа, обмен SDP)
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("{endpoint} returned {status}: {body}")]
    Rejected {
        endpoint: &'static str,
        status: u16,
        body: String,
    },
    #[error("mint response has no ephemeral secret")]
    MissingSecret,
    #[error("unsupported mint response version {0}")]
    UnsupportedVersion(u32),
}

/// Структурированные причины отказа, которые видит UI
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("not authenticated")]
    Unauthenticated,
    #[error("daily minutes exhausted")]
    QuotaMinutes,
    #[error("concurrent session limit reached")]
    QuotaSessions,
    #[error("image limit reached for this session")]
    QuotaImages,
    #[error("a call is already active")]
    AlreadyActive,
    #[error("no active call")]
    NotActive,
    #[error("call is not connected")]
    NotConnected,
    #[error("data channel is not open")]
    DataChannelClosed,
    #[error("start failed: {0}")]
    StartFailed(String),
    #[error("reconnect attempts exhausted")]
    ReconnectFailed,
    #[error("call was cancelled")]
    Cancelled,
    #[error("media error: {0}")]
    Media(String),
    #[error("orchestrator is shut down")]
    Shutdown,
}

impl CallError {
    /// Стабильный код для метрик и UI
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "auth",
            Self::QuotaMinutes => "quota_minutes",
            Self::QuotaSessions => "quota_sessions",
            Self::QuotaImages => "quota_images",
            Self::AlreadyActive => "already_active",
            Self::NotActive => "not_active",
            Self::NotConnected => "not_connected",
            Self::DataChannelClosed => "data_channel_closed",
            Self::StartFailed(_) => "start_failed",
            Self::ReconnectFailed => "reconnect_failed",
            Self::Cancelled => "cancelled",
            Self::Media(_) => "media",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn is_quota(&self) -> bool {
        matches!(
            self,
            Self::QuotaMinutes | Self::QuotaSessions | Self::QuotaImages
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CallError::QuotaImages.code(), "quota_images");
        assert_eq!(CallError::ReconnectFailed.code(), "reconnect_failed");
        assert_eq!(CallError::StartFailed("x".into()).code(), "start_failed");
        assert!(CallError::QuotaSessions.is_quota());
        assert!(!CallError::NotConnected.is_quota());
    }

    #[test]
    fn test_rejected_display_carries_status_and_body() {
        let err = ServiceError::Rejected {
            endpoint: "signaling",
            status: 401,
            body: "bad key".into(),
        };
        assert_eq!(err.to_string(), "signaling returned 401: bad key");
    }
}
