use crate::error::PeerError;
use crate::peer::transport::LocalTrack;
use crate::peer::types::MediaKind;
use async_trait::async_trait;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

/// Источник локальных треков (микрофон, камера)
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(&self, kind: MediaKind) -> Result<Arc<dyn LocalTrack>, PeerError>;
}

/// Локальный трек поверх `TrackLocalStaticSample`; кадры подаёт приложение
pub struct SampleTrack {
    id: String,
    kind: MediaKind,
    track: Arc<TrackLocalStaticSample>,
    stopped: AtomicBool,
}

impl fmt::Debug for SampleTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl SampleTrack {
    pub fn new(kind: MediaKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        let id = id.into();
        let codec = match kind {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };
        let track = Arc::new(TrackLocalStaticSample::new(codec, id.clone(), stream_id.into()));
        Self {
            id,
            kind,
            track,
            stopped: AtomicBool::new(false),
        }
    }

    /// Трек в виде, который принимает `RTCPeerConnection`
    pub fn rtc_track(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        Arc::clone(&self.track) as Arc<dyn TrackLocal + Send + Sync>
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<(), PeerError> {
        if self.is_stopped() {
            return Err(PeerError::Media(format!("track {} is stopped", self.id)));
        }
        self.track.write_sample(sample).await?;
        Ok(())
    }
}

impl LocalTrack for SampleTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            log::debug!("Local {:?} track {} stopped", self.kind, self.id);
        }
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Устройства, выдающие `SampleTrack`; приложение забирает живой трек через `current`
#[derive(Debug)]
pub struct SampleMediaDevices {
    stream_id: String,
    issued: Mutex<Vec<Arc<SampleTrack>>>,
}

impl SampleMediaDevices {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            issued: Mutex::new(Vec::new()),
        }
    }

    /// Последний не остановленный трек данного типа
    pub fn current(&self, kind: MediaKind) -> Option<Arc<SampleTrack>> {
        let mut issued = self.issued.lock().unwrap_or_else(PoisonError::into_inner);
        issued.retain(|t| !t.is_stopped());
        issued.iter().rev().find(|t| t.kind == kind).cloned()
    }
}

#[async_trait]
impl MediaDevices for SampleMediaDevices {
    async fn acquire(&self, kind: MediaKind) -> Result<Arc<dyn LocalTrack>, PeerError> {
        let id = format!("{}-{}", kind_label(kind), crate::utils::random_id());
        let track = Arc::new(SampleTrack::new(kind, id, self.stream_id.clone()));
        self.issued
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&track));
        log::info!("Acquired local {:?} track {}", kind, track.id());
        Ok(track)
    }
}

fn kind_label(kind: MediaKind) -> &'static str {
    match kind {
        MediaKind::Audio => "audio",
        MediaKind::Video => "video",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_skips_stopped_tracks() {
        let devices = SampleMediaDevices::new("call");
        let first = devices.acquire(MediaKind::Video).await.unwrap();
        let second = devices.acquire(MediaKind::Video).await.unwrap();
        assert_eq!(devices.current(MediaKind::Video).unwrap().id(), second.id());

        second.stop();
        assert_eq!(devices.current(MediaKind::Video).unwrap().id(), first.id());
        assert!(devices.current(MediaKind::Audio).is_none());
    }

    #[tokio::test]
    async fn test_stopped_track_rejects_samples() {
        let track = SampleTrack::new(MediaKind::Audio, "mic", "call");
        track.stop();
        track.stop();
        assert!(track.is_stopped());
        assert!(track.write_sample(&Sample::default()).await.is_err());
    }
}
