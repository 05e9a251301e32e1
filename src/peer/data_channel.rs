use crate::error::PeerError;
use crate::peer::transport::{DataChannel, DataChannelEvent, Dispatcher};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// `RTCDataChannel` за интерфейсом `DataChannel`
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
}

impl fmt::Debug for RtcDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcDataChannel")
            .field("label", &self.label)
            .field("state", &self.dc.ready_state())
            .finish()
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<usize, PeerError> {
        if !self.is_open() {
            return Err(PeerError::Closed);
        }
        Ok(self.dc.send_text(text).await?)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.dc.close().await?;
        Ok(())
    }
}

/// общий обработчик data-channel: события уходят в диспетчер peer connection
pub fn attach_dc(dc: &Arc<RTCDataChannel>, dispatcher: Dispatcher) -> Arc<dyn DataChannel> {
    let label = dc.label().to_string();
    log::debug!("attach_dc called for '{}'", label);

    dc.on_open(Box::new({
        let d = dispatcher.clone();
        let label = label.clone();
        move || {
            log::info!("Data channel '{}' opened", label);
            d.data_channel(DataChannelEvent::Open {
                label: label.clone(),
            });
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let d = dispatcher.clone();
        let label = label.clone();
        move |msg: DataChannelMessage| {
            log::debug!("Received message, length: {}", msg.data.len());
            // протокол управления текстовый, бинарные кадры не ждём
            if msg.is_string {
                d.data_channel(DataChannelEvent::Message {
                    label: label.clone(),
                    text: String::from_utf8_lossy(&msg.data).into_owned(),
                });
            } else {
                log::warn!("Dropping binary message on '{}'", label);
            }
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let d = dispatcher.clone();
        let label = label.clone();
        move || {
            log::info!("Data channel '{}' closed", label);
            d.data_channel(DataChannelEvent::Closed {
                label: label.clone(),
            });
            Box::pin(async {})
        }
    }));

    dc.on_error(Box::new({
        let d = dispatcher;
        let label = label.clone();
        move |err: webrtc::Error| {
            log::warn!("Data channel '{}' error: {}", label, err);
            d.data_channel(DataChannelEvent::Error {
                label: label.clone(),
                message: err.to_string(),
            });
            Box::pin(async {})
        }
    }));

    Arc::new(RtcDataChannel {
        dc: Arc::clone(dc),
        label,
    })
}
