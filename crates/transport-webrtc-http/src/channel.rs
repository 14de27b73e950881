//! Text/binary frame link over an `RTCDataChannel`.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::error::TransportError;
use crate::flow::BUFFERED_AMOUNT_LOW_THRESHOLD;

/// One data-channel message. The text/binary tag is part of the framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn is_text(&self) -> bool {
        matches!(self, Frame::Text(_))
    }

    pub fn len(&self) -> usize {
        match self {
            Frame::Text(text) => text.len(),
            Frame::Binary(data) => data.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn send(&self, frame: Frame) -> Result<usize, TransportError>;

    /// Bytes queued on the channel but not yet handed to the transport.
    async fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Both directions of an open data channel plus its low-water signal.
pub struct FrameLink {
    pub(crate) sink: Arc<dyn FrameSink>,
    pub(crate) frames: mpsc::UnboundedReceiver<Frame>,
    pub(crate) low_water: Arc<Notify>,
}

impl FrameLink {
    /// Wires the message, close and buffered-amount-low callbacks of `dc`.
    pub(crate) async fn attach(dc: Arc<RTCDataChannel>) -> Self {
        let (tx, frames) = mpsc::unbounded_channel();
        let inbound = Arc::new(Mutex::new(Some(tx)));
        let low_water = Arc::new(Notify::new());
        let label = dc.label().to_string();

        let on_message = inbound.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let inbound = on_message.clone();
            Box::pin(async move {
                let frame = if msg.is_string {
                    match String::from_utf8(msg.data.to_vec()) {
                        Ok(text) => Frame::Text(text),
                        Err(err) => {
                            tracing::warn!(target = "webrtc", error = %err, "dropping non utf-8 text frame");
                            return;
                        }
                    }
                } else {
                    Frame::Binary(msg.data)
                };
                tracing::trace!(target = "webrtc", text = frame.is_text(), frame_len = frame.len(), "received frame");
                if let Some(tx) = inbound.lock().as_ref() {
                    let _ = tx.send(frame);
                }
            })
        }));

        let on_close = inbound.clone();
        let close_signal = low_water.clone();
        let close_label = label.clone();
        dc.on_close(Box::new(move || {
            let inbound = on_close.clone();
            let low_water = close_signal.clone();
            let label = close_label.clone();
            Box::pin(async move {
                tracing::debug!(target = "webrtc", label = %label, "data channel closed");
                inbound.lock().take();
                low_water.notify_one();
            })
        }));

        dc.on_error(Box::new(move |err| {
            let label = label.clone();
            Box::pin(async move {
                tracing::warn!(target = "webrtc", label = %label, error = %err, "data channel error");
            })
        }));

        dc.set_buffered_amount_low_threshold(BUFFERED_AMOUNT_LOW_THRESHOLD)
            .await;
        let low_signal = low_water.clone();
        dc.on_buffered_amount_low(Box::new(move || {
            let low_water = low_signal.clone();
            Box::pin(async move {
                low_water.notify_one();
            })
        }))
        .await;

        Self {
            sink: Arc::new(DataChannelSink { dc }),
            frames,
            low_water,
        }
    }

    pub(crate) async fn close(&self) {
        self.sink.close().await;
    }
}

struct DataChannelSink {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl FrameSink for DataChannelSink {
    async fn send(&self, frame: Frame) -> Result<usize, TransportError> {
        let result = match frame {
            Frame::Text(text) => self.dc.send_text(text).await,
            Frame::Binary(data) => self.dc.send(&data).await,
        };
        result.map_err(|err| {
            tracing::debug!(target = "webrtc", error = %err, "data channel send failed");
            TransportError::ChannelClosed
        })
    }

    async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        if let Err(err) = self.dc.close().await {
            tracing::debug!(target = "webrtc", error = %err, "data channel close failed");
        }
    }
}
