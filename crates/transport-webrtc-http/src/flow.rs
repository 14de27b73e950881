use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;

use crate::channel::{Frame, FrameSink};
use crate::error::TransportError;

/// Largest single frame payload.
pub const MTU: usize = 16384;
pub const BUFFERED_AMOUNT_LOW_THRESHOLD: usize = MTU;
pub const MAX_BUFFERED_AMOUNT: usize = 8 * MTU;

/// Writer that blocks once the channel's send buffer passes
/// [`MAX_BUFFERED_AMOUNT`] until the low-water callback fires.
#[derive(Clone)]
pub struct FlowControlledWriter {
    sink: Arc<dyn FrameSink>,
    low_water: Arc<Notify>,
}

impl FlowControlledWriter {
    pub fn new(sink: Arc<dyn FrameSink>, low_water: Arc<Notify>) -> Self {
        Self { sink, low_water }
    }

    pub async fn write(&self, frame: Frame) -> Result<usize, TransportError> {
        let written = self.sink.send(frame).await?;
        loop {
            let buffered = self.sink.buffered_amount().await;
            if buffered + written <= MAX_BUFFERED_AMOUNT {
                return Ok(written);
            }
            if !self.sink.is_open() {
                return Err(TransportError::ChannelClosed);
            }
            tracing::trace!(target = "webrtc", buffered, written, "waiting for buffered amount low");
            self.low_water.notified().await;
        }
    }

    /// Sends `text` as MTU-sized text frames split on char boundaries.
    pub async fn write_text(&self, text: &str) -> Result<usize, TransportError> {
        let mut total = 0;
        for chunk in text_chunks(text, MTU) {
            total += self.write(Frame::Text(chunk.to_string())).await?;
        }
        Ok(total)
    }

    /// Sends `data` as MTU-sized binary frames. Empty input sends nothing.
    pub async fn write_binary(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut total = 0;
        for chunk in data.chunks(MTU) {
            total += self
                .write(Frame::Binary(Bytes::copy_from_slice(chunk)))
                .await?;
        }
        Ok(total)
    }

    /// Empty text frame: end of a body.
    pub async fn write_eof(&self) -> Result<(), TransportError> {
        self.write(Frame::Text(String::new())).await.map(|_| ())
    }
}

fn text_chunks(text: &str, limit: usize) -> impl Iterator<Item = &str> {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let mut end = rest.len().min(limit);
        while !rest.is_char_boundary(end) {
            end -= 1;
        }
        let (chunk, tail) = rest.split_at(end);
        rest = tail;
        Some(chunk)
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::channel::memory;

    #[test_timeout::tokio_timeout_test(10)]
    async fn write_over_high_water_waits_for_low_water() {
        let (a, mut b) = memory::pair();
        let writer = FlowControlledWriter::new(a.link.sink.clone(), a.link.low_water.clone());
        a.sink.set_buffered(MAX_BUFFERED_AMOUNT);

        let pending = tokio::spawn({
            let writer = writer.clone();
            async move { writer.write_binary(&[7u8; 10]).await }
        });

        // the frame itself goes out, the write does not return
        assert_eq!(
            b.link.frames.recv().await,
            Some(Frame::Binary(Bytes::from_static(&[7u8; 10])))
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        a.sink.set_buffered(0);
        a.link.low_water.notify_one();
        let written = pending.await.expect("join").expect("write");
        assert_eq!(written, 10);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn write_under_high_water_returns_immediately() {
        let (a, _b) = memory::pair();
        let writer = FlowControlledWriter::new(a.link.sink.clone(), a.link.low_water.clone());
        a.sink.set_buffered(MAX_BUFFERED_AMOUNT - MTU);
        assert_eq!(writer.write_binary(&vec![0u8; MTU]).await.expect("write"), MTU);
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closed_channel_unblocks_waiting_writer() {
        let (a, _b) = memory::pair();
        let writer = FlowControlledWriter::new(a.link.sink.clone(), a.link.low_water.clone());
        a.sink.set_buffered(MAX_BUFFERED_AMOUNT);
        let pending = tokio::spawn({
            let writer = writer.clone();
            async move { writer.write_binary(b"x").await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.link.close().await;
        a.link.low_water.notify_one();
        assert!(matches!(
            pending.await.expect("join"),
            Err(TransportError::ChannelClosed)
        ));
    }

    #[test_timeout::timeout]
    fn text_chunks_respect_char_boundaries() {
        let text = "aé".repeat(10);
        let chunks: Vec<_> = text_chunks(&text, 4).collect();
        assert!(chunks.iter().all(|chunk| chunk.len() <= 4));
        assert_eq!(chunks.concat(), text);
    }
}
